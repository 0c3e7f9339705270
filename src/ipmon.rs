//! IPv4 address monitor.
//!
//! A dedicated OS thread reads rtnetlink address messages and posts
//! events into the dispatcher channel when the WiFi interface gains or
//! loses an IPv4 address. The thread lives for the process lifetime;
//! individual recv failures are skipped, not fatal.

use std::ffi::CStr;
use std::mem;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatcher::Event;

/// rtnetlink multicast group for IPv4 address changes.
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

/// Size of `struct nlmsghdr` (len u32, type u16, flags u16, seq u32, pid u32).
const NLMSG_HDRLEN: usize = 16;
/// Offset of `ifa_index` within `struct ifaddrmsg`.
const IFA_INDEX_OFFSET: usize = 4;
/// Size of `struct ifaddrmsg`.
const IFADDRMSG_LEN: usize = 8;

/// One parsed address-change message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrMessage {
    pub added: bool,
    pub family: u8,
    pub ifindex: u32,
}

/// Start the monitor thread. Failures to spawn or to open the socket are
/// logged; the daemon keeps running without address events.
pub fn spawn(ifname: String, events: mpsc::Sender<Event>) {
    let result = std::thread::Builder::new()
        .name("ipmon".into())
        .spawn(move || monitor_loop(&ifname, events));

    if let Err(e) = result {
        warn!("ip_monitor: failed to spawn thread: {}", e);
    }
}

fn monitor_loop(ifname: &str, events: mpsc::Sender<Event>) {
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if fd < 0 {
        warn!("ip_monitor: failed to open netlink socket");
        return;
    }

    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = RTMGRP_IPV4_IFADDR;

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        warn!("ip_monitor: netlink bind failed");
        unsafe { libc::close(fd) };
        return;
    }

    info!("ip_monitor: waiting for IPv4 address events");

    let mut buf = [0u8; 4096];
    loop {
        let len = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if len <= 0 {
            continue;
        }

        for msg in parse_addr_messages(&buf[..len as usize]) {
            if msg.family != libc::AF_INET as u8 {
                continue;
            }
            let Some(name) = index_to_name(msg.ifindex) else {
                continue;
            };
            if name != ifname {
                continue;
            }

            let event = if msg.added {
                Event::Ipv4Ready
            } else {
                Event::Ipv4Removed
            };

            // The dispatcher owns all state; this thread only posts.
            if events.blocking_send(event).is_err() {
                return;
            }
        }
    }
}

/// Walk a netlink receive buffer and pull out the address-change messages.
///
/// Manual header parsing (native-endian field reads, 4-byte message
/// alignment) so no unaligned struct casts are needed. Truncated or
/// malformed trailing data ends the walk.
pub fn parse_addr_messages(buf: &[u8]) -> Vec<AddrMessage> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= buf.len() {
        let msg_len =
            u32::from_ne_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        let msg_type = u16::from_ne_bytes(buf[offset + 4..offset + 6].try_into().unwrap());

        if msg_len < NLMSG_HDRLEN || offset + msg_len > buf.len() {
            break;
        }

        if (msg_type == RTM_NEWADDR || msg_type == RTM_DELADDR)
            && msg_len >= NLMSG_HDRLEN + IFADDRMSG_LEN
        {
            let body = offset + NLMSG_HDRLEN;
            let family = buf[body];
            let ifindex = u32::from_ne_bytes(
                buf[body + IFA_INDEX_OFFSET..body + IFA_INDEX_OFFSET + 4]
                    .try_into()
                    .unwrap(),
            );

            messages.push(AddrMessage {
                added: msg_type == RTM_NEWADDR,
                family,
                ifindex,
            });
        }

        // NLMSG_ALIGN
        offset += (msg_len + 3) & !3;
    }

    messages
}

fn index_to_name(ifindex: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ret.is_null() {
        return None;
    }

    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    name.to_str().ok().map(str::to_owned)
}
