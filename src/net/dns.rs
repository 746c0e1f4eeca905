//! Forward and reverse name resolution.
//!
//! Forward resolution always goes through one async path; numeric literals
//! short-circuit inside it so callers never branch on address syntax.
//! Reverse resolution is best effort and never affects up/down status.

use crate::error::{DiscoveryError, Result};
use std::net::{IpAddr, SocketAddr};

/// Resolve `host` to the first usable socket address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| DiscoveryError::Dns(host.to_string()))?;
    addrs
        .next()
        .ok_or_else(|| DiscoveryError::Dns(host.to_string()))
}

/// Reverse-resolve `ip` to a host name. Returns an empty string when the
/// address has no PTR record or the lookup fails.
pub async fn reverse_lookup(ip: IpAddr) -> String {
    tokio::task::spawn_blocking(move || reverse_lookup_blocking(ip).unwrap_or_default())
        .await
        .unwrap_or_default()
}

fn reverse_lookup_blocking(ip: IpAddr) -> Option<String> {
    const NI_MAXHOST: usize = 1025;
    let mut host = [0 as libc::c_char; NI_MAXHOST];

    let rc = match ip {
        IpAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: 0,
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                libc::getnameinfo(
                    &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
        IpAddr::V6(v6) => {
            let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_addr = libc::in6_addr {
                s6_addr: v6.octets(),
            };
            unsafe {
                libc::getnameinfo(
                    &sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                    host.as_mut_ptr(),
                    host.len() as libc::socklen_t,
                    std::ptr::null_mut(),
                    0,
                    libc::NI_NAMEREQD,
                )
            }
        }
    };

    if rc != 0 {
        return None;
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(host.as_ptr()) };
    cstr.to_str().ok().map(|s| s.to_string())
}
