//! Thin wrappers over the handful of POSIX calls that the socket layer needs
//! and `socket2` does not expose: the `FIONREAD` availability probe, bounded
//! single-descriptor waits, interface enumeration and reverse name lookup.

use std::ffi::CStr;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use libc;

const NI_MAXHOST: usize = 1025;

/// Outcome of a zero-timeout probe on a descriptor with a connect in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectProbe {
    /// Connect still in progress
    Pending,
    /// Descriptor became writable, connect completed
    Connected,
    /// Descriptor reports an error condition
    Error,
}

/// Number of bytes available for reading without blocking, or `None` when the
/// descriptor no longer answers the probe (closed or invalid).
pub fn available(fd: RawFd) -> Option<usize> {
    if fd < 0 {
        return None;
    }
    let mut bytes: libc::c_int = 0;
    let res = unsafe { libc::ioctl(fd, libc::FIONREAD as libc::c_ulong, &mut bytes) };
    if res < 0 {
        None
    } else {
        Some(bytes as usize)
    }
}

fn wait_fd(fd: RawFd, events: libc::c_short, timeout: Option<Duration>) -> io::Result<libc::c_short> {
    let mut pollfd = libc::pollfd {
        fd: fd,
        events: events,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pollfd, 1, millis(timeout)) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else if ret == 0 {
        Ok(0)
    } else {
        Ok(pollfd.revents)
    }
}

/// Wait until the descriptor is readable. `Ok(false)` means the wait timed out.
pub fn await_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    wait_fd(fd, libc::POLLIN, timeout).map(|revents| revents != 0)
}

/// Wait until the descriptor is writable. `Ok(false)` means the wait timed out.
pub fn await_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    wait_fd(fd, libc::POLLOUT, timeout).map(|revents| revents != 0)
}

/// Zero-timeout probe used to refine the `Connecting` state.
pub fn connect_probe(fd: RawFd) -> ConnectProbe {
    match wait_fd(fd, libc::POLLOUT, Some(Duration::new(0, 0))) {
        Ok(revents) if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 => ConnectProbe::Error,
        Ok(revents) if revents & libc::POLLOUT != 0 => ConnectProbe::Connected,
        Ok(_) => ConnectProbe::Pending,
        Err(_) => ConnectProbe::Error,
    }
}

/// Enumerate interface addresses as `(address, interface-is-up)` pairs.
pub fn interface_addresses() -> io::Result<Vec<(SocketAddr, bool)>> {
    let mut ifap: *mut libc::ifaddrs = ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut addresses = Vec::new();
    let mut cursor = ifap;
    while !cursor.is_null() {
        unsafe {
            let ifa = &*cursor;
            if !ifa.ifa_addr.is_null() {
                if let Some(address) = sockaddr_to_addr(ifa.ifa_addr) {
                    let up = ifa.ifa_flags & libc::IFF_UP as libc::c_uint != 0;
                    addresses.push((address, up));
                }
            }
            cursor = ifa.ifa_next;
        }
    }
    unsafe { libc::freeifaddrs(ifap) };

    Ok(addresses)
}

/// Reverse-lookup the host name for an address. May block on a resolver
/// round trip; `None` when the lookup fails.
pub fn reverse_lookup(address: &SocketAddr) -> Option<String> {
    let (storage, len) = addr_to_raw(address);
    let mut host = [0 as libc::c_char; NI_MAXHOST];
    let ret = unsafe {
        libc::getnameinfo(
            &storage as *const _ as *const libc::sockaddr,
            len,
            host.as_mut_ptr(),
            host.len() as libc::socklen_t,
            ptr::null_mut(),
            0,
            0,
        )
    };
    if ret != 0 {
        return None;
    }
    let host = unsafe { CStr::from_ptr(host.as_ptr()) };
    host.to_str().ok().map(|name| name.to_owned())
}

fn millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        Some(duration) => {
            let ms = duration
                .as_secs()
                .saturating_mul(1000)
                .saturating_add(u64::from(duration.subsec_nanos()) / 1_000_000);
            if ms > libc::c_int::max_value() as u64 {
                libc::c_int::max_value()
            } else {
                ms as libc::c_int
            }
        }
        None => -1,
    }
}

unsafe fn sockaddr_to_addr(sa: *const libc::sockaddr) -> Option<SocketAddr> {
    match (*sa).sa_family as libc::c_int {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn addr_to_raw(address: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match *address {
        SocketAddr::V4(ref v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(ref v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
