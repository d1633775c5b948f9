//! Network address parsing, formatting and local interface enumeration.
//!
//! Endpoints are plain `std::net::SocketAddr` values. This module supplies
//! the textual surface around them: `resolve` turns text (numeric forms, a
//! bare port, or a host name handed to the system resolver) into a list of
//! addresses, `format_address` renders an address back to text, and
//! `local_addresses` enumerates the usable adapter addresses of this host.

use std::cmp;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

use sys;

/// Address family of a socket endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl Family {
    /// Family of the given address.
    pub fn of(address: &SocketAddr) -> Family {
        match *address {
            SocketAddr::V4(..) => Family::Ipv4,
            SocketAddr::V6(..) => Family::Ipv6,
        }
    }
}

/// The IPv4 "any" address, `0.0.0.0` with port 0.
pub fn any_ipv4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0))
}

/// The IPv6 "any" address, `::` with port 0.
pub fn any_ipv6() -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 0, 0, 0))
}

/// Resolve a textual address into a list of endpoint addresses.
///
/// Accepted forms: numeric IPv4 (`a.b.c.d`, `a.b.c.d:port`), numeric IPv6
/// (compressed hex, `[addr]:port`), a bare port number (yields the any
/// address of both families with that port), or a host name with optional
/// `:port` suffix which is handed to the system resolver. An unresolvable
/// or empty input yields an empty list.
pub fn resolve(text: &str) -> Vec<SocketAddr> {
    if text.is_empty() {
        warn!("Unable to resolve empty network address");
        return Vec::new();
    }

    // Bare port number binds the any address of both families
    if text.bytes().all(|byte| byte >= b'0' && byte <= b'9') {
        if let Ok(port) = text.parse::<u16>() {
            if port > 0 {
                let mut any4 = any_ipv4();
                let mut any6 = any_ipv6();
                any4.set_port(port);
                any6.set_port(port);
                return vec![any4, any6];
            }
        }
        // Out-of-range ports fall through and resolve as a host name
    }

    let (host, port) = split_host_port(text);

    // Numeric addresses never touch the resolver
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return vec![SocketAddr::V4(SocketAddrV4::new(ip, port))];
    }
    if let Ok(ip) = host.parse::<Ipv6Addr>() {
        return vec![SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))];
    }

    match (host, port).to_socket_addrs() {
        Ok(addresses) => addresses.collect(),
        Err(err) => {
            warn!("Unable to resolve network address '{}': {}", text, err);
            Vec::new()
        }
    }
}

/// Split a trailing `:port` suffix off a textual address.
///
/// An IPv6 numeric form carries more than one `:`, so a port is then only
/// recognized in the bracketed `[addr]:port` form. A suffix that does not
/// parse as a port number is left on the host.
fn split_host_port(text: &str) -> (&str, u16) {
    let mut portdelim = text.rfind(':');

    let numeric = text
        .bytes()
        .all(|byte| b"0123456789abcdefABCDEF.:[]".contains(&byte));
    if numeric {
        if let Some(delim) = portdelim {
            if text.find(':') != Some(delim) {
                let bytes = text.as_bytes();
                if bytes[0] != b'[' || bytes[delim - 1] != b']' {
                    portdelim = None;
                }
            }
        }
    }

    if let Some(delim) = portdelim {
        if let Ok(port) = text[delim + 1..].parse::<u16>() {
            let mut host = &text[..delim];
            if host.starts_with('[') && host.ends_with(']') {
                host = &host[1..host.len() - 1];
            }
            return (host, port);
        }
    }
    (text, 0)
}

/// Format an address as text.
///
/// `None` prints as `<null>`. A non-zero port is appended, with the IPv6
/// host bracketed. With `numeric` set the host is printed in numeric form
/// (dotted quad, RFC 5952 hex); otherwise a reverse lookup replaces the
/// host portion, which may block on a resolver round trip, and a failed
/// lookup prints as `<invalid address>`. Call sites should default to
/// `numeric = true`.
pub fn format_address(address: Option<&SocketAddr>, numeric: bool) -> String {
    let address = match address {
        Some(address) => address,
        None => return String::from("<null>"),
    };

    let host = if numeric {
        Some(numeric_host(address))
    } else {
        sys::reverse_lookup(address)
    };
    let host = match host {
        Some(host) => host,
        None => return String::from("<invalid address>"),
    };

    match *address {
        SocketAddr::V4(ref v4) if v4.port() != 0 => format!("{}:{}", host, v4.port()),
        SocketAddr::V6(ref v6) if v6.port() != 0 => format!("[{}]:{}", host, v6.port()),
        _ => host,
    }
}

fn numeric_host(address: &SocketAddr) -> String {
    match *address {
        SocketAddr::V4(ref v4) => v4.ip().to_string(),
        SocketAddr::V6(ref v6) => {
            if v6.scope_id() != 0 {
                format!("{}%{}", v6.ip(), v6.scope_id())
            } else {
                v6.ip().to_string()
            }
        }
    }
}

/// Enumerate the usable addresses of the local host's network adapters.
///
/// Interfaces that are administratively down are excluded, as are
/// link-local IPv6 addresses without a scope id and multicast addresses.
pub fn local_addresses() -> io::Result<Vec<SocketAddr>> {
    let raw = match sys::interface_addresses() {
        Ok(raw) => raw,
        Err(err) => {
            error!("Unable to get interface addresses: {}", err);
            return Err(err);
        }
    };

    let mut addresses = Vec::with_capacity(cmp::min(raw.len(), 16));
    for (address, up) in raw {
        if !up {
            continue;
        }
        if address.ip().is_multicast() {
            continue;
        }
        if let SocketAddr::V6(ref v6) = address {
            // Link-local addresses are unusable without a scope
            if is_link_local(v6.ip()) && v6.scope_id() == 0 {
                continue;
            }
        }
        addresses.push(address);
    }
    Ok(addresses)
}

fn is_link_local(ip: &Ipv6Addr) -> bool {
    ip.segments()[0] & 0xffc0 == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::split_host_port;

    #[test]
    fn port_split() {
        assert_eq!(split_host_port("10.0.0.1:4242"), ("10.0.0.1", 4242));
        assert_eq!(split_host_port("10.0.0.1"), ("10.0.0.1", 0));
        assert_eq!(split_host_port("[::1]:4242"), ("::1", 4242));
        assert_eq!(split_host_port("::1"), ("::1", 0));
        assert_eq!(split_host_port("fe80::1:80"), ("fe80::1:80", 0));
        assert_eq!(split_host_port("example.com:80"), ("example.com", 80));
        assert_eq!(split_host_port("example.com:http"), ("example.com:http", 0));
    }
}
