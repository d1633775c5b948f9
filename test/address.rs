use netlib::address::{any_ipv4, any_ipv6, format_address, local_addresses, resolve};

use setup;

#[test]
fn any_addresses_format_numeric() {
    setup();
    assert_eq!(format_address(Some(&any_ipv4()), true), "0.0.0.0");
    assert_eq!(format_address(Some(&any_ipv6()), true), "::");
}

#[test]
fn null_address_prints_sentinel() {
    setup();
    assert_eq!(format_address(None, true), "<null>");
}

#[test]
fn port_zero_formats_without_suffix() {
    setup();
    let parsed = resolve("10.20.30.40");
    assert_eq!(parsed.len(), 1);
    assert_eq!(parsed[0].port(), 0);
    assert_eq!(format_address(Some(&parsed[0]), true), "10.20.30.40");
}

#[test]
fn numeric_roundtrip() {
    setup();
    let texts = [
        "10.0.0.1:4242",
        "10.20.30.40",
        "0.0.0.0",
        "::",
        "::1",
        "[::1]:4242",
        "2001:db8::ff00:42:8329",
        "[2001:db8::1]:80",
    ];
    for text in texts.iter() {
        let parsed = resolve(text);
        assert_eq!(parsed.len(), 1, "parsing {}", text);
        assert_eq!(format_address(Some(&parsed[0]), true), *text);
        // And the full parse(format(a)) property
        assert_eq!(resolve(&format_address(Some(&parsed[0]), true)), parsed);
    }
}

#[test]
fn port_only_resolves_any_addresses() {
    setup();
    let addrs = resolve("4242");
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().all(|addr| addr.port() == 4242));
    assert!(addrs.iter().any(|addr| addr.is_ipv4()));
    assert!(addrs.iter().any(|addr| addr.is_ipv6()));
}

#[test]
fn empty_input_fails() {
    setup();
    assert!(resolve("").is_empty());
}

#[test]
fn out_of_range_port_is_not_a_port() {
    setup();
    // 70000 cannot be a port, and is not a resolvable host either
    assert!(resolve("70000").is_empty());
}

#[test]
fn resolve_localhost() {
    setup();
    let addrs = resolve("localhost:80");
    assert!(!addrs.is_empty());
    let first = format_address(Some(&addrs[0]), true);
    assert!(
        first == "127.0.0.1:80" || first == "[::1]:80" || first.starts_with("[fe80"),
        "unexpected localhost address {}",
        first
    );
}

#[test]
fn local_addresses_include_loopback() {
    setup();
    let addrs = local_addresses().unwrap();
    assert!(!addrs.is_empty());
    assert!(addrs
        .iter()
        .any(|addr| format_address(Some(addr), true) == "127.0.0.1"));
}
