// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 netstack Contributors

// Network utility functions

use std::net::IpAddr;

/// Environment variables pointed at the local SOCKS listener
pub const PROXY_ENV_VARS: [&str; 4] = ["ALL_PROXY", "all_proxy", "http_proxy", "https_proxy"];

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Unparseable hosts are treated as reachable from the network
    false
}

/// Format host and port, bracketing IPv6 literals
pub fn format_host_port(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{}]:{}", host, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Proxy URL for the local listener; `socks5h` resolves names on the proxy side
pub fn socks_proxy_url(host: &str, port: u16) -> String {
    format!("socks5h://{}", format_host_port(host, port))
}

/// (name, value) pairs to inject into a proxied shell's environment
pub fn proxy_env(host: &str, port: u16) -> Vec<(&'static str, String)> {
    let url = socks_proxy_url(host, port);
    PROXY_ENV_VARS
        .iter()
        .map(|name| (*name, url.clone()))
        .collect()
}
