use http::HeaderMap;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};

/// CIDR blocks that never identify the real client: loopback, RFC 1918,
/// link-local and their IPv6 counterparts.
const PRIVATE_BLOCKS: [&str; 8] = [
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "169.254.0.0/16",
    "::1/128",
    "fc00::/7",
    "fe80::/10",
];

fn is_private(ip: IpAddr) -> bool {
    PRIVATE_BLOCKS.iter().any(|block| {
        block
            .parse::<IpNetwork>()
            .map(|net| net.contains(ip))
            .unwrap_or(false)
    })
}

/// Resolve the client address the way a proxy chain reports it: the first
/// public entry of `X-Forwarded-For`, falling back to `X-Real-IP`, falling
/// back to the TCP peer.
pub fn resolve(headers: &HeaderMap, peer: SocketAddr) -> String {
    let x_real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let x_forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if x_real_ip.is_empty() && x_forwarded_for.is_empty() {
        return peer.ip().to_string();
    }

    for candidate in x_forwarded_for.split(',') {
        let candidate = candidate.trim();
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            if !is_private(ip) {
                return candidate.to_string();
            }
        }
    }

    if !x_real_ip.is_empty() {
        x_real_ip.to_string()
    } else {
        peer.ip().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.0.2.7:41000".parse().unwrap()
    }

    #[test]
    fn test_no_headers_uses_peer() {
        let headers = HeaderMap::new();
        assert_eq!(resolve(&headers, peer()), "192.0.2.7");
    }

    #[test]
    fn test_forwarded_for_skips_private_entries() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "10.0.0.4, 172.16.1.9, 203.0.113.5".parse().unwrap(),
        );
        assert_eq!(resolve(&headers, peer()), "203.0.113.5");
    }

    #[test]
    fn test_all_private_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.4, 192.168.1.1".parse().unwrap());
        headers.insert("x-real-ip", "198.51.100.2".parse().unwrap());
        assert_eq!(resolve(&headers, peer()), "198.51.100.2");
    }

    #[test]
    fn test_ipv6_private_skipped() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "fe80::1, 2001:db8::5".parse().unwrap(),
        );
        assert_eq!(resolve(&headers, peer()), "2001:db8::5");
    }
}
