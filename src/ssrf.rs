//! SSRF protections for outbound fetches, per spec.md's Actor Resolver
//! algorithm and Testable Property #7: a fetch to a private/loopback/
//! link-local address or a non-standard port fails `NetworkError` without
//! establishing a connection.
//!
//! Modeled on the bogon-range classification used for peer admission in
//! other network-facing Rust services (private/loopback/link-local/
//! multicast/unspecified checks on both address families); applied here at
//! DNS resolution time via [reqwest::dns::Resolve] so a hostname cannot
//! pass validation and then resolve to a disallowed address later
//! (DNS rebinding).

use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

/// Installed as the default client's DNS resolver. Every lookup an outgoing
/// request performs goes through [SsrfGuardedResolver::resolve]; `debug`
/// mirrors [crate::config::FederationConfig]'s debug flag, the same switch
/// that allows `http://` and `localhost` elsewhere.
#[derive(Clone, Default)]
pub struct SsrfGuardedResolver {
    debug: bool,
}

impl SsrfGuardedResolver {
    /// Construct a resolver; `debug` disables the address-range checks,
    /// matching the rest of this crate's debug-mode exceptions for local
    /// development against loopback peers.
    pub fn new(debug: bool) -> Self {
        SsrfGuardedResolver { debug }
    }
}

impl Resolve for SsrfGuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let debug = self.debug;
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?
                .collect();

            if !debug {
                if let Some(blocked) = addrs.iter().find(|a| is_disallowed_address(a.ip())) {
                    return Err(format!(
                        "refusing to connect to {host}: {} is a private/loopback/link-local address",
                        blocked.ip()
                    )
                    .into());
                }
            }

            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Whether `ip` falls in a range this crate refuses to connect outbound to.
fn is_disallowed_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || is_unique_local(v6)
                || is_unicast_link_local(v6)
        }
    }
}

/// `fc00::/7`, stable nightly-only `Ipv6Addr::is_unique_local` reimplemented
/// so this builds on stable.
fn is_unique_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// `fe80::/10`, stable nightly-only `Ipv6Addr::is_unicast_link_local`
/// reimplemented so this builds on stable.
fn is_unicast_link_local(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Port allowlist for outbound fetches, per spec.md's Actor Resolver
/// algorithm: "ports outside {80, 443} unless explicitly whitelisted".
/// `debug` mirrors the same switch used for scheme/localhost exceptions.
pub fn port_allowed(url: &url::Url, debug: bool) -> bool {
    if debug {
        return true;
    }
    matches!(url.port_or_known_default(), Some(80) | Some(443))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_loopback_and_private_v4() {
        assert!(is_disallowed_address("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed_address("10.0.0.5".parse().unwrap()));
        assert!(is_disallowed_address("192.168.1.1".parse().unwrap()));
        assert!(is_disallowed_address("169.254.1.1".parse().unwrap()));
        assert!(!is_disallowed_address("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn rejects_loopback_and_link_local_v6() {
        assert!(is_disallowed_address("::1".parse().unwrap()));
        assert!(is_disallowed_address("fe80::1".parse().unwrap()));
        assert!(is_disallowed_address("fc00::1".parse().unwrap()));
        assert!(!is_disallowed_address("2606:2800:220:1:248:1893:25c8:1946".parse().unwrap()));
    }

    #[test]
    fn port_allowlist_matches_spec_defaults() {
        let https: url::Url = "https://example.com/inbox".parse().unwrap();
        let custom: url::Url = "https://example.com:8443/inbox".parse().unwrap();
        assert!(port_allowed(&https, false));
        assert!(!port_allowed(&custom, false));
        assert!(port_allowed(&custom, true));
    }
}
