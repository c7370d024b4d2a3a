//! Rules that gate outbound HTTP requests.
//!
//! [`HttpRules`] is checked by the HTTP and GraphQL capabilities before any
//! request leaves the host. The defaults allow everything except addresses
//! that are never legitimate targets (unspecified and link-local ranges,
//! which include cloud metadata endpoints).

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::{Host, Url};

use runnr_common::CapabilityError;

const STANDARD_PORTS: [u16; 2] = [80, 443];

/// Rules governing use of an HTTP-backed capability.
///
/// Domain patterns are compared label by label from the right; a `*` label
/// matches any single label, and the left-most `*` also absorbs any deeper
/// subdomains. `*.example.com` matches `api.example.com` and
/// `a.b.example.com`, but not `example.com`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRules {
    /// When non-empty, only these domains are reachable. Takes precedence over `blocked_domains`.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default)]
    pub blocked_domains: Vec<String>,

    /// Extra ports allowed besides 80 and 443. Both port lists empty allows every port.
    #[serde(default)]
    pub allowed_ports: Vec<u16>,

    #[serde(default)]
    pub blocked_ports: Vec<u16>,

    /// Allow IP-literal hosts.
    #[serde(default = "defaults::allow", rename = "allowIPs")]
    pub allow_ips: bool,

    /// Allow hosts that are, or resolve to, private or loopback addresses.
    #[serde(default = "defaults::allow")]
    pub allow_private: bool,

    /// Allow the plain `http` scheme.
    #[serde(default = "defaults::allow", rename = "allowHTTP")]
    pub allow_http: bool,
}

impl Default for HttpRules {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            allowed_ports: Vec::new(),
            blocked_ports: Vec::new(),
            allow_ips: true,
            allow_private: true,
            allow_http: true,
        }
    }
}

impl HttpRules {
    /// Rules that only admit the given domain patterns.
    pub fn allow_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_domains: domains.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Check a URL against the rules.
    ///
    /// When `allow_private` is off, domain hosts are resolved and every
    /// resolved address is checked too.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::RuleViolation`] naming the rule that failed.
    pub async fn request_is_allowed(&self, url: &Url) -> Result<(), CapabilityError> {
        self.check_static(url)?;

        if !self.allow_private {
            if let Some(Host::Domain(domain)) = url.host() {
                let port = url.port_or_known_default().unwrap_or(443);
                // A host that does not resolve is left for the request itself to fail.
                if let Ok(addrs) = tokio::net::lookup_host((domain, port)).await {
                    for addr in addrs {
                        if is_private_ip(addr.ip()) {
                            return Err(CapabilityError::rule_violation(
                                "requests to private IP address ranges are disallowed",
                            ));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// All checks that need no DNS lookup.
    ///
    /// # Errors
    ///
    /// Returns [`CapabilityError::RuleViolation`] naming the rule that failed.
    pub fn check_static(&self, url: &Url) -> Result<(), CapabilityError> {
        if !self.allow_http && url.scheme() == "http" {
            return Err(CapabilityError::rule_violation(
                "requests to insecure HTTP endpoints are disallowed",
            ));
        }

        self.port_allowed(url)?;

        let host = url
            .host()
            .ok_or_else(|| CapabilityError::rule_violation("URL has no host"))?;

        let ip = match &host {
            Host::Ipv4(v4) => Some(IpAddr::V4(*v4)),
            Host::Ipv6(v6) => Some(IpAddr::V6(*v6)),
            Host::Domain(_) => None,
        };

        if let Some(ip) = ip {
            if !self.allow_ips {
                return Err(CapabilityError::rule_violation(
                    "requests to IP addresses are disallowed",
                ));
            }
            if is_always_denied(ip) {
                return Err(CapabilityError::rule_violation(
                    "requests to unspecified or link-local addresses are disallowed",
                ));
            }
            if !self.allow_private && is_private_ip(ip) {
                return Err(CapabilityError::rule_violation(
                    "requests to private IP address ranges are disallowed",
                ));
            }
        }

        let host = host.to_string().to_lowercase();
        if !self.allow_private && (host == "localhost" || host.ends_with(".localhost")) {
            return Err(CapabilityError::rule_violation(
                "requests to private IP address ranges are disallowed",
            ));
        }

        if !self.allowed_domains.is_empty() {
            if self
                .allowed_domains
                .iter()
                .any(|pattern| matches_domain(pattern, &host))
            {
                return Ok(());
            }
            debug!(host = %host, "host not in allowed domains");
            return Err(CapabilityError::rule_violation(
                "requests to this domain are disallowed",
            ));
        }

        if self
            .blocked_domains
            .iter()
            .any(|pattern| matches_domain(pattern, &host))
        {
            debug!(host = %host, "host is in blocked domains");
            return Err(CapabilityError::rule_violation(
                "requests to this domain are disallowed",
            ));
        }

        Ok(())
    }

    fn port_allowed(&self, url: &Url) -> Result<(), CapabilityError> {
        if self.allowed_ports.is_empty() && self.blocked_ports.is_empty() {
            return Ok(());
        }

        let disallowed = || CapabilityError::rule_violation("requests to this port are disallowed");
        let port = url.port_or_known_default().ok_or_else(disallowed)?;

        if self.blocked_ports.contains(&port) {
            return Err(disallowed());
        }
        if STANDARD_PORTS.contains(&port) || self.allowed_ports.contains(&port) {
            return Ok(());
        }
        Err(disallowed())
    }
}

/// Check if a host matches a domain pattern.
fn matches_domain(pattern: &str, host: &str) -> bool {
    let pattern = pattern.to_lowercase();
    if pattern == host {
        return true;
    }
    if pattern.is_empty() || host.is_empty() {
        return false;
    }

    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let host_parts: Vec<&str> = host.split('.').filter(|p| !p.is_empty()).collect();

    if pattern_parts.len() > host_parts.len() {
        return false;
    }

    let mut j = pattern_parts.len() - 1;
    for label in host_parts.iter().rev() {
        let p = pattern_parts[j];
        if p != "*" && p != *label {
            return false;
        }
        j = j.saturating_sub(1);
    }

    true
}

/// Unspecified (`0.0.0.0/8`, `::`) and link-local ranges.
fn is_always_denied(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.octets()[0] == 0 || v4.is_link_local(),
        IpAddr::V6(v6) => {
            v6.is_unspecified()
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| {
                    v4.octets()[0] == 0 || v4.is_link_local()
                })
        }
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

mod defaults {
    pub const fn allow() -> bool {
        true
    }
}
