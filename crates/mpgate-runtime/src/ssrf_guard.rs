//! Destination checks for outbound URLs that arrive from remote parties.
//!
//! Every address is classified before a connection is attempted. Domains are resolved and
//! rejected when any resolved address falls outside the public range.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::net::lookup_host;
use url::{Host, Url};

const METADATA_IPV4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);
const METADATA_IPV6: Ipv6Addr = Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254);
const METADATA_HOSTNAMES: &[&str] = &[
    "metadata",
    "metadata.google.internal",
    "metadata.azure.internal",
    "instance-data",
    "instance-data.ec2.internal",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SsrfProtectionConfig {
    /// Master switch; `false` skips every check.
    pub enabled: bool,
    pub allow_http: bool,
    /// Lets loopback, RFC 1918, link-local and CGNAT destinations through.
    /// Cloud metadata endpoints stay blocked either way.
    pub allow_private_network: bool,
}

impl Default for SsrfProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_http: true,
            allow_private_network: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsrfReason {
    InvalidUrl,
    Scheme,
    Metadata,
    PrivateNetwork,
    Unspecified,
    Multicast,
    Reserved,
    DnsResolution,
}

impl SsrfReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "fetch_ssrf_invalid_url",
            Self::Scheme => "fetch_ssrf_blocked_scheme",
            Self::Metadata => "fetch_ssrf_blocked_metadata_endpoint",
            Self::PrivateNetwork => "fetch_ssrf_blocked_private_network",
            Self::Unspecified => "fetch_ssrf_blocked_unspecified_ip",
            Self::Multicast => "fetch_ssrf_blocked_multicast",
            Self::Reserved => "fetch_ssrf_blocked_reserved_range",
            Self::DnsResolution => "fetch_ssrf_dns_resolution_failed",
        }
    }
}

impl fmt::Display for SsrfReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {detail}")]
pub struct SsrfViolation {
    pub reason: SsrfReason,
    pub detail: String,
}

impl SsrfViolation {
    fn new(reason: SsrfReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn reason_code(&self) -> &'static str {
        self.reason.as_str()
    }
}

/// Where an address sits relative to the public internet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddressClass {
    Public,
    Private,
    Metadata,
    Unspecified,
    Multicast,
    Reserved,
}

/// Classifies `ip`, looking through IPv4-mapped and NAT64 IPv6 forms first.
pub(crate) fn classify_ip(ip: IpAddr) -> AddressClass {
    match embedded_ipv4(ip) {
        IpAddr::V4(ipv4) => classify_ipv4(ipv4),
        IpAddr::V6(ipv6) => classify_ipv6(ipv6),
    }
}

/// Renders `url` as `scheme://host[:port]/path`, dropping credentials, query and fragment.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    redacted.set_query(None);
    redacted.set_fragment(None);
    let _ = redacted.set_username("");
    let _ = redacted.set_password(None);
    redacted.to_string()
}

/// [`redact_url`] for text that may not parse; anything after `?` or `#` is dropped.
pub fn redact_raw_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => redact_url(&url),
        Err(_) => raw.split(['?', '#']).next().unwrap_or_default().to_string(),
    }
}

fn embedded_ipv4(ip: IpAddr) -> IpAddr {
    let IpAddr::V6(ipv6) = ip else {
        return ip;
    };
    if let Some(ipv4) = ipv6.to_ipv4_mapped() {
        return IpAddr::V4(ipv4);
    }
    let segments = ipv6.segments();
    let nat64 = segments[0] == 0x0064
        && segments[1] == 0xff9b
        && segments[2..6].iter().all(|segment| *segment == 0);
    if nat64 {
        let [.., a, b, c, d] = ipv6.octets();
        return IpAddr::V4(Ipv4Addr::new(a, b, c, d));
    }
    ip
}

fn classify_ipv4(ip: Ipv4Addr) -> AddressClass {
    let [first, second, third, _] = ip.octets();
    if ip == METADATA_IPV4 {
        AddressClass::Metadata
    } else if ip.is_unspecified() {
        AddressClass::Unspecified
    } else if ip.is_multicast() {
        AddressClass::Multicast
    } else if first == 0
        || first >= 240
        || (first, second, third) == (192, 0, 0)
        || (first == 198 && (second & 0xfe) == 18)
        || ip.is_documentation()
    {
        AddressClass::Reserved
    } else if ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || (first == 100 && (64..=127).contains(&second))
    {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn classify_ipv6(ip: Ipv6Addr) -> AddressClass {
    let head = ip.segments()[0];
    if ip == METADATA_IPV6 {
        AddressClass::Metadata
    } else if ip.is_unspecified() {
        AddressClass::Unspecified
    } else if ip.is_multicast() {
        AddressClass::Multicast
    } else if head == 0x2001 && ip.segments()[1] == 0x0db8 {
        AddressClass::Reserved
    } else if ip.is_loopback() || (head & 0xfe00) == 0xfc00 || (head & 0xffc0) == 0xfe80 {
        AddressClass::Private
    } else {
        AddressClass::Public
    }
}

fn is_local_hostname(host: &str) -> bool {
    host == "localhost" || host.ends_with(".localhost") || host.ends_with(".local")
}

#[derive(Debug, Clone)]
pub struct SsrfGuard {
    config: SsrfProtectionConfig,
}

impl SsrfGuard {
    pub fn new(config: SsrfProtectionConfig) -> Self {
        Self { config }
    }

    pub async fn parse_and_validate_url(&self, raw_url: &str) -> Result<Url, SsrfViolation> {
        let url = Url::parse(raw_url).map_err(|error| {
            SsrfViolation::new(SsrfReason::InvalidUrl, format!("'{}': {error}", redact_raw_url(raw_url)))
        })?;
        self.validate_url(&url).await?;
        Ok(url)
    }

    /// Checks scheme and host, then every address the host resolves to.
    pub async fn validate_url(&self, url: &Url) -> Result<(), SsrfViolation> {
        if !self.config.enabled {
            return Ok(());
        }
        match url.scheme() {
            "https" => {}
            "http" if self.config.allow_http => {}
            scheme => {
                return Err(SsrfViolation::new(
                    SsrfReason::Scheme,
                    format!(
                        "scheme '{scheme}' is not allowed for '{}'",
                        redact_url(url)
                    ),
                ))
            }
        }
        match url.host() {
            Some(Host::Ipv4(ipv4)) => self.check_address(IpAddr::V4(ipv4)),
            Some(Host::Ipv6(ipv6)) => self.check_address(IpAddr::V6(ipv6)),
            Some(Host::Domain(domain)) => {
                let domain = domain.trim_end_matches('.').to_ascii_lowercase();
                self.check_hostname(&domain)?;
                self.check_resolved(url, &domain).await
            }
            None => Err(SsrfViolation::new(
                SsrfReason::InvalidUrl,
                format!("'{}' has no host", redact_url(url)),
            )),
        }
    }

    fn check_hostname(&self, domain: &str) -> Result<(), SsrfViolation> {
        if domain.is_empty() {
            return Err(SsrfViolation::new(SsrfReason::InvalidUrl, "empty host"));
        }
        if METADATA_HOSTNAMES.contains(&domain) {
            return Err(SsrfViolation::new(
                SsrfReason::Metadata,
                format!("host '{domain}' is a metadata endpoint"),
            ));
        }
        if is_local_hostname(domain) && !self.config.allow_private_network {
            return Err(SsrfViolation::new(
                SsrfReason::PrivateNetwork,
                format!("host '{domain}' is local-only"),
            ));
        }
        Ok(())
    }

    async fn check_resolved(&self, url: &Url, domain: &str) -> Result<(), SsrfViolation> {
        let port = url.port_or_known_default().ok_or_else(|| {
            SsrfViolation::new(SsrfReason::InvalidUrl, format!("'{}' has no known port", redact_url(url)))
        })?;
        let addresses = lookup_host((domain, port))
            .await
            .map_err(|error| {
                SsrfViolation::new(
                    SsrfReason::DnsResolution,
                    format!("resolving '{domain}': {error}"),
                )
            })?
            .collect::<Vec<_>>();
        if addresses.is_empty() {
            return Err(SsrfViolation::new(
                SsrfReason::DnsResolution,
                format!("'{domain}' resolved to no addresses"),
            ));
        }
        addresses
            .into_iter()
            .try_for_each(|address| self.check_address(address.ip()))
    }

    fn check_address(&self, ip: IpAddr) -> Result<(), SsrfViolation> {
        let reason = match classify_ip(ip) {
            AddressClass::Public => return Ok(()),
            AddressClass::Private if self.config.allow_private_network => return Ok(()),
            AddressClass::Private => SsrfReason::PrivateNetwork,
            AddressClass::Metadata => SsrfReason::Metadata,
            AddressClass::Unspecified => SsrfReason::Unspecified,
            AddressClass::Multicast => SsrfReason::Multicast,
            AddressClass::Reserved => SsrfReason::Reserved,
        };
        Err(SsrfViolation::new(
            reason,
            format!("destination address {ip} is blocked"),
        ))
    }
}
