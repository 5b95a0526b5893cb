//! Client address resolution and network range classification.

use std::net::{IpAddr, SocketAddr};
use std::sync::LazyLock;

use axum::http::HeaderMap;
use ipnetwork::IpNetwork;

use crate::error::{Result, TollgateError};

/// Loopback, RFC 1918 and unique local ranges.
const PRIVATE_CIDRS: &[&str] = &[
    "127.0.0.0/8",
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "fc00::/7",
];

static PRIVATE_RANGES: LazyLock<Vec<IpNetwork>> = LazyLock::new(|| {
    PRIVATE_CIDRS
        .iter()
        .filter_map(|cidr| cidr.parse().ok())
        .collect()
});

/// The fixed set of private network ranges.
pub fn private_ranges() -> &'static [IpNetwork] {
    &PRIVATE_RANGES
}

/// Returns `true` if `addr` falls in any of `ranges`.
pub fn in_ranges(addr: IpAddr, ranges: &[IpNetwork]) -> bool {
    let addr = addr.to_canonical();
    ranges.iter().any(|range| range.contains(addr))
}

pub fn is_private(addr: IpAddr) -> bool {
    in_ranges(addr, private_ranges())
}

/// Parse a CIDR string such as `10.0.0.0/8`.
pub fn parse_cidr(value: &str) -> Result<IpNetwork> {
    value
        .parse()
        .map_err(|e| TollgateError::Config(format!("cannot parse CIDR '{}': {}", value, e)))
}

/// Determines the address of the client that sent a request.
///
/// Proxy headers are only consulted when `trust_proxy` is set; otherwise a
/// client could pick its own bucket by sending a forged header.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressResolver {
    trust_proxy: bool,
}

impl AddressResolver {
    pub fn new(trust_proxy: bool) -> Self {
        Self { trust_proxy }
    }

    pub fn resolve(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Result<IpAddr> {
        if self.trust_proxy {
            if let Some(addr) = forwarded_for(headers).or_else(|| real_ip(headers)) {
                return Ok(addr.to_canonical());
            }
        }

        peer.map(|peer| peer.ip().to_canonical()).ok_or_else(|| {
            TollgateError::AddressResolution("no client address available".to_string())
        })
    }
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    value.split(',').next().and_then(parse_addr)
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get("x-real-ip")?.to_str().ok()?;
    parse_addr(value)
}

fn parse_addr(value: &str) -> Option<IpAddr> {
    let value = value.trim();
    value
        .parse::<IpAddr>()
        .ok()
        .or_else(|| value.parse::<SocketAddr>().ok().map(|s| s.ip()))
}
