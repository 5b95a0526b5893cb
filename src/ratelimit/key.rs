//! Bucket key generation.

use std::fmt;
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use super::rules::Resource;
use crate::error::{Result, TollgateError};

/// A key that uniquely identifies one bucket.
///
/// The key is composed of the resource identity and the client
/// discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    /// Method and path of the protected resource
    pub resource: String,
    /// Client address, or the client's network when grouping by prefix
    pub client: String,
}

impl BucketKey {
    pub fn new(resource: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            client: client.into(),
        }
    }

    /// Convert the key to its string representation.
    pub fn to_string_key(&self) -> String {
        format!("{}|{}", self.resource, self.client)
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Derives the keys a request is checked against.
///
/// By default every client address gets its own key. Shorter prefix
/// lengths group all clients of a network under one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBuilder {
    ipv4_prefix: u8,
    ipv6_prefix: u8,
}

impl KeyBuilder {
    pub fn new(ipv4_prefix: u8, ipv6_prefix: u8) -> Result<Self> {
        if ipv4_prefix > 32 {
            return Err(TollgateError::Config(format!(
                "ipv4 prefix length {} exceeds 32",
                ipv4_prefix
            )));
        }
        if ipv6_prefix > 128 {
            return Err(TollgateError::Config(format!(
                "ipv6 prefix length {} exceeds 128",
                ipv6_prefix
            )));
        }
        Ok(Self {
            ipv4_prefix,
            ipv6_prefix,
        })
    }

    /// Build the keys for `resource` requested by `client`.
    pub fn build_keys(&self, resource: &Resource, client: IpAddr) -> Vec<BucketKey> {
        vec![BucketKey::new(resource.identity(), self.discriminator(client))]
    }

    fn discriminator(&self, client: IpAddr) -> String {
        let prefix = match client {
            IpAddr::V4(_) if self.ipv4_prefix < 32 => self.ipv4_prefix,
            IpAddr::V6(_) if self.ipv6_prefix < 128 => self.ipv6_prefix,
            _ => return client.to_string(),
        };

        // Prefix lengths are validated in `new`.
        match IpNetwork::new(client, prefix) {
            Ok(network) => format!("{}/{}", network.network(), prefix),
            Err(_) => client.to_string(),
        }
    }
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self {
            ipv4_prefix: 32,
            ipv6_prefix: 128,
        }
    }
}
