//! Rate limit rules configuration and matching.
//!
//! Rules come either from the YAML configuration or from a directive file
//! (see [`super::directive`]). Both are validated into [`Rule`] values
//! before any request is served.

use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use axum::http::Method;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::bucket::{Limit, Unit};
use crate::error::{Result, TollgateError};
use crate::net;

/// Path prefix marking a resource that bypasses all rate limiting.
pub const EXEMPT_MARKER: char = '^';

/// Retention is this many times the longest refill horizon of any rule.
const RETENTION_MULTIPLIER: u32 = 2;

/// HTTP method a resource applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatch {
    /// `*`, matches every method
    Any,
    Method(Method),
}

impl MethodMatch {
    pub fn parse(value: &str) -> Result<Self> {
        if value == "*" {
            return Ok(MethodMatch::Any);
        }
        Method::from_bytes(value.to_ascii_uppercase().as_bytes())
            .map(MethodMatch::Method)
            .map_err(|_| TollgateError::Config(format!("invalid HTTP method '{}'", value)))
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodMatch::Any => true,
            MethodMatch::Method(m) => m == method,
        }
    }
}

impl fmt::Display for MethodMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodMatch::Any => f.write_str("*"),
            MethodMatch::Method(m) => f.write_str(m.as_str()),
        }
    }
}

/// A request path pattern.
///
/// Patterns are case-sensitive prefixes. `/` and the empty pattern match
/// every path, and a trailing `*` matches any remainder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern(String);

impl PathPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn matches(&self, path: &str) -> bool {
        let base = self.0.strip_suffix('*').unwrap_or(&self.0);
        if base.is_empty() || base == "/" {
            return true;
        }
        path.starts_with(base)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A method and path protected (or exempted) by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub method: MethodMatch,
    pub path: PathPattern,
    /// Matching requests skip rate limiting entirely
    pub exempt: bool,
}

impl Resource {
    /// Create a resource, treating a leading `^` on `path` as the exemption
    /// marker.
    pub fn new(method: MethodMatch, path: &str) -> Self {
        match path.strip_prefix(EXEMPT_MARKER) {
            Some(stripped) => Self {
                method,
                path: PathPattern::new(stripped),
                exempt: true,
            },
            None => Self {
                method,
                path: PathPattern::new(path),
                exempt: false,
            },
        }
    }

    pub fn parse(method: &str, path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(TollgateError::Config("resource path must not be empty".into()));
        }
        Ok(Self::new(MethodMatch::parse(method)?, path))
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.matches(method) && self.path.matches(path)
    }

    /// Stable identity of this resource used in bucket keys.
    pub fn identity(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// A validated rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub limit: Limit,
    pub resources: Vec<Resource>,
    /// Private ranges that stay subject to this rule
    pub allow_local_ips: Vec<IpNetwork>,
}

impl Rule {
    pub fn new(limit: Limit, resources: Vec<Resource>, allow_local_ips: Vec<IpNetwork>) -> Result<Self> {
        if resources.is_empty() {
            return Err(TollgateError::Config("rule has no resources".into()));
        }
        Ok(Self {
            limit,
            resources,
            allow_local_ips,
        })
    }

    /// Whether this rule is enforced for `client`.
    ///
    /// Private addresses are exempt unless an allow-list entry covers them.
    pub fn applies_to(&self, client: IpAddr) -> bool {
        net::in_ranges(client, &self.allow_local_ips) || !net::is_private(client)
    }

    /// How long an idle bucket of this rule takes to become
    /// indistinguishable from a fresh one.
    fn refill_horizon(&self) -> Duration {
        self.limit.unit().duration().max(self.limit.time_to_full())
    }
}

/// Serialized form of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Tokens granted per unit of time
    pub rate: u64,
    /// Maximum tokens a bucket may hold
    pub burst: u64,
    pub unit: Unit,
    /// CIDRs of private clients that remain rate limited
    #[serde(default)]
    pub allow_local_ips: Vec<String>,
    pub resources: Vec<ResourceConfig>,
}

/// Serialized form of a resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
}

fn default_method() -> String {
    "*".to_string()
}

impl TryFrom<RuleConfig> for Rule {
    type Error = TollgateError;

    fn try_from(config: RuleConfig) -> Result<Self> {
        let limit = Limit::new(config.rate, config.burst, config.unit)?;
        let resources = config
            .resources
            .iter()
            .map(|r| Resource::parse(&r.method, &r.path))
            .collect::<Result<Vec<_>>>()?;
        let allow_local_ips = config
            .allow_local_ips
            .iter()
            .map(|cidr| net::parse_cidr(cidr))
            .collect::<Result<Vec<_>>>()?;
        Rule::new(limit, resources, allow_local_ips)
    }
}

#[derive(Deserialize)]
struct RulesDocument {
    rules: Vec<RuleConfig>,
}

/// The ordered set of rules a gate enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn from_configs(configs: Vec<RuleConfig>) -> Result<Self> {
        let rules = configs
            .into_iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(rules))
    }

    /// Load rules from a file.
    ///
    /// `.yaml` and `.yml` files are read as YAML, anything else as
    /// directives.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_directives(&contents),
        }
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // First, try a bare list of rules
        if let Ok(configs) = serde_yaml::from_str::<Vec<RuleConfig>>(yaml) {
            return Self::from_configs(configs);
        }

        // Otherwise, a document with a top-level `rules` key
        let document: RulesDocument = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rules: {}", e)))?;
        Self::from_configs(document.rules)
    }

    pub fn from_directives(text: &str) -> Result<Self> {
        super::directive::parse(text).map(Self::new)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns `true` if an exempt resource of any rule matches.
    pub fn is_exempt(&self, method: &Method, path: &str) -> bool {
        self.rules
            .iter()
            .flat_map(|rule| rule.resources.iter())
            .any(|res| res.exempt && res.matches(method, path))
    }

    /// Limiting resources matching the request, in configuration order.
    pub fn limiting_matches<'a>(
        &'a self,
        method: &'a Method,
        path: &'a str,
    ) -> impl Iterator<Item = (&'a Rule, &'a Resource)> + 'a {
        self.rules.iter().flat_map(move |rule| {
            rule.resources
                .iter()
                .filter(move |res| !res.exempt && res.matches(method, path))
                .map(move |res| (rule, res))
        })
    }

    /// Default idle retention for buckets created under these rules.
    pub fn default_retention(&self) -> Duration {
        let horizon = self
            .rules
            .iter()
            .map(Rule::refill_horizon)
            .max()
            .unwrap_or_else(|| Unit::Second.duration());
        horizon
            .checked_mul(RETENTION_MULTIPLIER)
            .unwrap_or(Duration::MAX)
    }
}
