//! Request gate: rule matching, key building and limiter checks for one
//! request, plus the axum middleware around it.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, instrument, trace, warn};

use crate::error::Result;
use crate::net::AddressResolver;
use crate::ratelimit::{KeyBuilder, RateLimiter, RuleSet};

/// Header carrying the wait time on a rejected request.
pub const RETRY_AFTER_HEADER: &str = "X-RateLimit-RetryAfter";

/// What to do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Admit,
    Reject { retry_after: Duration },
}

/// Decides whether requests may proceed.
///
/// Holds the active rules, the shared limiter, and the collaborators that
/// turn a request into bucket keys.
pub struct RequestGate {
    rules: RwLock<Arc<RuleSet>>,
    limiter: Arc<RateLimiter>,
    keys: KeyBuilder,
    resolver: AddressResolver,
    fixed_retention: Option<Duration>,
}

impl RequestGate {
    pub fn new(rules: RuleSet, limiter: Arc<RateLimiter>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            limiter,
            keys: KeyBuilder::default(),
            resolver: AddressResolver::default(),
            fixed_retention: None,
        }
    }

    pub fn with_key_builder(mut self, keys: KeyBuilder) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_resolver(mut self, resolver: AddressResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Pin the idle retention instead of deriving it from the active rules.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.fixed_retention = Some(retention);
        self
    }

    /// Replace the active rules. Requests already being evaluated finish
    /// with the rules they started with.
    pub fn set_rules(&self, rules: RuleSet) {
        *self.rules.write() = Arc::new(rules);
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Idle retention for the rules currently in force.
    pub fn retention(&self) -> Duration {
        self.fixed_retention
            .unwrap_or_else(|| self.rules().default_retention())
    }

    /// Drop buckets idle longer than [`RequestGate::retention`].
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        self.limiter.evict_idle_at(now, self.retention())
    }

    pub fn evaluate(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<Verdict> {
        self.evaluate_at(method, path, headers, peer, Instant::now())
    }

    /// Evaluate a request as of `now`.
    ///
    /// Exempt resources of every rule are checked first. Then each
    /// matching limiting resource consumes from its buckets, and the first
    /// one out of tokens rejects the request. The client address is only
    /// resolved once a limiting resource matches.
    pub fn evaluate_at(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        now: Instant,
    ) -> Result<Verdict> {
        let rules = self.rules();

        if rules.is_exempt(method, path) {
            trace!(%method, path, "Exempt resource matched");
            return Ok(Verdict::Admit);
        }

        let mut client: Option<IpAddr> = None;
        for (rule, resource) in rules.limiting_matches(method, path) {
            let addr = match client {
                Some(addr) => addr,
                None => *client.insert(self.resolver.resolve(headers, peer)?),
            };

            if !rule.applies_to(addr) {
                trace!(client = %addr, resource = %resource.identity(), "Private address bypass");
                continue;
            }

            let keys = self.keys.build_keys(resource, addr);
            let decision = self.limiter.check_all_at(&keys, &rule.limit, now);
            if !decision.allowed {
                return Ok(Verdict::Reject {
                    retry_after: decision.retry_after,
                });
            }
        }

        Ok(Verdict::Admit)
    }
}

/// Axum middleware enforcing a [`RequestGate`].
///
/// Install with `axum::middleware::from_fn_with_state(gate, rate_limit)`.
/// The client address comes from `ConnectInfo<SocketAddr>`, so the server
/// must be started with `into_make_service_with_connect_info`.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn rate_limit(
    State(gate): State<Arc<RequestGate>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let verdict = gate.evaluate_at(
        request.method(),
        request.uri().path(),
        request.headers(),
        peer,
        tokio::time::Instant::now().into_std(),
    );

    match verdict {
        Ok(Verdict::Admit) => next.run(request).await,
        Ok(Verdict::Reject { retry_after }) => {
            debug!(retry_after = %format_duration(retry_after), "Request rejected");
            too_many_requests(retry_after)
        }
        Err(e) => {
            warn!(error = %e, "Cannot determine client address");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
        }
    }
}

fn too_many_requests(retry_after: Duration) -> Response {
    let retry_after = format_duration(retry_after);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER_HEADER, retry_after.clone())],
        Json(json!({
            "error": "rate_limited",
            "retry_after": retry_after,
        })),
    )
        .into_response()
}

/// Render a duration the way operators read it: `500ms`, `1.5s`,
/// `2m30s`, `1h0m0s`.
pub fn format_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", fraction(nanos, 3));
    }
    if nanos < 1_000_000_000 {
        return format!("{}ms", fraction(nanos, 6));
    }

    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = fraction(
        u128::from(total % 60) * 1_000_000_000 + u128::from(duration.subsec_nanos()),
        9,
    );

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// `value / 10^digits` with trailing zeros dropped.
fn fraction(value: u128, digits: u32) -> String {
    let scale = 10u128.pow(digits);
    let whole = value / scale;
    let rest = value % scale;
    if rest == 0 {
        return whole.to_string();
    }

    let rest = format!("{:0width$}", rest, width = digits as usize);
    format!("{}.{}", whole, rest.trim_end_matches('0'))
}
