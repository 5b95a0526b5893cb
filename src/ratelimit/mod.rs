//! Rate limiting logic and state management.

mod bucket;
mod directive;
mod key;
mod limiter;
mod rules;
mod store;
mod sweeper;

pub use bucket::{Bucket, Limit, Unit};
pub use key::{BucketKey, KeyBuilder};
pub use limiter::{Decision, RateLimiter};
pub use rules::{
    MethodMatch, PathPattern, Resource, ResourceConfig, Rule, RuleConfig, RuleSet, EXEMPT_MARKER,
};
pub use store::KeyStore;
pub use sweeper::Sweeper;
