//! Tollgate - Per-client Rate Limiting Gate
//!
//! This crate decides, for each inbound HTTP request, whether it may
//! proceed or must be rejected because a configured rate has been
//! exceeded. Budgets are tracked in token buckets keyed by protected
//! resource and client address, refilled continuously, and evicted once
//! idle.

pub mod config;
pub mod error;
pub mod gate;
pub mod net;
pub mod ratelimit;
