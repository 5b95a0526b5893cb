//! HTTP request gate.
//!
//! Sequences rule matching, key building and the limiter for each request
//! and turns the verdict into a pass-through or a `429 Too Many Requests`.

mod server;
mod service;

pub use server::{default_app, GateServer};
pub use service::{format_duration, rate_limit, RequestGate, Verdict, RETRY_AFTER_HEADER};
