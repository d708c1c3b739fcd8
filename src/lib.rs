//! Admission - pluggable rate limiting
//!
//! This crate implements a family of interchangeable rate limiters behind a
//! common contract: a fixed-window counter, a leaky bucket drained by a
//! periodic releaser, a token bucket with burst and reservation, and a
//! distributed fixed window whose counting runs as an atomic script on a
//! shared store.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
