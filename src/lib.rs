//! QuotaGuard - Request Admission Control
//!
//! This crate decides, per inbound request, whether to admit or reject it
//! based on a quota over a time window, and optionally on the request's
//! country of origin. Counting happens either in process memory (fixed
//! window) or in Redis (sliding window log). Store outages admit requests
//! rather than failing them.

pub mod config;
pub mod error;
pub mod geo;
pub mod ratelimit;
