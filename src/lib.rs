//! Ratewise - Adaptive Admission Control for Outbound API Calls
//!
//! This crate paces calls to third-party vendors whose real rate limits are
//! unknown or undocumented. Each vendor gets its own limiter that learns the
//! vendor's limits from response headers and 429s, backs off on failures,
//! schedules short bursts when capacity allows, and trips a circuit breaker
//! when the vendor stops answering.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod error;
