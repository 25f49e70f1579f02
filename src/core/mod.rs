//! Core client infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error types and retry classification
//! - [`retry`] - Retry governor applied to every remote call
//! - [`telemetry`] - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod retry;
pub mod telemetry;
