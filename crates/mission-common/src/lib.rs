//! # Mission Common
//!
//! Shared plumbing for the mission report crates.
//!
//! ## Features
//!
//! - Logging configuration and subscriber setup
//! - Retry with exponential backoff for fallible async operations

pub mod logging;
pub mod retry;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat, LogInitError};
pub use retry::{retry_with_backoff_if, RetryConfig};
