//! Mission Report Core Library
//!
//! This crate provides the site configuration and its error type.

pub mod config;
pub mod error;

pub use config::{CacheSettings, LoaderSettings, LogSettings, SiteConfig};
pub use error::{ConfigError, ConfigResult};
