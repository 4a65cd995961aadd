//! # Mission SW
//!
//! Offline cache manager for the mission report site.
//!
//! ## Features
//!
//! - **Install**: preload the critical assets into a versioned cache generation
//! - **Fetch interception**: cache-first, network fallback, write-through
//! - **Offline navigation**: serve the fallback document when nothing else answers
//! - **Activate**: evict every stale cache generation
//! - **Registration**: scope matching, install retries, lifecycle events
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerRegistration (scope, events)
//!     │
//!     └── OfflineCacheManager
//!             ├── WorkerLifecycle  Parsed → Installing → Installed → Activating → Activated
//!             ├── Fetcher          (mission-net)
//!             └── CacheStorage     (memory or file backed)
//!                     └── Cache "mission-report-v1"
//!                             └── Request → CacheEntry
//! ```

use mission_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod lifecycle;
pub mod manager;
pub mod registration;
pub mod storage;

pub use cache::{Cache, CacheEntry, RequestKey};
pub use lifecycle::{ServiceWorkerState, WorkerLifecycle};
pub use manager::{ActivationReport, CacheConfig, FetchDecision, OfflineCacheManager, ResponseSource};
pub use registration::{ServiceWorkerEvent, ServiceWorkerRegistration};
pub use storage::{CacheStorage, FileCacheStorage, MemoryCacheStorage, StorageError};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum SwError {
    #[error("Failed to preload critical asset {asset}: {source}")]
    Preload {
        asset: String,
        #[source]
        source: NetError,
    },

    #[error("Critical asset {asset} returned status {status}")]
    PreloadStatus { asset: String, status: u16 },

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Invalid asset path '{path}': {reason}")]
    InvalidAsset { path: String, reason: String },

    #[error("State error: {0}")]
    State(String),

    #[error("Cache generation '{0}' is not installed")]
    NotInstalled(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

impl SwError {
    /// Whether another install attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwError::Preload { .. } | SwError::PreloadStatus { .. })
    }
}
