//! Registration of the manager for a scope.
//!
//! The page registers the worker script once at load time. The registration
//! owns the scope check and drives install then activate, retrying install
//! with backoff the way a browser re-attempts a failed worker install.

use std::sync::Arc;

use mission_common::{retry_with_backoff_if, RetryConfig};
use mission_net::{same_origin, Request};
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

use crate::lifecycle::ServiceWorkerState;
use crate::manager::{FetchDecision, OfflineCacheManager};
use crate::SwError;

/// Lifecycle notifications for the hosting page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        scope: String,
        state: ServiceWorkerState,
    },
    /// Install gave up after retries.
    InstallFailed { scope: String, error: String },
    /// Stale generations removed during activation.
    CachesDeleted { scope: String, names: Vec<String> },
}

/// A registered offline cache manager.
pub struct ServiceWorkerRegistration {
    scope: Url,
    script_url: Url,
    manager: Arc<OfflineCacheManager>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerRegistration {
    /// Register `manager` for `scope`, or for the script's directory when no scope is given.
    pub fn new(
        manager: Arc<OfflineCacheManager>,
        script_url: Url,
        scope: Option<Url>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>), SwError> {
        let scope = match scope {
            Some(scope) => scope,
            None => default_scope(&script_url),
        };

        if !same_origin(&scope, &script_url) {
            return Err(SwError::RegistrationFailed(format!(
                "scope {scope} is not same-origin with {script_url}"
            )));
        }
        if !same_origin(&script_url, &manager.config().origin) {
            return Err(SwError::RegistrationFailed(format!(
                "script {script_url} is not served from {}",
                manager.config().origin
            )));
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                scope,
                script_url,
                manager,
                event_tx,
            },
            event_rx,
        ))
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub fn manager(&self) -> &Arc<OfflineCacheManager> {
        &self.manager
    }

    /// Whether `url` falls under this registration.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Install (retrying preload failures) and then activate.
    pub async fn start(&self, retry: &RetryConfig) -> Result<(), SwError> {
        let scope = self.scope.to_string();

        let this = self;
        let scope_ref = &scope;
        let installed = retry_with_backoff_if(
            retry,
            move || async move {
                this.emit(ServiceWorkerEvent::StateChange {
                    scope: scope_ref.clone(),
                    state: ServiceWorkerState::Installing,
                });
                this.manager.install().await
            },
            SwError::is_retryable,
        )
        .await;

        if let Err(e) = installed {
            error!(scope = %scope, error = %e, "Service worker registration failed");
            self.emit(ServiceWorkerEvent::InstallFailed {
                scope: scope.clone(),
                error: e.to_string(),
            });
            self.emit(ServiceWorkerEvent::StateChange {
                scope,
                state: ServiceWorkerState::Redundant,
            });
            return Err(e);
        }

        self.emit(ServiceWorkerEvent::StateChange {
            scope: scope.clone(),
            state: ServiceWorkerState::Installed,
        });

        let report = self.manager.activate().await?;
        if !report.deleted.is_empty() {
            self.emit(ServiceWorkerEvent::CachesDeleted {
                scope: scope.clone(),
                names: report.deleted,
            });
        }
        self.emit(ServiceWorkerEvent::StateChange {
            scope: scope.clone(),
            state: ServiceWorkerState::Activated,
        });

        info!(scope = %scope, "Service worker registered successfully");
        Ok(())
    }

    /// Route a page request: out-of-scope requests are never intercepted.
    pub async fn handle_fetch(&self, request: &Request) -> Result<FetchDecision, SwError> {
        if !self.in_scope(&request.url) {
            return Ok(FetchDecision::Passthrough);
        }
        self.manager.handle_request(request).await
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

/// Directory of the script, with a trailing slash.
fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = match script_url.path().rfind('/') {
        Some(idx) => &script_url.path()[..=idx],
        None => "/",
    };
    scope.set_path(dir);
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::CacheConfig;
    use crate::storage::MemoryCacheStorage;
    use mission_net::OfflineFetcher;
    use std::time::Duration;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn manager() -> Arc<OfflineCacheManager> {
        let config = CacheConfig::new(url("https://report.example.org/"), "v1")
            .with_critical_assets(["/"])
            .with_fallback_document("/");
        Arc::new(OfflineCacheManager::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(OfflineFetcher),
        ))
    }

    #[test]
    fn test_default_scope_is_script_directory() {
        assert_eq!(
            default_scope(&url("https://report.example.org/sw.js")).as_str(),
            "https://report.example.org/"
        );
        assert_eq!(
            default_scope(&url("https://report.example.org/app/sw.js?v=3")).as_str(),
            "https://report.example.org/app/"
        );
    }

    #[test]
    fn test_in_scope() {
        let (registration, _rx) = ServiceWorkerRegistration::new(
            manager(),
            url("https://report.example.org/app/sw.js"),
            None,
        )
        .unwrap();

        assert!(registration.in_scope(&url("https://report.example.org/app/index.html")));
        assert!(!registration.in_scope(&url("https://report.example.org/other.html")));
    }

    #[test]
    fn test_cross_origin_scope_rejected() {
        let result = ServiceWorkerRegistration::new(
            manager(),
            url("https://report.example.org/sw.js"),
            Some(url("https://elsewhere.example.org/")),
        );
        assert!(matches!(result, Err(SwError::RegistrationFailed(_))));
    }

    #[tokio::test]
    async fn test_out_of_scope_passthrough() {
        let (registration, _rx) = ServiceWorkerRegistration::new(
            manager(),
            url("https://report.example.org/app/sw.js"),
            None,
        )
        .unwrap();

        let request = Request::get(url("https://report.example.org/top.css"));
        let decision = registration.handle_fetch(&request).await.unwrap();
        assert!(matches!(decision, FetchDecision::Passthrough));
    }

    #[tokio::test]
    async fn test_install_failure_retries_then_reports() {
        let (registration, mut rx) = ServiceWorkerRegistration::new(
            manager(),
            url("https://report.example.org/sw.js"),
            None,
        )
        .unwrap();

        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let result = registration.start(&retry).await;
        assert!(matches!(result, Err(SwError::Preload { .. })));

        let mut installing = 0;
        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ServiceWorkerEvent::StateChange {
                    state: ServiceWorkerState::Installing,
                    ..
                } => installing += 1,
                ServiceWorkerEvent::InstallFailed { .. } => failed = true,
                _ => {}
            }
        }
        assert_eq!(installing, 2);
        assert!(failed);
        assert_eq!(
            registration.manager().state().await,
            ServiceWorkerState::Redundant
        );
    }
}
