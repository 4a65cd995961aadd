//! The offline cache manager.
//!
//! One [`OfflineCacheManager`] is built per worker start and owns the three
//! lifecycle operations:
//!
//! - [`install`](OfflineCacheManager::install) preloads the critical assets
//!   into the generation named by the configured version label
//! - [`handle_request`](OfflineCacheManager::handle_request) answers a page
//!   request cache-first, falling back to the network and writing successful
//!   responses through to the cache
//! - [`activate`](OfflineCacheManager::activate) deletes every other generation

use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use http::{Method, StatusCode};
use mission_net::{same_origin, Fetcher, Request, Response};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheEntry, RequestKey};
use crate::lifecycle::{ServiceWorkerState, WorkerLifecycle};
use crate::storage::CacheStorage;
use crate::SwError;

/// What the manager is responsible for.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Site origin; only same-origin requests are intercepted.
    pub origin: Url,
    /// Label of the current cache generation.
    pub version: String,
    /// Paths preloaded at install time.
    pub critical_assets: Vec<String>,
    /// Path served to navigations when nothing else answers.
    pub fallback_document: String,
}

impl CacheConfig {
    pub fn new(origin: Url, version: impl Into<String>) -> Self {
        Self {
            origin,
            version: version.into(),
            critical_assets: Vec::new(),
            fallback_document: "/".to_string(),
        }
    }

    pub fn with_critical_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.critical_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fallback_document(mut self, path: impl Into<String>) -> Self {
        self.fallback_document = path.into();
        self
    }

    /// Resolve a site path against the origin, refusing anything off-site.
    pub fn resolve(&self, path: &str) -> Result<Url, SwError> {
        let url = self.origin.join(path).map_err(|e| SwError::InvalidAsset {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        if !same_origin(&url, &self.origin) {
            return Err(SwError::InvalidAsset {
                path: path.to_string(),
                reason: "resolves to another origin".to_string(),
            });
        }
        Ok(url)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Fallback,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Fallback => "fallback",
        }
    }
}

/// Outcome of intercepting a request.
#[derive(Debug, Clone)]
pub enum FetchDecision {
    /// Not intercepted; the page goes to the network itself.
    Passthrough,
    /// Answered by the manager.
    Respond {
        response: Response,
        source: ResponseSource,
    },
}

impl FetchDecision {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond { response, .. } => Some(response),
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        match self {
            FetchDecision::Passthrough => None,
            FetchDecision::Respond { source, .. } => Some(*source),
        }
    }
}

/// Result of generation cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Stale generations that could not be removed.
    pub failed: Vec<String>,
}

/// Cache-first offline cache manager.
pub struct OfflineCacheManager {
    config: CacheConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    lifecycle: RwLock<WorkerLifecycle>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl OfflineCacheManager {
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            lifecycle: RwLock::new(WorkerLifecycle::new()),
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn state(&self) -> ServiceWorkerState {
        self.lifecycle.read().await.state()
    }

    // ==================== Install ====================

    /// Preload every critical asset into the current generation.
    ///
    /// All assets are fetched before any is written, so a failure leaves the
    /// generation without entries from this attempt and the worker `Redundant`.
    pub async fn install(&self) -> Result<(), SwError> {
        self.lifecycle.write().await.begin_install()?;
        let version = &self.config.version;
        info!(version = %version, assets = self.config.critical_assets.len(), "Caching critical assets");

        let result = self.preload().await;
        self.lifecycle.write().await.finish_install(result.is_ok())?;

        match result {
            Ok(count) => {
                info!(version = %version, count, "Install complete");
                Ok(())
            }
            Err(e) => {
                error!(version = %version, error = %e, "Install failed");
                Err(e)
            }
        }
    }

    async fn preload(&self) -> Result<usize, SwError> {
        let requests = self
            .config
            .critical_assets
            .iter()
            .map(|path| self.config.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>, _>>()?;

        let entries = try_join_all(requests.iter().map(|request| self.preload_one(request))).await?;
        let count = entries.len();
        self.storage.open(&self.config.version).await?;
        self.storage.put_all(&self.config.version, entries).await?;
        Ok(count)
    }

    async fn preload_one(&self, request: &Request) -> Result<CacheEntry, SwError> {
        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|source| SwError::Preload {
                asset: request.url.to_string(),
                source,
            })?;

        if !response.ok() {
            return Err(SwError::PreloadStatus {
                asset: request.url.to_string(),
                status: response.status.as_u16(),
            });
        }

        debug!(url = %request.url, bytes = response.body.len(), "Preloaded");
        Ok(CacheEntry::new(request, &response))
    }

    // ==================== Fetch ====================

    /// Answer a page request.
    ///
    /// Non-GET, cross-origin, and pre-activation requests are not intercepted.
    /// Otherwise: cache hit, else network (status 200 written through), else
    /// the fallback document for navigations. Non-navigation failures
    /// propagate to the caller.
    pub async fn handle_request(&self, request: &Request) -> Result<FetchDecision, SwError> {
        if !self.intercepts(request).await {
            return Ok(FetchDecision::Passthrough);
        }

        match self.cache_first(request).await {
            Ok(decision) => Ok(decision),
            Err(e) if request.is_navigation() => self.offline_fallback(request, e).await,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Request failed");
                Err(e)
            }
        }
    }

    async fn intercepts(&self, request: &Request) -> bool {
        if request.method != Method::GET {
            return false;
        }
        if !same_origin(&request.url, &self.config.origin) {
            return false;
        }
        self.lifecycle.read().await.is_active()
    }

    async fn cache_first(&self, request: &Request) -> Result<FetchDecision, SwError> {
        if let Some(entry) = self
            .storage
            .match_request(&self.config.version, request)
            .await?
        {
            debug!(url = %request.url, "Cache hit");
            return Ok(FetchDecision::Respond {
                response: entry.to_response()?,
                source: ResponseSource::Cache,
            });
        }

        debug!(url = %request.url, "Cache miss");
        let response = self.fetcher.fetch(request).await?;

        if response.status == StatusCode::OK {
            self.write_through(request, &response).await;
        }

        Ok(FetchDecision::Respond {
            response,
            source: ResponseSource::Network,
        })
    }

    async fn write_through(&self, request: &Request, response: &Response) {
        let entry = CacheEntry::new(request, response);
        if !entry.is_storable() {
            debug!(url = %request.url, "Response varies on every header, not caching");
            return;
        }

        let storage = Arc::clone(&self.storage);
        let version = self.config.version.clone();
        let handle = tokio::spawn(async move {
            let key = entry.key.clone();
            if let Err(e) = storage.put(&version, entry).await {
                warn!(key = %key, error = %e, "Write-through failed");
            }
        });

        let mut pending = self.pending_writes.lock().await;
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    async fn offline_fallback(&self, request: &Request, cause: SwError) -> Result<FetchDecision, SwError> {
        let fallback = Request::get(self.config.resolve(&self.config.fallback_document)?);

        match self.storage.match_request(&self.config.version, &fallback).await {
            Ok(Some(entry)) => {
                warn!(url = %request.url, error = %cause, "Serving offline fallback");
                Ok(FetchDecision::Respond {
                    response: entry.to_response()?,
                    source: ResponseSource::Fallback,
                })
            }
            Ok(None) => {
                warn!(url = %request.url, fallback = %fallback.url, "Offline fallback not cached");
                Err(cause)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Offline fallback lookup failed");
                Err(cause)
            }
        }
    }

    /// Wait for every write-through started so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.pending_writes.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Write-through task aborted");
            }
        }
    }

    // ==================== Activate ====================

    /// Delete every generation except the current one, then start intercepting.
    ///
    /// Cleanup failures are logged and reported but never block activation.
    pub async fn activate(&self) -> Result<ActivationReport, SwError> {
        self.lifecycle.write().await.begin_activate()?;

        let names = match self.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Could not list caches, skipping cleanup");
                Vec::new()
            }
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| name != &self.config.version)
            .collect();

        let results = join_all(stale.iter().map(|name| self.storage.delete(name))).await;

        let mut report = ActivationReport::default();
        for (name, result) in stale.into_iter().zip(results) {
            match result {
                Ok(true) => {
                    info!(cache = %name, "Deleted old cache");
                    report.deleted.push(name);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    report.failed.push(name);
                }
            }
        }

        self.lifecycle.write().await.finish_activate()?;
        info!(version = %self.config.version, "Activated");
        Ok(report)
    }

    // ==================== Restart ====================

    /// Resume intercepting with a generation activated by an earlier run.
    ///
    /// Refuses while stale generations remain: the current one was installed
    /// but never activated, or its cleanup failed, and `activate()` is needed.
    pub async fn resume(&self) -> Result<(), SwError> {
        self.verify_generation().await?;

        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != &self.config.version)
            .collect();
        if !stale.is_empty() {
            warn!(version = %self.config.version, stale = ?stale, "Generation not activated");
            return Err(SwError::State(format!(
                "stale caches {} still present, activate {} first",
                stale.join(", "),
                self.config.version
            )));
        }

        self.lifecycle.write().await.resume()?;
        info!(version = %self.config.version, "Resumed");
        Ok(())
    }

    /// Pick up a generation installed by an earlier run as a waiting worker,
    /// so a later `activate()` can promote it without refetching.
    pub async fn adopt(&self) -> Result<(), SwError> {
        self.verify_generation().await?;
        self.lifecycle.write().await.adopt()?;
        info!(version = %self.config.version, "Adopted installed generation");
        Ok(())
    }

    async fn verify_generation(&self) -> Result<(), SwError> {
        let version = &self.config.version;
        if !self.storage.has(version).await? {
            return Err(SwError::NotInstalled(version.clone()));
        }

        for path in &self.config.critical_assets {
            let request = Request::get(self.config.resolve(path)?);
            if self.storage.match_request(version, &request).await?.is_none() {
                warn!(version = %version, asset = %path, "Installed generation is incomplete");
                return Err(SwError::NotInstalled(version.clone()));
            }
        }
        Ok(())
    }

    // ==================== Introspection ====================

    /// Names of all generations in storage.
    pub async fn generations(&self) -> Result<Vec<String>, SwError> {
        Ok(self.storage.keys().await?)
    }

    /// Request identities in the current generation.
    pub async fn cached_keys(&self) -> Result<Vec<RequestKey>, SwError> {
        Ok(self.storage.entry_keys(&self.config.version).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryCacheStorage, StorageError};
    use async_trait::async_trait;
    use bytes::Bytes;
    use hashbrown::HashMap;
    use http::HeaderMap;
    use mission_net::NetError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ORIGIN: &str = "https://report.example.org/";

    /// Scripted network: path → (status, body). Unknown paths fail.
    #[derive(Default)]
    struct FakeNet {
        routes: std::sync::Mutex<HashMap<String, (u16, &'static str)>>,
        offline: AtomicBool,
        calls: AtomicUsize,
    }

    impl FakeNet {
        fn route(&self, path: &str, status: u16, body: &'static str) {
            self.routes
                .lock()
                .unwrap()
                .insert(path.to_string(), (status, body));
        }
    }

    #[async_trait]
    impl Fetcher for FakeNet {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline(request.url.to_string()));
            }
            let route = self.routes.lock().unwrap().get(request.url.path()).copied();
            match route {
                Some((status, body)) => Ok(Response::new(
                    request.url.clone(),
                    StatusCode::from_u16(status).unwrap(),
                    HeaderMap::new(),
                    Bytes::from_static(body.as_bytes()),
                )),
                None => Err(NetError::RequestFailed(format!("no route {}", request.url))),
            }
        }
    }

    fn config() -> CacheConfig {
        CacheConfig::new(Url::parse(ORIGIN).unwrap(), "v2")
            .with_critical_assets(["/", "/introduction.html"])
            .with_fallback_document("/introduction.html")
    }

    fn setup() -> (Arc<FakeNet>, Arc<MemoryCacheStorage>, OfflineCacheManager) {
        let net = Arc::new(FakeNet::default());
        net.route("/", 200, "<html>home</html>");
        net.route("/introduction.html", 200, "<html>intro</html>");
        let storage = Arc::new(MemoryCacheStorage::new());
        let manager = OfflineCacheManager::new(config(), storage.clone(), net.clone());
        (net, storage, manager)
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
    }

    async fn active() -> (Arc<FakeNet>, Arc<MemoryCacheStorage>, OfflineCacheManager) {
        let (net, storage, manager) = setup();
        manager.install().await.unwrap();
        manager.activate().await.unwrap();
        (net, storage, manager)
    }

    #[test]
    fn test_resolve_rejects_other_origins() {
        let config = config();
        assert!(config.resolve("/a.css").is_ok());
        assert!(matches!(
            config.resolve("https://cdn.example.net/a.css"),
            Err(SwError::InvalidAsset { .. })
        ));
        assert!(matches!(
            config.resolve("//cdn.example.net/a.css"),
            Err(SwError::InvalidAsset { .. })
        ));
    }

    #[tokio::test]
    async fn test_install_preloads_assets() {
        let (_net, storage, manager) = setup();
        manager.install().await.unwrap();

        assert_eq!(manager.state().await, ServiceWorkerState::Installed);
        let keys = storage.entry_keys("v2").await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_install_fails_on_error_status() {
        let (net, storage, manager) = setup();
        net.route("/introduction.html", 404, "");

        let err = manager.install().await.unwrap_err();
        assert!(matches!(err, SwError::PreloadStatus { status: 404, .. }));
        assert_eq!(manager.state().await, ServiceWorkerState::Redundant);
        assert!(storage.entry_keys("v2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_not_intercepting_before_activation() {
        let (net, _storage, manager) = setup();
        manager.install().await.unwrap();

        let decision = manager.handle_request(&get("/")).await.unwrap();
        assert!(matches!(decision, FetchDecision::Passthrough));
        // Only the two preload fetches
        assert_eq!(net.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_network() {
        let (net, _storage, manager) = active().await;
        let before = net.calls.load(Ordering::SeqCst);

        let decision = manager.handle_request(&get("/introduction.html")).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Cache));
        assert_eq!(decision.response().unwrap().text().unwrap(), "<html>intro</html>");
        assert_eq!(net.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn test_miss_writes_through() {
        let (net, storage, manager) = active().await;
        net.route("/images/cover.jpg", 200, "jpeg");

        let decision = manager.handle_request(&get("/images/cover.jpg")).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Network));
        manager.settle().await;

        assert!(storage
            .match_request("v2", &get("/images/cover.jpg"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_non_200_not_written_through() {
        let (net, storage, manager) = active().await;
        net.route("/gone.png", 404, "");
        net.route("/empty", 204, "");

        for path in ["/gone.png", "/empty"] {
            let decision = manager.handle_request(&get(path)).await.unwrap();
            assert_eq!(decision.source(), Some(ResponseSource::Network));
        }
        manager.settle().await;

        assert_eq!(storage.entry_keys("v2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_subresource_miss_fails() {
        let (net, _storage, manager) = active().await;
        net.offline.store(true, Ordering::SeqCst);

        let result = manager.handle_request(&get("/images/map.png")).await;
        assert!(matches!(result, Err(SwError::Network(NetError::Offline(_)))));
    }

    #[tokio::test]
    async fn test_offline_navigation_gets_fallback() {
        let (net, _storage, manager) = active().await;
        net.offline.store(true, Ordering::SeqCst);

        let request = Request::navigate(Url::parse(ORIGIN).unwrap().join("/chapter-3.html").unwrap());
        let decision = manager.handle_request(&request).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Fallback));
        assert_eq!(decision.response().unwrap().text().unwrap(), "<html>intro</html>");
    }

    #[tokio::test]
    async fn test_navigation_error_status_is_not_fallback() {
        let (net, _storage, manager) = active().await;
        net.route("/missing.html", 404, "not found");

        let request = Request::navigate(Url::parse(ORIGIN).unwrap().join("/missing.html").unwrap());
        let decision = manager.handle_request(&request).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Network));
        assert_eq!(decision.response().unwrap().status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let (_net, _storage, manager) = setup();
        assert!(matches!(manager.activate().await, Err(SwError::State(_))));
    }

    /// Storage whose deletes always fail.
    struct StuckDeletes(MemoryCacheStorage);

    #[async_trait]
    impl CacheStorage for StuckDeletes {
        async fn open(&self, name: &str) -> Result<(), StorageError> {
            self.0.open(name).await
        }
        async fn has(&self, name: &str) -> Result<bool, StorageError> {
            self.0.has(name).await
        }
        async fn delete(&self, name: &str) -> Result<bool, StorageError> {
            Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("locked: {name}"),
            )))
        }
        async fn keys(&self) -> Result<Vec<String>, StorageError> {
            self.0.keys().await
        }
        async fn match_request(
            &self,
            name: &str,
            request: &Request,
        ) -> Result<Option<CacheEntry>, StorageError> {
            self.0.match_request(name, request).await
        }
        async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), StorageError> {
            self.0.put(name, entry).await
        }
        async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), StorageError> {
            self.0.put_all(name, entries).await
        }
        async fn entry_keys(&self, name: &str) -> Result<Vec<RequestKey>, StorageError> {
            self.0.entry_keys(name).await
        }
    }

    #[tokio::test]
    async fn test_cleanup_failure_does_not_block_activation() {
        let net = Arc::new(FakeNet::default());
        net.route("/", 200, "home");
        net.route("/introduction.html", 200, "intro");
        let storage = Arc::new(StuckDeletes(MemoryCacheStorage::new()));
        storage.open("v1").await.unwrap();

        let manager = OfflineCacheManager::new(config(), storage, net);
        manager.install().await.unwrap();
        let report = manager.activate().await.unwrap();

        assert_eq!(report.failed, vec!["v1".to_string()]);
        assert!(report.deleted.is_empty());
        assert_eq!(manager.state().await, ServiceWorkerState::Activated);
    }

    #[tokio::test]
    async fn test_resume_requires_complete_generation() {
        let (_net, storage, manager) = setup();
        assert!(matches!(manager.resume().await, Err(SwError::NotInstalled(_))));

        storage.open("v2").await.unwrap();
        assert!(matches!(manager.resume().await, Err(SwError::NotInstalled(_))));
    }

    #[tokio::test]
    async fn test_resume_after_restart() {
        let (net, storage, first) = active().await;
        drop(first);

        let manager = OfflineCacheManager::new(config(), storage, net.clone());
        manager.resume().await.unwrap();
        net.offline.store(true, Ordering::SeqCst);

        let decision = manager.handle_request(&get("/")).await.unwrap();
        assert_eq!(decision.source(), Some(ResponseSource::Cache));
    }

    #[tokio::test]
    async fn test_adopted_generation_activates_without_refetch() {
        let (net, storage, first) = setup();
        first.install().await.unwrap();
        drop(first);
        let before = net.calls.load(Ordering::SeqCst);

        let manager = OfflineCacheManager::new(config(), storage, net.clone());
        manager.adopt().await.unwrap();
        assert_eq!(manager.state().await, ServiceWorkerState::Installed);
        manager.activate().await.unwrap();

        assert_eq!(net.calls.load(Ordering::SeqCst), before);
        assert_eq!(manager.state().await, ServiceWorkerState::Activated);
    }

    #[tokio::test]
    async fn test_resume_refuses_unactivated_generation() {
        let (net, storage, first) = setup();
        storage.open("v1").await.unwrap();
        first.install().await.unwrap();
        drop(first);

        let manager = OfflineCacheManager::new(config(), storage.clone(), net.clone());
        assert!(matches!(manager.resume().await, Err(SwError::State(_))));
        assert_eq!(manager.state().await, ServiceWorkerState::Parsed);

        // Activating clears the way
        manager.adopt().await.unwrap();
        manager.activate().await.unwrap();
        let restarted = OfflineCacheManager::new(config(), storage, net);
        restarted.resume().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_install_creates_no_generation() {
        let (net, storage, manager) = setup();
        net.route("/introduction.html", 500, "boom");

        assert!(manager.install().await.is_err());
        assert!(!storage.has("v2").await.unwrap());
    }
}
