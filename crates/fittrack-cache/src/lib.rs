//! # FitTrack Asset Cache
//!
//! Versioned asset cache for the FitTrack service worker.
//!
//! ## Features
//!
//! - **Version Registry**: one `CacheVersion` token per asset generation
//! - **Install**: pre-fetch the asset manifest into the versioned store
//! - **Activate**: purge every store from a previous generation
//! - **NetworkFetcher**: host capability seam for actual network access
//!
//! ## Architecture
//!
//! ```text
//! AssetCacheManager
//!     ├── CacheVersion ("fittrack-v1.1")
//!     ├── NetworkFetcher (host capability)
//!     └── CacheStorage
//!             └── CacheStore (per version)
//!                     └── url → CacheEntry
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use fittrack_common::retry::{retry_with_backoff, RetryPolicy};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

// ==================== Errors ====================

/// Errors that can occur in cache operations.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid asset url: {0}")]
    InvalidUrl(String),

    #[error("Install failed for version {version}: {failed:?}")]
    InstallFailed {
        version: String,
        failed: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),
}

// ==================== Version Registry ====================

/// Opaque version token identifying one asset generation.
///
/// Bumped by the deploying application whenever the manifest changes
/// (e.g. `fittrack-v1.1` → `fittrack-v1.2`). Also the name of the
/// generation's [`CacheStore`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheVersion(String);

impl CacheVersion {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheVersion {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

// ==================== Manifest ====================

/// Ordered list of relative asset paths to pre-fetch at install.
///
/// Supplied by the deploying application; immutable for the lifetime of a
/// version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest(Vec<String>);

impl AssetManifest {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(paths.into_iter().map(Into::into).collect())
    }

    /// The app shell FitTrack ships: root document, main HTML, and the
    /// icons the rest-over notification references. External CDN resources
    /// are deliberately absent; a single unreachable one would degrade the
    /// whole install.
    pub fn fittrack_default() -> Self {
        Self::new([
            "/",
            "/index.html",
            "/icons/icon-192x192.png",
            "/icons/icon-512x512.png",
            "/icons/badge-72x72.png",
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ==================== Fetch Types ====================

/// A request seen by the worker (lifecycle install fetch or intercepted
/// page fetch).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub method: String,
    /// Top-level navigation (document) request.
    pub is_navigation: bool,
}

impl FetchRequest {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            is_navigation: false,
        }
    }

    pub fn navigation(url: Url) -> Self {
        Self {
            url,
            method: "GET".to_string(),
            is_navigation: true,
        }
    }
}

/// A response, either from the network or replayed from the cache.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Whether this response was served from a cache store.
    pub from_cache: bool,
}

impl FetchResponse {
    /// A 200 response with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body: body.into(),
            from_cache: false,
        }
    }

    /// Replay a cached entry verbatim.
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            status: entry.status,
            headers: entry.headers.clone(),
            body: entry.body.clone(),
            from_cache: true,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Host capability for network access.
///
/// The worker never opens sockets itself; install fetches and interceptor
/// cache misses go through this seam.
#[async_trait]
pub trait NetworkFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError>;
}

// ==================== Cache Store ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub method: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    pub fn from_response(url: &Url, response: &FetchResponse) -> Self {
        Self {
            url: url.to_string(),
            method: "GET".to_string(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at: fittrack_common::epoch_millis(),
        }
    }
}

/// One cache generation: url → entry, named by its version token.
#[derive(Debug, Default)]
pub struct CacheStore {
    pub name: String,
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by url.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn put(&mut self, url: &str, entry: CacheEntry) {
        self.entries.insert(url.to_string(), entry);
    }

    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All cache generations known to the worker.
#[derive(Debug, Default)]
pub struct CacheStorage {
    stores: HashMap<String, CacheStore>,
}

impl CacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store (creates if it doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut CacheStore {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| CacheStore::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&CacheStore> {
        self.stores.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        self.stores.remove(name).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.stores.keys().cloned().collect()
    }
}

/// Shared handle to the worker's cache storage.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

// ==================== Asset Cache Manager ====================

/// Install failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallPolicy {
    /// Each asset is fetched independently; failures are logged and the
    /// store keeps whichever assets succeeded. One broken icon does not
    /// disable offline availability.
    #[default]
    BestEffort,
    /// Any single failure aborts the install; nothing is committed.
    AllOrNothing,
}

/// What an install actually cached.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub failed: Vec<String>,
}

impl InstallReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Populates the versioned store on install and purges stale generations on
/// activate.
pub struct AssetCacheManager {
    origin: Url,
    version: CacheVersion,
    storage: SharedCacheStorage,
    fetcher: Arc<dyn NetworkFetcher>,
    policy: InstallPolicy,
    retry: RetryPolicy,
}

impl AssetCacheManager {
    pub fn new(
        origin: Url,
        version: CacheVersion,
        storage: SharedCacheStorage,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        Self {
            origin,
            version,
            storage,
            fetcher,
            policy: InstallPolicy::default(),
            retry: RetryPolicy::asset_install(),
        }
    }

    pub fn with_policy(mut self, policy: InstallPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn version(&self) -> &CacheVersion {
        &self.version
    }

    fn resolve(&self, path: &str) -> Result<Url, CacheError> {
        self.origin
            .join(path)
            .map_err(|e| CacheError::InvalidUrl(format!("{path}: {e}")))
    }

    /// Fetch every manifest entry into the current version's store.
    ///
    /// Under [`InstallPolicy::BestEffort`] each asset fails independently and
    /// the report lists what was skipped. Under
    /// [`InstallPolicy::AllOrNothing`] a single failure aborts with nothing
    /// committed.
    pub async fn install(&self, manifest: &AssetManifest) -> Result<InstallReport, CacheError> {
        info!(version = %self.version, assets = manifest.len(), "Installing asset cache");

        let mut staged: Vec<(String, CacheEntry)> = Vec::new();
        let mut failed: Vec<String> = Vec::new();

        for path in manifest.iter() {
            match self.fetch_asset(path).await {
                Ok(entry) => staged.push((entry.url.clone(), entry)),
                Err(e) => {
                    warn!(path, error = %e, "Asset fetch failed during install");
                    failed.push(path.to_string());
                }
            }
        }

        if self.policy == InstallPolicy::AllOrNothing && !failed.is_empty() {
            return Err(CacheError::InstallFailed {
                version: self.version.to_string(),
                failed,
            });
        }

        let cached: Vec<String> = staged.iter().map(|(url, _)| url.clone()).collect();

        let mut storage = self.storage.write().await;
        let store = storage.open(self.version.as_str());
        for (url, entry) in staged {
            store.put(&url, entry);
        }

        info!(
            version = %self.version,
            cached = cached.len(),
            failed = failed.len(),
            "Asset cache installed"
        );

        Ok(InstallReport { cached, failed })
    }

    async fn fetch_asset(&self, path: &str) -> Result<CacheEntry, CacheError> {
        let url = self.resolve(path)?;
        let request = FetchRequest::get(url.clone());

        let response = retry_with_backoff(&self.retry, || self.fetcher.fetch(&request)).await?;

        if !response.is_success() {
            return Err(CacheError::Network(format!(
                "{url}: status {}",
                response.status
            )));
        }

        debug!(%url, bytes = response.body.len(), "Asset cached");
        Ok(CacheEntry::from_response(&url, &response))
    }

    /// Delete every store whose name is not the current version's.
    ///
    /// Returns the deleted store names. Must settle before the worker starts
    /// intercepting fetches for this activation; afterwards exactly one
    /// store exists.
    pub async fn activate(&self) -> Vec<String> {
        let mut storage = self.storage.write().await;

        // The current generation's store always exists after activation,
        // even if install cached nothing.
        storage.open(self.version.as_str());

        let stale: Vec<String> = storage
            .keys()
            .into_iter()
            .filter(|name| name != self.version.as_str())
            .collect();

        for name in &stale {
            info!(store = %name, "Deleting stale cache");
            storage.delete(name);
        }

        stale
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    /// Scripted fetcher: url path → response or error, counting calls.
    struct MockFetcher {
        responses: Mutex<HashMap<String, Result<FetchResponse, CacheError>>>,
        calls: AtomicU32,
    }

    impl MockFetcher {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        async fn respond(&self, path: &str, response: FetchResponse) {
            self.responses
                .lock()
                .await
                .insert(path.to_string(), Ok(response));
        }

        async fn fail(&self, path: &str) {
            self.responses.lock().await.insert(
                path.to_string(),
                Err(CacheError::Network(format!("{path}: unreachable"))),
            );
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NetworkFetcher for MockFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let responses = self.responses.lock().await;
            responses
                .get(request.url.path())
                .cloned()
                .unwrap_or_else(|| Err(CacheError::NotFound(request.url.to_string())))
        }
    }

    fn origin() -> Url {
        Url::parse("https://fittrack.example/").unwrap()
    }

    fn manager(fetcher: Arc<MockFetcher>, version: &str) -> (AssetCacheManager, SharedCacheStorage) {
        let storage: SharedCacheStorage = Arc::new(RwLock::new(CacheStorage::new()));
        let manager = AssetCacheManager::new(
            origin(),
            CacheVersion::new(version),
            storage.clone(),
            fetcher,
        );
        (manager, storage)
    }

    #[test]
    fn test_version_token() {
        let v = CacheVersion::new("fittrack-v1.1");
        assert_eq!(v.as_str(), "fittrack-v1.1");
        assert_eq!(v, CacheVersion::from("fittrack-v1.1"));
        assert_ne!(v, CacheVersion::from("fittrack-v1.2"));
    }

    #[test]
    fn test_default_manifest_lists_app_shell() {
        let manifest = AssetManifest::fittrack_default();
        let paths: Vec<&str> = manifest.iter().collect();
        assert_eq!(paths[0], "/");
        assert!(paths.contains(&"/index.html"));
        assert!(paths.contains(&"/icons/badge-72x72.png"));
    }

    #[test]
    fn test_store_put_and_match() {
        let mut store = CacheStore::new("v1");
        let response = FetchResponse::ok(&b"body"[..]);
        let url = Url::parse("https://fittrack.example/index.html").unwrap();
        store.put(url.as_str(), CacheEntry::from_response(&url, &response));

        assert!(store.match_request(url.as_str()).is_some());
        assert!(store.match_request("https://fittrack.example/other").is_none());
    }

    #[test]
    fn test_storage_open_delete() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("v1"));
        storage.open("v1");
        assert!(storage.has("v1"));
        assert!(storage.delete("v1"));
        assert!(!storage.has("v1"));
    }

    #[tokio::test]
    async fn test_install_best_effort_keeps_partial_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("/", FetchResponse::ok(&b"<html>"[..])).await;
        fetcher
            .respond("/index.html", FetchResponse::ok(&b"<html>"[..]))
            .await;
        fetcher.fail("/icons/icon-192x192.png").await;

        let (manager, storage) = manager(fetcher, "fittrack-v1.1");
        let manifest = AssetManifest::new(["/", "/index.html", "/icons/icon-192x192.png"]);

        let report = manager.install(&manifest).await.unwrap();
        assert_eq!(report.cached.len(), 2);
        assert_eq!(report.failed, vec!["/icons/icon-192x192.png".to_string()]);
        assert!(!report.is_complete());

        let storage = storage.read().await;
        let store = storage.get("fittrack-v1.1").unwrap();
        assert_eq!(store.len(), 2);
        assert!(store
            .match_request("https://fittrack.example/index.html")
            .is_some());
    }

    #[tokio::test]
    async fn test_install_all_or_nothing_commits_nothing() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("/", FetchResponse::ok(&b"<html>"[..])).await;
        fetcher.fail("/index.html").await;

        let (manager, storage) = manager(fetcher, "fittrack-v1.1");
        let manager = manager.with_policy(InstallPolicy::AllOrNothing);
        let manifest = AssetManifest::new(["/", "/index.html"]);

        let result = manager.install(&manifest).await;
        assert!(matches!(result, Err(CacheError::InstallFailed { .. })));

        let storage = storage.read().await;
        assert!(
            storage.get("fittrack-v1.1").map_or(true, |s| s.is_empty()),
            "aborted install must not commit entries"
        );
    }

    #[tokio::test]
    async fn test_install_retries_transient_failures() {
        struct FlakyFetcher {
            calls: AtomicU32,
        }

        #[async_trait]
        impl NetworkFetcher for FlakyFetcher {
            async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, CacheError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call == 0 {
                    Err(CacheError::Network("flaky".to_string()))
                } else {
                    Ok(FetchResponse::ok(&b"ok"[..]))
                }
            }
        }

        let fetcher = Arc::new(FlakyFetcher {
            calls: AtomicU32::new(0),
        });
        let storage: SharedCacheStorage = Arc::new(RwLock::new(CacheStorage::new()));
        let manager = AssetCacheManager::new(
            origin(),
            CacheVersion::new("v1"),
            storage,
            fetcher.clone(),
        );

        let report = manager.install(&AssetManifest::new(["/"])).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_success_status_counts_as_failure() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher
            .respond(
                "/missing.png",
                FetchResponse {
                    status: 404,
                    headers: HashMap::new(),
                    body: Bytes::new(),
                    from_cache: false,
                },
            )
            .await;

        let (manager, _storage) = manager(fetcher.clone(), "v1");
        let report = manager
            .install(&AssetManifest::new(["/missing.png"]))
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        // The fetch itself succeeded, so the retry policy never re-runs it.
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_activate_purges_stale_generations() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond("/", FetchResponse::ok(&b"v2"[..])).await;

        let (manager, storage) = manager(fetcher, "fittrack-v1.2");
        {
            let mut storage = storage.write().await;
            storage.open("fittrack-v1.0");
            storage.open("fittrack-v1.1");
        }

        manager.install(&AssetManifest::new(["/"])).await.unwrap();
        let mut deleted = manager.activate().await;
        deleted.sort();

        assert_eq!(deleted, vec!["fittrack-v1.0", "fittrack-v1.1"]);

        let storage = storage.read().await;
        assert_eq!(storage.keys(), vec!["fittrack-v1.2".to_string()]);
    }

    #[tokio::test]
    async fn test_activate_creates_current_store_even_without_install() {
        let fetcher = Arc::new(MockFetcher::new());
        let (manager, storage) = manager(fetcher, "fittrack-v2.0");

        let deleted = manager.activate().await;
        assert!(deleted.is_empty());
        assert!(storage.read().await.has("fittrack-v2.0"));
    }
}
