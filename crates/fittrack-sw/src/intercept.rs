//! Cache-first fetch interception.
//!
//! Only GET requests against http(s) origins are handled; everything else
//! passes through to the host untouched. A cache hit is replayed verbatim
//! with no network access; a miss goes to the network, optionally warming
//! the cache with fresh same-origin responses.

use std::sync::Arc;

use fittrack_cache::{
    CacheEntry, CacheError, CacheVersion, FetchRequest, FetchResponse, NetworkFetcher,
    SharedCacheStorage,
};
use tracing::{debug, trace, warn};
use url::Url;

/// Dynamic cache warming policy for network responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarmingPolicy {
    /// Never write network responses back into the cache.
    #[default]
    Off,
    /// Store 200, same-origin responses for future hits.
    SameOrigin200,
}

/// What the interceptor decided for a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not ours (non-GET method or non-http scheme); the host handles it.
    PassThrough,
    /// Served verbatim from the current cache store; no network touched.
    Cached(FetchResponse),
    /// Fetched from the network (and possibly warmed into the cache).
    Network(FetchResponse),
    /// Cache miss and the network failed; the error propagates to the
    /// requesting page unchanged. No synthetic offline document.
    Failed(CacheError),
}

/// Serves intercepted requests cache-first against the current version's
/// store.
pub struct FetchInterceptor {
    origin: Url,
    version: CacheVersion,
    storage: SharedCacheStorage,
    fetcher: Arc<dyn NetworkFetcher>,
    warming: WarmingPolicy,
}

impl FetchInterceptor {
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
            warming: WarmingPolicy::default(),
        }
    }

    pub fn with_warming(mut self, warming: WarmingPolicy) -> Self {
        self.warming = warming;
        self
    }

    /// Handle one intercepted request.
    pub async fn handle(&self, request: &FetchRequest) -> FetchOutcome {
        if request.method != "GET" {
            trace!(method = %request.method, url = %request.url, "Passing through non-GET request");
            return FetchOutcome::PassThrough;
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            trace!(url = %request.url, "Passing through non-http request");
            return FetchOutcome::PassThrough;
        }

        {
            let storage = self.storage.read().await;
            if let Some(store) = storage.get(self.version.as_str()) {
                if let Some(entry) = store.match_request(request.url.as_str()) {
                    debug!(url = %request.url, "Serving from cache");
                    return FetchOutcome::Cached(FetchResponse::from_entry(entry));
                }
            }
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if self.should_warm(request, &response) {
                    let entry = CacheEntry::from_response(&request.url, &response);
                    let mut storage = self.storage.write().await;
                    storage
                        .open(self.version.as_str())
                        .put(request.url.as_str(), entry);
                    debug!(url = %request.url, "Warmed cache with network response");
                }
                FetchOutcome::Network(response)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch failed with no cache entry");
                FetchOutcome::Failed(e)
            }
        }
    }

    fn should_warm(&self, request: &FetchRequest, response: &FetchResponse) -> bool {
        self.warming == WarmingPolicy::SameOrigin200
            && response.status == 200
            && request.url.origin() == self.origin.origin()
    }
}
