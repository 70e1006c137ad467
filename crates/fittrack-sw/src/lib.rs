//! # FitTrack Service Worker
//!
//! The background worker that gives the FitTrack app offline availability
//! and delivers the deferred "rest over" notification.
//!
//! ## Features
//!
//! - **Lifecycle**: install (pre-fetch app shell), activate (purge stale
//!   cache generations)
//! - **Fetch interception**: cache-first with network fallback
//! - **Rest timer**: `SCHEDULE_REST_END` / `CANCEL_REST_TIMER` messages
//!   drive the single-slot notification scheduler
//! - **Client routing**: focus-or-open on notification activation
//!
//! ## Architecture
//!
//! ```text
//! RestWorker
//!     ├── AssetCacheManager ──── CacheStorage (versioned stores)
//!     ├── FetchInterceptor ───── NetworkFetcher (host capability)
//!     ├── RestScheduler ──────── NotificationHost / TriggerHost
//!     └── FocusRouter ────────── Clients (window registry)
//! ```
//!
//! The worker is event-driven and may be suspended between events; nothing
//! here assumes continuously-running memory beyond what the durable trigger
//! and the persisted deadline record provide.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod clients;
pub mod intercept;
pub mod protocol;

pub use clients::{ClientWindow, Clients, FocusRouter};
pub use intercept::{FetchInterceptor, FetchOutcome, WarmingPolicy};
pub use protocol::ClientMessage;

use fittrack_cache::{
    AssetCacheManager, AssetManifest, CacheStorage, CacheVersion, FetchRequest, InstallPolicy,
    NetworkFetcher, SharedCacheStorage,
};
use fittrack_notify::{DeadlineStore, NotificationHost, RestScheduler, TriggerHost, REST_TAG};

// ==================== Config ====================

/// Deployment configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The controlled origin.
    pub origin: Url,
    /// Current asset generation; the deployer bumps this token on any
    /// manifest change.
    pub version: CacheVersion,
    /// Assets pre-fetched at install.
    pub manifest: AssetManifest,
    pub install_policy: InstallPolicy,
    pub warming: WarmingPolicy,
    /// Where to persist the fallback deadline record; `None` keeps it
    /// in-memory (volatile).
    pub deadline_path: Option<PathBuf>,
}

impl WorkerConfig {
    /// FitTrack defaults for an origin: current shell version and manifest,
    /// best-effort install, no dynamic warming.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            version: CacheVersion::new("fittrack-v1.1"),
            manifest: AssetManifest::fittrack_default(),
            install_policy: InstallPolicy::default(),
            warming: WarmingPolicy::default(),
            deadline_path: None,
        }
    }
}

// ==================== Lifecycle ====================

/// Worker lifecycle phase. Host-ordered: activation is only invoked after
/// install settles, and fetches are only intercepted once activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
}

// ==================== Events ====================

/// An event delivered to the worker by the host.
#[derive(Debug)]
pub enum WorkerEvent {
    /// Install lifecycle event.
    Install,
    /// Activate lifecycle event.
    Activate,
    /// An intercepted request; the outcome is sent back on `reply`.
    Fetch {
        request: FetchRequest,
        reply: oneshot::Sender<FetchOutcome>,
    },
    /// A raw message posted by an application page.
    Message(serde_json::Value),
    /// The user activated the rest-over notification.
    NotificationClick,
    /// Worker restarted after suspension; recover any persisted deadline.
    Resume,
}

// ==================== Worker ====================

/// The FitTrack service worker.
pub struct RestWorker {
    config: WorkerConfig,
    phase: RwLock<WorkerPhase>,
    cache: AssetCacheManager,
    interceptor: FetchInterceptor,
    scheduler: RestScheduler,
    clients: Arc<RwLock<Clients>>,
    router: FocusRouter,
    notifications: Arc<dyn NotificationHost>,
}

impl RestWorker {
    /// Wire a worker from its host capabilities. `trigger` is the
    /// feature-detected durable scheduling primitive; `None` means every
    /// schedule uses the volatile fallback timer.
    pub fn new(
        config: WorkerConfig,
        fetcher: Arc<dyn NetworkFetcher>,
        notifications: Arc<dyn NotificationHost>,
        trigger: Option<Arc<dyn TriggerHost>>,
    ) -> Self {
        let storage: SharedCacheStorage = Arc::new(RwLock::new(CacheStorage::new()));

        let cache = AssetCacheManager::new(
            config.origin.clone(),
            config.version.clone(),
            storage.clone(),
            fetcher.clone(),
        )
        .with_policy(config.install_policy);

        let interceptor = FetchInterceptor::new(
            config.origin.clone(),
            config.version.clone(),
            storage,
            fetcher,
        )
        .with_warming(config.warming);

        let deadline = match &config.deadline_path {
            Some(path) => DeadlineStore::at_path(path.clone()),
            None => DeadlineStore::in_memory(),
        };
        let scheduler =
            RestScheduler::with_deadline_store(notifications.clone(), trigger, deadline);

        let clients = Arc::new(RwLock::new(Clients::new()));
        let router = FocusRouter::new(config.origin.clone(), clients.clone());

        Self {
            config,
            phase: RwLock::new(WorkerPhase::Parsed),
            cache,
            interceptor,
            scheduler,
            clients,
            router,
            notifications,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &RestScheduler {
        &self.scheduler
    }

    pub fn clients(&self) -> Arc<RwLock<Clients>> {
        self.clients.clone()
    }

    pub async fn phase(&self) -> WorkerPhase {
        *self.phase.read().await
    }

    /// Install: pre-fetch the app shell into the versioned store. Install
    /// failures are logged and the worker proceeds; a missing cache only
    /// costs offline availability.
    pub async fn on_install(&self) {
        *self.phase.write().await = WorkerPhase::Installing;
        info!(version = %self.config.version, "Service worker installing");

        match self.cache.install(&self.config.manifest).await {
            Ok(report) if report.is_complete() => {
                info!(cached = report.cached.len(), "App shell cached");
            }
            Ok(report) => {
                warn!(
                    cached = report.cached.len(),
                    failed = ?report.failed,
                    "App shell partially cached"
                );
            }
            Err(e) => {
                error!(error = %e, "Caching failed during install");
            }
        }

        *self.phase.write().await = WorkerPhase::Installed;
    }

    /// Activate: purge stale cache generations, then take control of open
    /// clients. Interception starts only after this settles.
    pub async fn on_activate(&self) {
        *self.phase.write().await = WorkerPhase::Activating;
        info!(version = %self.config.version, "Service worker activating");

        let deleted = self.cache.activate().await;
        if !deleted.is_empty() {
            info!(?deleted, "Stale caches deleted");
        }

        self.clients.write().await.claim();
        *self.phase.write().await = WorkerPhase::Activated;
    }

    /// Handle an intercepted request. Before activation everything passes
    /// through: the cache for this generation is not authoritative yet.
    pub async fn handle_fetch(&self, request: &FetchRequest) -> FetchOutcome {
        if *self.phase.read().await != WorkerPhase::Activated {
            return FetchOutcome::PassThrough;
        }
        self.interceptor.handle(request).await
    }

    /// Dispatch a raw message from an application page.
    pub async fn on_message(&self, value: serde_json::Value) {
        match ClientMessage::parse(value) {
            Ok(ClientMessage::ScheduleRestEnd { end_time_ms }) => {
                self.scheduler.schedule(end_time_ms).await;
            }
            Ok(ClientMessage::CancelRestTimer) => {
                self.scheduler.cancel().await;
            }
            Err(e) => {
                debug!(error = %e, "Ignoring unrecognized client message");
            }
        }
    }

    /// The user tapped the rest-over notification: close it, then focus an
    /// existing app window or open a new one at the root.
    pub async fn on_notification_click(&self) {
        if let Err(e) = self.notifications.close_by_tag(REST_TAG).await {
            warn!(error = %e, "Failed to close activated notification");
        }
        self.router.route_click().await;
    }

    /// Recover a persisted rest deadline after the host restarted the
    /// worker.
    pub async fn on_resume(&self) {
        self.scheduler.resume().await;
    }

    /// Drive the worker from a host event stream. Returns when the host
    /// closes the channel.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WorkerEvent::Install => self.on_install().await,
                WorkerEvent::Activate => self.on_activate().await,
                WorkerEvent::Fetch { request, reply } => {
                    let outcome = self.handle_fetch(&request).await;
                    if reply.send(outcome).is_err() {
                        debug!(url = %request.url, "Fetch caller went away");
                    }
                }
                WorkerEvent::Message(value) => self.on_message(value).await,
                WorkerEvent::NotificationClick => self.on_notification_click().await,
                WorkerEvent::Resume => self.on_resume().await,
            }
        }
        debug!("Event channel closed, worker stopping");
    }
}

// ==================== Tests ====================
