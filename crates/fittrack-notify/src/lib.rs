//! # FitTrack Notification Scheduler
//!
//! Schedules the single deferred "rest over" notification for the FitTrack
//! service worker.
//!
//! The worker process may be suspended or terminated by the host between
//! events, so two scheduling mechanisms are reconciled:
//!
//! - **Durable trigger** ([`TriggerHost`]): arms a notification at an
//!   absolute time and survives suspension, but cannot be revoked once
//!   armed; only a notification it has already surfaced can be closed.
//! - **Fallback timer**: an in-process tokio timer. Fully cancellable, but
//!   lost if the worker is suspended before it fires. Its deadline is
//!   persisted through [`DeadlineStore`] so a restarted worker can re-arm
//!   or fire an overdue one via [`RestScheduler::resume`].
//!
//! At most one schedule is pending at a time; a new request fully retires
//! the previous one (last-write-wins), and the dedup tag guarantees at most
//! one visible notification.
//!
//! ## Architecture
//!
//! ```text
//! RestScheduler
//!     ├── NotificationHost (permission / show / close-by-tag)
//!     ├── Option<TriggerHost> (durable, feature-detected)
//!     ├── DeadlineStore (persisted fallback deadline)
//!     └── PendingSchedule (single slot)
//!             └── Mechanism: Trigger(handle) | FallbackTimer(task)
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use fittrack_common::epoch_millis;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ==================== Errors ====================

/// Errors that can occur in notification scheduling.
#[derive(Error, Debug, Clone)]
pub enum NotifyError {
    #[error("Notification host error: {0}")]
    Host(String),

    #[error("Trigger error: {0}")]
    Trigger(String),

    #[error("Deadline storage error: {0}")]
    Storage(String),
}

// ==================== Constants ====================

/// Dedup tag: showing a new notification under this tag replaces any
/// visible one, so at most one rest-over notification is ever on screen.
pub const REST_TAG: &str = "rest-timer-notification";

pub const REST_TITLE: &str = "FitTrack: Rest Over!";
pub const REST_BODY: &str = "Time's up! Let's get back to the workout.";
pub const REST_ICON: &str = "/icons/icon-192x192.png";
pub const REST_BADGE: &str = "/icons/badge-72x72.png";
pub const REST_VIBRATE: [u32; 3] = [200, 100, 200];

/// Largest delay the in-process timer is armed with (i32::MAX ms, about
/// 24.8 days). Longer deadlines are clamped to this bound.
pub const MAX_FALLBACK_DELAY_MS: u64 = 2_147_483_647;

// ==================== Notification ====================

/// Notification payload handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    /// Alert the user even when replacing a stale notification under the
    /// same tag.
    pub renotify: bool,
}

impl Notification {
    /// The fixed "rest over" payload.
    pub fn rest_over() -> Self {
        Self {
            tag: REST_TAG.to_string(),
            title: REST_TITLE.to_string(),
            body: REST_BODY.to_string(),
            icon: REST_ICON.to_string(),
            badge: REST_BADGE.to_string(),
            vibrate: REST_VIBRATE.to_vec(),
            renotify: true,
        }
    }
}

/// Host-reported notification permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionState {
    Granted,
    Denied,
    Prompt,
}

impl PermissionState {
    pub fn is_granted(&self) -> bool {
        *self == Self::Granted
    }
}

// ==================== Host Capabilities ====================

/// Host capability for surfacing notifications.
#[async_trait]
pub trait NotificationHost: Send + Sync {
    /// Current permission, queried at fire time; it may have been revoked
    /// since scheduling.
    async fn permission(&self) -> PermissionState;

    /// Show a notification. Tag-replace semantics are the host's.
    async fn show(&self, notification: &Notification) -> Result<(), NotifyError>;

    /// Close all visible notifications under a tag; returns how many.
    async fn close_by_tag(&self, tag: &str) -> Result<usize, NotifyError>;
}

/// Bookkeeping handle for an armed durable trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TriggerHandle(u64);

impl TriggerHandle {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TriggerHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Host capability for the durable, absolute-time trigger.
///
/// An armed trigger survives worker suspension and fires on the host side.
/// It cannot be de-scheduled: the handle is bookkeeping only, and
/// cancellation can at best close a notification the trigger has already
/// surfaced. Awaiting `arm` surfaces both synchronous and asynchronous
/// arming failures; either one makes the scheduler fall back to the
/// in-process timer.
#[async_trait]
pub trait TriggerHost: Send + Sync {
    async fn arm(
        &self,
        end_time_ms: u64,
        notification: &Notification,
    ) -> Result<TriggerHandle, NotifyError>;
}

// ==================== Deadline Store ====================

#[derive(Debug, Serialize, Deserialize)]
struct DeadlineRecord {
    end_time_ms: u64,
}

/// Persisted deadline record backing the volatile fallback timer.
///
/// When the worker is restarted after a suspension that killed the timer,
/// [`RestScheduler::resume`] reads this record and either re-arms a still
/// future deadline or fires an overdue one immediately. Hosts without
/// storage use [`DeadlineStore::in_memory`], which keeps the original
/// volatile behavior.
#[derive(Debug)]
pub struct DeadlineStore {
    path: Option<PathBuf>,
    slot: StdMutex<Option<u64>>,
}

impl DeadlineStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            slot: StdMutex::new(None),
        }
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            slot: StdMutex::new(None),
        }
    }

    pub fn save(&self, end_time_ms: u64) -> Result<(), NotifyError> {
        *self.slot.lock().expect("deadline slot poisoned") = Some(end_time_ms);

        if let Some(path) = &self.path {
            let json = serde_json::to_vec(&DeadlineRecord { end_time_ms })
                .map_err(|e| NotifyError::Storage(e.to_string()))?;
            // Temp-write then rename so a crash never leaves a torn record.
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, json).map_err(|e| NotifyError::Storage(e.to_string()))?;
            std::fs::rename(&tmp, path).map_err(|e| NotifyError::Storage(e.to_string()))?;
        }
        Ok(())
    }

    pub fn load(&self) -> Result<Option<u64>, NotifyError> {
        if let Some(path) = &self.path {
            match std::fs::read(path) {
                Ok(bytes) => {
                    let record: DeadlineRecord = serde_json::from_slice(&bytes)
                        .map_err(|e| NotifyError::Storage(e.to_string()))?;
                    Ok(Some(record.end_time_ms))
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(NotifyError::Storage(e.to_string())),
            }
        } else {
            Ok(*self.slot.lock().expect("deadline slot poisoned"))
        }
    }

    pub fn clear(&self) -> Result<(), NotifyError> {
        self.slot.lock().expect("deadline slot poisoned").take();

        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(NotifyError::Storage(e.to_string())),
            }
        }
        Ok(())
    }
}

impl Default for DeadlineStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

// ==================== Pending Schedule ====================

/// Which mechanism is armed for the pending schedule.
#[derive(Debug)]
enum Mechanism {
    /// Durable trigger armed on the host side.
    Trigger(TriggerHandle),
    /// In-process timer task; aborting the handle cancels it.
    FallbackTimer(JoinHandle<()>),
}

/// The single pending-notification slot.
#[derive(Debug)]
struct PendingSchedule {
    end_time_ms: u64,
    mechanism: Mechanism,
}

// ==================== Scheduler ====================

struct SchedulerInner {
    host: Arc<dyn NotificationHost>,
    trigger: Option<Arc<dyn TriggerHost>>,
    deadline: DeadlineStore,
    pending: Mutex<Option<PendingSchedule>>,
}

/// The deferred notification scheduler.
///
/// State machine: `Idle → Scheduled(mechanism) → Fired → Idle`, with
/// `Scheduled → Idle` via [`cancel`](Self::cancel). A second
/// [`schedule`](Self::schedule) always fully supersedes the first; the
/// scheduler never holds two pending schedules.
#[derive(Clone)]
pub struct RestScheduler {
    inner: Arc<SchedulerInner>,
}

impl RestScheduler {
    /// Create a scheduler. `trigger` is the feature-detected durable
    /// capability; `None` means the host doesn't expose one and every
    /// schedule uses the fallback timer.
    pub fn new(host: Arc<dyn NotificationHost>, trigger: Option<Arc<dyn TriggerHost>>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                host,
                trigger,
                deadline: DeadlineStore::in_memory(),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Use a persistent deadline store (see [`DeadlineStore`]).
    pub fn with_deadline_store(
        host: Arc<dyn NotificationHost>,
        trigger: Option<Arc<dyn TriggerHost>>,
        deadline: DeadlineStore,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                host,
                trigger,
                deadline,
                pending: Mutex::new(None),
            }),
        }
    }

    /// Arm the rest-over notification for an absolute epoch-ms deadline.
    ///
    /// Retires any previous schedule first, then prefers the durable
    /// trigger and falls back to an in-process timer (delay clamped to
    /// [`MAX_FALLBACK_DELAY_MS`]). Failures degrade silently: they are
    /// logged and the worker keeps running.
    pub async fn schedule(&self, end_time_ms: u64) {
        let delay_ms = end_time_ms.saturating_sub(epoch_millis());
        info!(end_time_ms, delay_ms, "Scheduling rest-over notification");

        let mut pending = self.inner.pending.lock().await;
        self.retire(&mut pending).await;

        if let Some(trigger) = &self.inner.trigger {
            match trigger.arm(end_time_ms, &Notification::rest_over()).await {
                Ok(handle) => {
                    debug!(?handle, end_time_ms, "Durable trigger armed");
                    // The armed deadline now lives host-side. A record left
                    // by an earlier fallback schedule is stale; resume()
                    // must not resurrect it.
                    if let Err(e) = self.inner.deadline.clear() {
                        warn!(error = %e, "Failed to clear persisted deadline");
                    }
                    *pending = Some(PendingSchedule {
                        end_time_ms,
                        mechanism: Mechanism::Trigger(handle),
                    });
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Durable trigger failed, falling back to in-process timer");
                }
            }
        } else {
            debug!("No durable trigger capability, using in-process timer");
        }

        // The fallback timer dies with the process; persist the deadline so
        // resume() can recover it.
        if let Err(e) = self.inner.deadline.save(end_time_ms) {
            warn!(error = %e, "Failed to persist fallback deadline");
        }

        let clamped = delay_ms.min(MAX_FALLBACK_DELAY_MS);
        if clamped < delay_ms {
            warn!(delay_ms, clamped, "Fallback delay clamped to timer maximum");
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(clamped)).await;
            SchedulerInner::fire(&inner).await;
        });

        *pending = Some(PendingSchedule {
            end_time_ms,
            mechanism: Mechanism::FallbackTimer(handle),
        });
    }

    /// Best-effort cancellation.
    ///
    /// Clears an armed fallback timer and closes any visible notification
    /// under the dedup tag. An already-armed durable trigger cannot be
    /// de-scheduled before it fires; only its surfaced notification can be
    /// closed after the fact.
    pub async fn cancel(&self) {
        info!("Cancelling rest timer");
        let mut pending = self.inner.pending.lock().await;
        self.retire(&mut pending).await;

        if let Err(e) = self.inner.deadline.clear() {
            warn!(error = %e, "Failed to clear persisted deadline");
        }
    }

    /// Recover a persisted fallback deadline after a worker restart: fire
    /// immediately if overdue, re-arm if still future.
    pub async fn resume(&self) {
        match self.inner.deadline.load() {
            Ok(Some(end_time_ms)) if end_time_ms <= epoch_millis() => {
                info!(end_time_ms, "Persisted deadline overdue after restart, firing now");
                SchedulerInner::fire(&self.inner).await;
            }
            Ok(Some(end_time_ms)) => {
                info!(end_time_ms, "Re-arming persisted deadline after restart");
                self.schedule(end_time_ms).await;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to read persisted deadline"),
        }
    }

    /// Deadline of the pending schedule, if any.
    pub async fn pending_end_time(&self) -> Option<u64> {
        self.inner
            .pending
            .lock()
            .await
            .as_ref()
            .map(|p| p.end_time_ms)
    }

    /// Retire the previous schedule: abort a live fallback timer and close
    /// any visible notification under the tag. An armed durable trigger
    /// stays armed; only its surfaced notification is closeable.
    async fn retire(&self, pending: &mut Option<PendingSchedule>) {
        if let Some(prev) = pending.take() {
            match prev.mechanism {
                Mechanism::FallbackTimer(handle) => {
                    handle.abort();
                    debug!(end_time_ms = prev.end_time_ms, "Cleared pending fallback timer");
                }
                Mechanism::Trigger(handle) => {
                    debug!(
                        ?handle,
                        end_time_ms = prev.end_time_ms,
                        "Superseding armed durable trigger (cannot be revoked)"
                    );
                }
            }
        }

        match self.inner.host.close_by_tag(REST_TAG).await {
            Ok(closed) if closed > 0 => {
                debug!(closed, tag = REST_TAG, "Closed visible notifications")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to close notifications by tag"),
        }
    }
}

impl SchedulerInner {
    /// Fallback-timer fire path. Permission is re-checked here: loss between
    /// scheduling and firing causes a silent skip, not an error.
    async fn fire(inner: &Arc<SchedulerInner>) {
        if let Err(e) = inner.deadline.clear() {
            warn!(error = %e, "Failed to clear persisted deadline");
        }

        let permission = inner.host.permission().await;
        if !permission.is_granted() {
            debug!(
                ?permission,
                "Notification permission not granted, skipping rest-over notification"
            );
            inner.pending.lock().await.take();
            return;
        }

        info!("Rest period over, showing notification");
        if let Err(e) = inner.host.show(&Notification::rest_over()).await {
            warn!(error = %e, "Failed to show rest-over notification");
        }

        inner.pending.lock().await.take();
    }
}

// ==================== Tests ====================
