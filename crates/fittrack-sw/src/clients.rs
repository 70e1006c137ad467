//! Client window registry and notification-click focus routing.
//!
//! Client windows are live page instances owned by the host; the worker
//! only queries them transiently. On notification activation the router
//! focuses the first window on the controlled origin, or opens a new one at
//! the app root.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fittrack_common::{OptionExt, Result};
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;

/// A live page instance with an origin and a focus capability.
#[derive(Debug, Clone)]
pub struct ClientWindow {
    pub id: String,
    pub url: Url,
    pub focused: bool,
    /// Whether this worker controls the window.
    pub controlled: bool,
}

fn next_window_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("window-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Registry of open client windows.
#[derive(Debug, Default)]
pub struct Clients {
    windows: HashMap<String, ClientWindow>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&ClientWindow> {
        self.windows.get(id)
    }

    /// All open windows, preserving no particular order. With
    /// `include_uncontrolled` set, windows not controlled by this worker
    /// are returned too.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&ClientWindow> {
        self.windows
            .values()
            .filter(|w| include_uncontrolled || w.controlled)
            .collect()
    }

    /// Open a new window at the given URL; it starts focused and
    /// controlled.
    pub fn open_window(&mut self, url: Url) -> String {
        let id = next_window_id();
        self.windows.insert(
            id.clone(),
            ClientWindow {
                id: id.clone(),
                url,
                focused: true,
                controlled: true,
            },
        );
        id
    }

    /// Focus a window by id.
    pub fn focus(&mut self, id: &str) -> Result<()> {
        let window = self
            .windows
            .get_mut(id)
            .ok_or_not_found(format!("client window {id}"))?;
        window.focused = true;
        Ok(())
    }

    /// Take control of every open window (activation).
    pub fn claim(&mut self) {
        for window in self.windows.values_mut() {
            window.controlled = true;
        }
    }

    pub fn add(&mut self, window: ClientWindow) {
        self.windows.insert(window.id.clone(), window);
    }

    pub fn remove(&mut self, id: &str) -> Option<ClientWindow> {
        self.windows.remove(id)
    }
}

/// Focus-or-open routing for notification activation. Best effort: failures
/// are logged, never escalated.
pub struct FocusRouter {
    origin: Url,
    clients: Arc<RwLock<Clients>>,
}

impl FocusRouter {
    pub fn new(origin: Url, clients: Arc<RwLock<Clients>>) -> Self {
        Self { origin, clients }
    }

    /// Focus the first open window on the controlled origin, or open a new
    /// one at the app root.
    pub async fn route_click(&self) {
        let mut clients = self.clients.write().await;

        let existing = clients
            .match_all(true)
            .into_iter()
            .find(|w| w.url.origin() == self.origin.origin())
            .map(|w| w.id.clone());

        if let Some(id) = existing {
            match clients.focus(&id) {
                Ok(()) => debug!(window = %id, "Focused existing client window"),
                Err(e) => warn!(window = %id, error = %e, "Failed to focus client window"),
            }
            return;
        }

        match self.origin.join("/") {
            Ok(root) => {
                let id = clients.open_window(root);
                debug!(window = %id, "Opened new client window at app root");
            }
            Err(e) => warn!(error = %e, "Failed to resolve app root"),
        }
    }
}
