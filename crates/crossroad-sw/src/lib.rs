//! # Crossroad Service Worker
//!
//! Offline cache for the Crossroad Navigator page, written as a background
//! worker with three lifecycle handlers.
//!
//! ## Features
//!
//! - **Install**: pre-cache the page's assets into a versioned cache
//! - **Fetch**: cache-first, network on miss, opportunistic caching
//! - **Activate**: purge every cache generation but the current one
//! - **Host**: install → waiting → active state machine driving the handlers
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     ├── installing (ServiceWorker)
//!     ├── waiting (ServiceWorker)
//!     └── active (ServiceWorker)
//!             └── LifecycleHandler (CacheGatekeeper)
//!                     ├── CacheStorage → Cache → Request → Response
//!                     └── Fetcher (network)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use crossroad_net::{Fetcher, NetError, Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info, warn};
use url::Url;

pub mod cache;
pub mod config;
pub mod gatekeeper;

pub use cache::{Cache, CacheEntry, CacheStorage};
pub use config::{CacheManifest, GatekeeperConfig};
pub use gatekeeper::CacheGatekeeper;

// ==================== Errors ====================

/// Errors from cache reads, writes and snapshots.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Request method {0} cannot be cached")]
    UnsupportedMethod(String),

    #[error("Partial response for {0} cannot be cached")]
    PartialResponse(Url),

    #[error("Network error response for {0} cannot be cached")]
    NetworkErrorResponse(Url),

    #[error("Bad response for {url}: status {status}")]
    BadResponse { url: Url, status: u16 },

    #[error("Fetch failed: {0}")]
    Fetch(#[from] NetError),

    #[error("Invalid snapshot: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

// ==================== Types ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Registered, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// The three lifecycle signals a worker reacts to.
///
/// The host awaits each call to completion before treating the event as
/// finished.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// First registration. An error leaves the worker redundant.
    async fn on_install(&self) -> Result<(), ServiceWorkerError>;

    /// Intercept a resource load. `None` means the page gets a network
    /// error.
    async fn on_fetch(&self, request: Request) -> Option<Response>;

    /// The worker is taking over from its predecessor.
    async fn on_activate(&self) -> Result<(), ServiceWorkerError>;
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,

    handler: Arc<dyn LifecycleHandler>,
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(script_url: Url, handler: Arc<dyn LifecycleHandler>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            script_url,
            state: ServiceWorkerState::Parsed,
            state_changed_at: Instant::now(),
            handler,
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Registration ====================

/// Workers of a scope, by lifecycle slot.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// Transition the installing worker `id` to waiting, returning the
    /// previously waiting worker it made redundant.
    fn install_complete(
        &mut self,
        id: ServiceWorkerId,
    ) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let mut worker = match self.installing.take() {
            Some(worker) if worker.id == id => worker,
            other => {
                self.installing = other;
                return Err(ServiceWorkerError::StateError(format!(
                    "worker {id:?} is no longer installing"
                )));
            }
        };
        worker.set_state(ServiceWorkerState::Installed);
        Ok(self.waiting.replace(worker).map(|mut replaced| {
            replaced.set_state(ServiceWorkerState::Redundant);
            replaced.id
        }))
    }

    /// Drop the installing worker `id` after a failed install.
    fn install_failed(&mut self, id: ServiceWorkerId) -> Option<ServiceWorkerId> {
        if self.installing.as_ref().map(|w| w.id) != Some(id) {
            return None;
        }
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker.id)
    }

    /// Promote the activating worker, returning the old active one it
    /// retired.
    fn activation_complete(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorkerId> {
        worker.set_state(ServiceWorkerState::Activated);
        self.active.replace(worker).map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old.id
        })
    }

    /// Unregister (mark everything redundant), returning the retired workers.
    fn unregister(&mut self) -> Vec<ServiceWorkerId> {
        [&mut self.active, &mut self.waiting, &mut self.installing]
            .into_iter()
            .filter_map(|slot| slot.take())
            .map(|mut worker| {
                worker.set_state(ServiceWorkerState::Redundant);
                worker.id
            })
            .collect()
    }
}

// ==================== Host ====================

/// Lifecycle notifications published by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A new worker took control of the scope.
    ControllerChange { worker_id: ServiceWorkerId },
}

/// Drives workers through install and activate and routes fetches to the
/// active one.
pub struct ServiceWorkerHost {
    registration: RwLock<ServiceWorkerRegistration>,

    /// Network used when no worker controls the scope.
    fetcher: Arc<dyn Fetcher>,

    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host for a scope.
    pub fn new(
        scope: Url,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope)),
                fetcher,
                event_tx,
            },
            event_rx,
        )
    }

    fn notify(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }

    fn state_change(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.notify(ServiceWorkerEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    /// Install a new worker. On success it waits for [`activate`]; on failure
    /// it becomes redundant and the active worker, if any, stays in control.
    ///
    /// [`activate`]: ServiceWorkerHost::activate
    pub async fn install(
        &self,
        script_url: Url,
        handler: Arc<dyn LifecycleHandler>,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = ServiceWorker::new(script_url, Arc::clone(&handler));
        let id = worker.id;
        worker.set_state(ServiceWorkerState::Installing);
        {
            let mut registration = self.registration.write().await;
            if registration.installing.is_some() {
                return Err(ServiceWorkerError::StateError(
                    "another worker is already installing".to_string(),
                ));
            }
            registration.installing = Some(worker);
        }
        self.state_change(id, ServiceWorkerState::Installing);
        info!(worker = ?id, "Installing service worker");

        match handler.on_install().await {
            Ok(()) => {
                let replaced = self.registration.write().await.install_complete(id)?;
                if let Some(replaced) = replaced {
                    self.state_change(replaced, ServiceWorkerState::Redundant);
                }
                self.state_change(id, ServiceWorkerState::Installed);
                info!(worker = ?id, "Service worker installed");
                Ok(id)
            }
            Err(err) => {
                // Already reported redundant if unregistered mid-install.
                if self.registration.write().await.install_failed(id).is_some() {
                    self.state_change(id, ServiceWorkerState::Redundant);
                }
                error!(worker = ?id, error = %err, "Service worker install failed");
                Err(err)
            }
        }
    }

    /// Activate the waiting worker.
    ///
    /// A failing activate handler is logged; the worker still takes control.
    pub async fn activate(&self) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let mut worker = self
            .registration
            .write()
            .await
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        let id = worker.id;
        worker.set_state(ServiceWorkerState::Activating);
        self.state_change(id, ServiceWorkerState::Activating);

        if let Err(err) = worker.handler.on_activate().await {
            warn!(worker = ?id, error = %err, "Activate handler failed");
        }

        let previous = self.registration.write().await.activation_complete(worker);
        if let Some(previous) = previous {
            self.state_change(previous, ServiceWorkerState::Redundant);
        }
        self.state_change(id, ServiceWorkerState::Activated);
        self.notify(ServiceWorkerEvent::ControllerChange { worker_id: id });
        info!(worker = ?id, "Service worker activated");
        Ok(id)
    }

    /// Route a resource load through the active worker.
    ///
    /// Without an active worker the request goes straight to the network.
    pub async fn dispatch_fetch(&self, request: Request) -> Response {
        let handler = self
            .registration
            .read()
            .await
            .active
            .as_ref()
            .map(|w| Arc::clone(&w.handler));
        let url = request.url.clone();

        match handler {
            Some(handler) => handler
                .on_fetch(request)
                .await
                .unwrap_or_else(|| Response::network_error(url)),
            None => match self.fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(url = %url, error = %err, "Uncontrolled fetch failed");
                    Response::network_error(url)
                }
            },
        }
    }

    /// Scope of the registration.
    pub async fn scope(&self) -> Url {
        self.registration.read().await.scope.clone()
    }

    /// State of the active worker, if any.
    pub async fn active_state(&self) -> Option<ServiceWorkerState> {
        self.registration.read().await.active.as_ref().map(|w| w.state)
    }

    /// ID of the active worker, if any.
    pub async fn active_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.active.as_ref().map(|w| w.id)
    }

    /// ID of the waiting worker, if any.
    pub async fn waiting_id(&self) -> Option<ServiceWorkerId> {
        self.registration.read().await.waiting.as_ref().map(|w| w.id)
    }

    /// Unregister every worker. Fetches go straight to the network afterwards.
    pub async fn unregister(&self) {
        let retired = self.registration.write().await.unregister();
        for id in &retired {
            self.state_change(*id, ServiceWorkerState::Redundant);
        }
        info!(workers = retired.len(), "Service worker unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    /// Answers every fetch with the same body.
    struct StaticFetcher(&'static str);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            Ok(Response::basic(request.url.clone(), 200, self.0))
        }
    }

    struct ScriptedHandler {
        install_ok: bool,
        body: &'static str,
        activations: AtomicUsize,
    }

    impl ScriptedHandler {
        fn new(install_ok: bool, body: &'static str) -> Arc<Self> {
            Arc::new(Self {
                install_ok,
                body,
                activations: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LifecycleHandler for ScriptedHandler {
        async fn on_install(&self) -> Result<(), ServiceWorkerError> {
            if self.install_ok {
                Ok(())
            } else {
                Err(CacheError::BadResponse {
                    url: url("https://example.com/index.html"),
                    status: 500,
                }
                .into())
            }
        }

        async fn on_fetch(&self, request: Request) -> Option<Response> {
            (!self.body.is_empty()).then(|| Response::basic(request.url, 200, self.body))
        }

        async fn on_activate(&self) -> Result<(), ServiceWorkerError> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Install that parks until released, to interleave other host calls.
    #[derive(Default)]
    struct GatedHandler {
        started: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl LifecycleHandler for GatedHandler {
        async fn on_install(&self) -> Result<(), ServiceWorkerError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn on_fetch(&self, _request: Request) -> Option<Response> {
            None
        }

        async fn on_activate(&self) -> Result<(), ServiceWorkerError> {
            Ok(())
        }
    }

    fn host() -> (ServiceWorkerHost, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        ServiceWorkerHost::new(url("https://example.com/"), Arc::new(StaticFetcher("network")))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn redundant(worker_id: ServiceWorkerId) -> ServiceWorkerEvent {
        ServiceWorkerEvent::StateChange {
            worker_id,
            new_state: ServiceWorkerState::Redundant,
        }
    }

    #[test]
    fn test_service_worker_state_transitions() {
        let mut worker = ServiceWorker::new(
            url("https://example.com/sw.js"),
            ScriptedHandler::new(true, "x"),
        );
        assert_eq!(worker.state, ServiceWorkerState::Parsed);

        worker.set_state(ServiceWorkerState::Installing);
        assert_eq!(worker.state, ServiceWorkerState::Installing);

        worker.set_state(ServiceWorkerState::Activated);
        assert!(worker.is_active());
        assert!(!worker.is_redundant());
    }

    #[tokio::test]
    async fn test_install_then_activate() {
        let (host, mut rx) = host();
        let handler = ScriptedHandler::new(true, "worker");

        let id = host
            .install(url("https://example.com/sw.js"), handler.clone())
            .await
            .unwrap();
        assert_eq!(host.waiting_id().await, Some(id));
        assert_eq!(host.active_id().await, None);

        assert_eq!(host.activate().await.unwrap(), id);
        assert_eq!(host.active_state().await, Some(ServiceWorkerState::Activated));
        assert_eq!(handler.activations.load(Ordering::SeqCst), 1);

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServiceWorkerEvent::StateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_install_keeps_previous_worker() {
        let (host, _rx) = host();
        let first = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v1"))
            .await
            .unwrap();
        host.activate().await.unwrap();

        let result = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(false, "v2"))
            .await;

        assert!(matches!(result, Err(ServiceWorkerError::Cache(_))));
        assert_eq!(host.active_id().await, Some(first));
        assert_eq!(host.waiting_id().await, None);

        let response = host
            .dispatch_fetch(Request::get(url("https://example.com/index.html")))
            .await;
        assert_eq!(response.raw_body().as_ref(), b"v1");
    }

    #[tokio::test]
    async fn test_activate_replaces_old_worker() {
        let (host, mut rx) = host();
        let first = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v1"))
            .await
            .unwrap();
        host.activate().await.unwrap();
        let second = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v2"))
            .await
            .unwrap();
        host.activate().await.unwrap();

        assert_eq!(host.active_id().await, Some(second));
        assert!(drain(&mut rx).contains(&redundant(first)));
    }

    #[tokio::test]
    async fn test_second_install_retires_waiting_worker() {
        let (host, mut rx) = host();
        let first = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v1"))
            .await
            .unwrap();
        let second = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v2"))
            .await
            .unwrap();

        assert_eq!(host.waiting_id().await, Some(second));
        let events = drain(&mut rx);
        assert!(events.contains(&redundant(first)));
        assert!(!events.contains(&redundant(second)));
    }

    #[tokio::test]
    async fn test_unregister_during_install() {
        let (host, mut rx) = host();
        let handler = Arc::new(GatedHandler::default());

        let (result, ()) = tokio::join!(
            host.install(url("https://example.com/sw.js"), handler.clone()),
            async {
                handler.started.notified().await;
                host.unregister().await;
                handler.release.notify_one();
            }
        );

        assert!(matches!(result, Err(ServiceWorkerError::StateError(_))));
        assert_eq!(host.waiting_id().await, None);

        let states: Vec<ServiceWorkerState> = drain(&mut rx)
            .into_iter()
            .filter_map(|event| match event {
                ServiceWorkerEvent::StateChange { new_state, .. } => Some(new_state),
                ServiceWorkerEvent::ControllerChange { .. } => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ServiceWorkerState::Installing, ServiceWorkerState::Redundant]
        );
    }

    #[tokio::test]
    async fn test_activate_without_waiting_worker() {
        let (host, _rx) = host();
        assert!(matches!(
            host.activate().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_uses_network() {
        let (host, _rx) = host();
        let response = host
            .dispatch_fetch(Request::get(url("https://example.com/a.png")))
            .await;
        assert_eq!(response.raw_body().as_ref(), b"network");
    }

    #[tokio::test]
    async fn test_handler_without_response_becomes_network_error() {
        let (host, _rx) = host();
        host.install(url("https://example.com/sw.js"), ScriptedHandler::new(true, ""))
            .await
            .unwrap();
        host.activate().await.unwrap();

        let response = host
            .dispatch_fetch(Request::get(url("https://example.com/a.png")))
            .await;
        assert_eq!(response.response_type(), crossroad_net::ResponseType::Error);
    }

    #[tokio::test]
    async fn test_unregister() {
        let (host, mut rx) = host();
        let active = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v1"))
            .await
            .unwrap();
        host.activate().await.unwrap();
        let waiting = host
            .install(url("https://example.com/sw.js"), ScriptedHandler::new(true, "v2"))
            .await
            .unwrap();
        drain(&mut rx);

        host.unregister().await;

        assert_eq!(host.active_id().await, None);
        assert_eq!(host.waiting_id().await, None);
        assert_eq!(drain(&mut rx), vec![redundant(active), redundant(waiting)]);
        let response = host
            .dispatch_fetch(Request::get(url("https://example.com/a.png")))
            .await;
        assert_eq!(response.raw_body().as_ref(), b"network");
    }
}
