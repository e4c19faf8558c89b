// Request orchestration: dispatch loop, retries, identity switching

use crate::auth::rotation::RotationState;
use crate::auth::{Identity, IdentityRegistry};
use crate::bridge::launcher::WorkerLauncher;
use crate::bridge::protocol::{RequestDescriptor, UpstreamEvent, EVENT_REQUEST};
use crate::bridge::queue::{DequeueError, EventQueue};
use crate::bridge::Bridge;
use crate::config;
use crate::error::ProxyError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use uuid::Uuid;

/// Bound on waiting for the first `response_headers` frame. The worker's own
/// idle timeout (600 s) fires first and reports a 504 error frame; this only
/// catches a wedged worker.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(630);
/// Bound between successive stream events once headers arrived.
const EVENT_TIMEOUT: Duration = Duration::from_secs(630);

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub body_b64: Option<String>,
    pub is_generative: bool,
    pub model: String,
}

impl DispatchRequest {
    pub fn generative(path: String, body: String, model: String) -> Self {
        Self {
            method: "POST".to_string(),
            path,
            query_params: HashMap::new(),
            headers: HashMap::from([(
                "content-type".to_string(),
                "application/json".to_string(),
            )]),
            body: Some(body),
            body_b64: None,
            is_generative: true,
            model,
        }
    }
}

/// Handle to the event flow of one accepted request. Dropping it before the
/// terminal frame sends a cancel to the worker and unregisters the queue, so
/// a client disconnect releases everything on its own.
pub struct EventStream {
    queue: Arc<EventQueue>,
    bridge: Bridge,
    request_id: String,
    finished: bool,
}

impl EventStream {
    pub async fn next_event(&mut self) -> Result<UpstreamEvent, ProxyError> {
        match self.queue.dequeue(EVENT_TIMEOUT).await {
            Ok(event) => {
                if matches!(event, UpstreamEvent::StreamClose | UpstreamEvent::Error { .. }) {
                    self.finished = true;
                }
                Ok(event)
            }
            Err(DequeueError::Timeout) => {
                self.finished = true;
                self.bridge.cancel(&self.request_id);
                Err(ProxyError::UpstreamTimeout)
            }
            Err(DequeueError::Closed(kind)) => {
                self.finished = true;
                Err(kind.as_error())
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if !self.finished {
            self.bridge.cancel(&self.request_id);
        }
        self.bridge.unregister(&self.request_id);
    }
}

pub struct DispatchSuccess {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// The mode the descriptor actually went out with.
    pub mode: config::StreamingMode,
    pub events: EventStream,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatcherStatus {
    pub active_index: Option<usize>,
    pub usage_count: u32,
    pub failure_count: u32,
    pub switching: bool,
    pub connected: bool,
    pub inflight: usize,
}

/// Coordinates every in-flight request against the single shared worker.
pub struct Dispatcher {
    me: Weak<Dispatcher>,
    bridge: Bridge,
    launcher: WorkerLauncher,
    registry: RwLock<IdentityRegistry>,
    rotation: tokio::sync::Mutex<RotationState>,
    /// Set while an identity switch is in progress; new requests fail fast.
    busy: AtomicBool,
}

impl Dispatcher {
    pub fn new(registry: IdentityRegistry, launcher: WorkerLauncher) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bridge: Bridge::new(),
            launcher,
            registry: RwLock::new(registry),
            rotation: tokio::sync::Mutex::new(RotationState::new()),
            busy: AtomicBool::new(false),
        })
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn reload_registry(&self) {
        self.registry.write().reload();
    }

    pub fn registry_snapshot(&self) -> Vec<Identity> {
        self.registry.read().valid().to_vec()
    }

    pub async fn status(&self) -> DispatcherStatus {
        let rotation = self.rotation.lock().await;
        DispatcherStatus {
            active_index: rotation.active(),
            usage_count: rotation.usage_count(),
            failure_count: rotation.failure_count(),
            switching: self.busy.load(Ordering::SeqCst),
            connected: self.bridge.connected(),
            inflight: self.bridge.inflight_count(),
        }
    }

    pub async fn shutdown(&self) {
        let mut rotation = self.rotation.lock().await;
        rotation.deactivate();
        self.bridge.close().await;
    }

    /// Bring the worker up under the first usable identity if it is not
    /// already running.
    async fn ensure_worker(&self) -> Result<(), ProxyError> {
        let mut rotation = self.rotation.lock().await;
        if rotation.active().is_some() && self.bridge.connected() {
            return Ok(());
        }

        let candidates = self.registry_snapshot();
        if candidates.is_empty() {
            return Err(ProxyError::NoIdentityAvailable);
        }

        for identity in &candidates {
            match self.bridge.start(identity, &self.launcher).await {
                Ok(()) => {
                    tracing::info!("worker active under identity {}", identity.display_name());
                    rotation.activate(identity.index);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "identity {} failed to launch: {}",
                        identity.display_name(),
                        e
                    );
                }
            }
        }

        Err(ProxyError::WorkerUnavailable("every identity failed to launch".into()))
    }

    /// Rotate to `target` (or the successor of the active identity), walking
    /// the set at most one full cycle before giving up to Idle.
    async fn do_switch(&self, target: Option<usize>) -> Result<usize, ProxyError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::WorkerRestarting);
        }
        let result = self.switch_inner(target).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn switch_inner(&self, target: Option<usize>) -> Result<usize, ProxyError> {
        let mut rotation = self.rotation.lock().await;

        let registry_empty = {
            let registry = self.registry.read();
            registry.is_empty()
        };
        if registry_empty {
            rotation.deactivate();
            self.bridge.close().await;
            return Err(ProxyError::NoIdentityAvailable);
        }
        let (candidates, mut next) = {
            let registry = self.registry.read();
            let next = target
                .or_else(|| rotation.active().and_then(|i| registry.next_after(i)))
                .or_else(|| registry.first_index());
            (registry.len(), next)
        };

        for _ in 0..candidates {
            let Some(index) = next else { break };
            let Some(identity) = self.registry.read().get(index).cloned() else {
                next = self.registry.read().next_after(index);
                continue;
            };
            match self.bridge.restart(&identity, &self.launcher).await {
                Ok(()) => {
                    tracing::info!("switched to identity {}", identity.display_name());
                    rotation.activate(index);
                    return Ok(index);
                }
                Err(e) => {
                    tracing::warn!("switch to {} failed: {}", identity.display_name(), e);
                    next = self.registry.read().next_after(index);
                }
            }
        }

        tracing::error!("identity rotation exhausted; worker going idle");
        rotation.deactivate();
        self.bridge.close().await;
        Err(ProxyError::WorkerUnavailable("identity rotation exhausted".into()))
    }

    pub async fn switch_to_next(&self) -> Result<usize, ProxyError> {
        self.do_switch(None).await
    }

    pub async fn switch_to(&self, index: usize) -> Result<usize, ProxyError> {
        if self.registry.read().get(index).is_none() {
            return Err(ProxyError::BadRequest(format!("no identity at index {index}")));
        }
        self.do_switch(Some(index)).await
    }

    async fn note_success(&self) {
        let uses = {
            let mut rotation = self.rotation.lock().await;
            rotation.record_success()
        };
        let config = config::get();
        if config.switch_on_uses > 0 && uses >= config.switch_on_uses {
            tracing::info!("usage threshold reached ({uses}); scheduling identity switch");
            if let Some(dispatcher) = self.me.upgrade() {
                // The current response must not wait on the switch.
                tokio::spawn(async move {
                    if let Err(e) = dispatcher.do_switch(None).await {
                        tracing::warn!("scheduled switch failed: {}", e);
                    }
                });
            }
        }
    }

    /// Record a failed attempt; switch when the consecutive-failure policy
    /// says so or when the status is a hard immediate-switch signal.
    async fn note_failure(&self, immediate: bool) {
        let failures = {
            let mut rotation = self.rotation.lock().await;
            rotation.record_failure()
        };
        let config = config::get();
        let threshold_hit = config.failure_threshold > 0 && failures >= config.failure_threshold;
        if immediate || threshold_hit {
            if let Err(e) = self.do_switch(None).await {
                tracing::warn!("failure-triggered switch failed: {}", e);
            }
        }
    }

    /// Run one client request through the worker, retrying and rotating
    /// identities per policy. On success the caller receives the upstream
    /// status/headers plus the event stream to pipe.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchSuccess, ProxyError> {
        if self.busy.load(Ordering::SeqCst) {
            // Fail-fast policy while a switch is in progress.
            return Err(ProxyError::WorkerRestarting);
        }

        let config = config::get();
        let attempts = config.max_retries.max(1);
        let mut last_err = ProxyError::UpstreamStatus {
            status: 502,
            message: "dispatch failed".to_string(),
        };

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }

            if let Err(e) = self.ensure_worker().await {
                if e.retryable() && attempt + 1 < attempts {
                    last_err = e;
                    continue;
                }
                return Err(e);
            }

            let request_id = Uuid::new_v4().to_string();
            let identity_index = self.rotation.lock().await.active();
            tracing::info!(
                request_id = %request_id,
                identity = ?identity_index,
                model = %request.model,
                attempt,
                "dispatching"
            );

            let queue = self.bridge.register(&request_id);
            let descriptor = RequestDescriptor {
                request_id: request_id.clone(),
                event_type: EVENT_REQUEST.to_string(),
                method: request.method.clone(),
                path: request.path.clone(),
                url: None,
                query_params: request.query_params.clone(),
                headers: request.headers.clone(),
                body: request.body.clone(),
                body_b64: request.body_b64.clone(),
                is_generative: request.is_generative,
                streaming_mode: config::streaming_mode(),
            };

            if let Err(e) = self.bridge.send(&descriptor) {
                self.bridge.unregister(&request_id);
                // Restart/disconnect races retry transparently.
                last_err = e;
                continue;
            }

            match queue.dequeue(HEADERS_TIMEOUT).await {
                Ok(UpstreamEvent::ResponseHeaders { status, headers }) => {
                    if config.immediate_switch_status_codes.contains(&status) {
                        self.bridge.cancel(&request_id);
                        self.bridge.unregister(&request_id);
                        last_err = ProxyError::UpstreamStatus {
                            status,
                            message: "immediate switch status".to_string(),
                        };
                        self.note_failure(true).await;
                        continue;
                    }
                    self.note_success().await;
                    return Ok(DispatchSuccess {
                        status,
                        headers,
                        mode: descriptor.streaming_mode,
                        events: EventStream {
                            queue,
                            bridge: self.bridge.clone(),
                            request_id,
                            finished: false,
                        },
                    });
                }
                Ok(UpstreamEvent::Error { status, message }) => {
                    self.bridge.unregister(&request_id);
                    let immediate = config.immediate_switch_status_codes.contains(&status);
                    last_err = if status == 504 {
                        ProxyError::UpstreamTimeout
                    } else {
                        ProxyError::UpstreamStatus { status, message }
                    };
                    self.note_failure(immediate).await;
                    continue;
                }
                Ok(event) => {
                    self.bridge.cancel(&request_id);
                    self.bridge.unregister(&request_id);
                    last_err =
                        ProxyError::Format(format!("unexpected event before headers: {event:?}"));
                    continue;
                }
                Err(DequeueError::Timeout) => {
                    self.bridge.cancel(&request_id);
                    self.bridge.unregister(&request_id);
                    last_err = ProxyError::UpstreamTimeout;
                    self.note_failure(false).await;
                    continue;
                }
                Err(DequeueError::Closed(kind)) => {
                    self.bridge.unregister(&request_id);
                    let err = kind.as_error();
                    if matches!(err, ProxyError::Canceled) {
                        return Err(ProxyError::Canceled);
                    }
                    // Switch/shutdown races are retried without counting as
                    // identity failures.
                    last_err = err;
                    continue;
                }
            }
        }

        Err(last_err)
    }
}
