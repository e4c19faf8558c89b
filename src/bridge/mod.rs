// Bridge: owns the one egress worker and its duplex channel

use crate::auth::Identity;
use crate::error::ProxyError;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

pub mod launcher;
pub mod protocol;
pub mod queue;

use launcher::{WorkerHandle, WorkerLauncher};
use protocol::{parse_upstream_frame, RequestDescriptor};
use queue::{CloseKind, EventQueue};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

struct WorkerConn {
    worker: WorkerHandle,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

struct BridgeInner {
    /// id → queue table; handlers register/unregister, the reader enqueues.
    queues: RwLock<HashMap<String, Arc<EventQueue>>>,
    /// Clone of the channel feeding the writer task. Kept outside `conn` so
    /// drop guards can push cancel frames without blocking.
    writer_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    conn: tokio::sync::Mutex<Option<WorkerConn>>,
    restarting: AtomicBool,
}

impl BridgeInner {
    fn close_all_queues(&self, kind: CloseKind) {
        let drained: Vec<Arc<EventQueue>> = self.queues.write().drain().map(|(_, q)| q).collect();
        for queue in drained {
            queue.close(kind);
        }
    }

    fn on_channel_lost(&self) {
        if self.restarting.load(Ordering::SeqCst) {
            // Teardown during a switch already closed the queues as Restarting.
            return;
        }
        tracing::warn!("worker channel disconnected; failing in-flight requests");
        self.writer_tx.write().take();
        self.close_all_queues(CloseKind::Disconnected);
    }
}

/// Server-side owner of the worker process and its WebSocket channel.
///
/// There is exactly one live worker and one channel at a time. Requests are
/// multiplexed over it by `request_id`; per-request delivery order follows
/// the order the worker produced the frames.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                queues: RwLock::new(HashMap::new()),
                writer_tx: RwLock::new(None),
                conn: tokio::sync::Mutex::new(None),
                restarting: AtomicBool::new(false),
            }),
        }
    }

    pub fn connected(&self) -> bool {
        self.inner.writer_tx.read().is_some() && !self.inner.restarting.load(Ordering::SeqCst)
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.queues.read().len()
    }

    /// Allocate and register the event queue for a freshly minted request id.
    pub fn register(&self, request_id: &str) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new());
        self.inner.queues.write().insert(request_id.to_string(), queue.clone());
        queue
    }

    pub fn unregister(&self, request_id: &str) {
        self.inner.queues.write().remove(request_id);
    }

    /// Launch the worker under `identity` and wait for its handshake.
    pub async fn start(
        &self,
        identity: &Identity,
        launcher: &WorkerLauncher,
    ) -> Result<(), ProxyError> {
        let mut conn_slot = self.inner.conn.lock().await;
        if conn_slot.is_some() {
            if self.inner.writer_tx.read().is_some() {
                return Ok(());
            }
            // Channel died but the old process is still around.
            if let Some(mut stale) = conn_slot.take() {
                stale.reader.abort();
                stale.writer.abort();
                stale.worker.shutdown();
            }
        }

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| ProxyError::WorkerUnavailable(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| ProxyError::WorkerUnavailable(e.to_string()))?
            .port();
        let ws_url = format!("ws://127.0.0.1:{port}");

        let mut worker = launcher.spawn(&ws_url, identity)?;

        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, listener.accept()).await {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable(e.to_string()));
            }
            Err(_) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable("worker never connected".into()));
            }
        };

        let ws = match tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            tokio_tungstenite::accept_async(stream),
        )
        .await
        {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable(e.to_string()));
            }
            Err(_) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable("websocket accept timed out".into()));
            }
        };

        let (mut sink, mut source) = ws.split();

        // First frame must be the worker's handshake.
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, source.next()).await {
            Ok(Some(Ok(Message::Text(text)))) if protocol::is_handshake_frame(&text) => {}
            Ok(other) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable(format!(
                    "unexpected first frame: {other:?}"
                )));
            }
            Err(_) => {
                worker.shutdown();
                return Err(ProxyError::WorkerUnavailable("handshake timed out".into()));
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let inner = self.inner.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some((request_id, event)) = parse_upstream_frame(&text) else {
                            continue;
                        };
                        let queue = inner.queues.read().get(&request_id).cloned();
                        match queue {
                            Some(queue) => queue.enqueue(event),
                            None => {
                                tracing::warn!("frame for unknown request id {}", request_id)
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            inner.on_channel_lost();
        });

        *self.inner.writer_tx.write() = Some(tx);
        *conn_slot = Some(WorkerConn { worker, reader, writer });
        tracing::info!("worker channel established for {}", identity.display_name());
        Ok(())
    }

    /// Serialize and transmit a request descriptor.
    pub fn send(&self, descriptor: &RequestDescriptor) -> Result<(), ProxyError> {
        if self.inner.restarting.load(Ordering::SeqCst) {
            return Err(ProxyError::WorkerRestarting);
        }
        let frame = serde_json::to_string(descriptor)
            .map_err(|e| ProxyError::Format(e.to_string()))?;
        let guard = self.inner.writer_tx.read();
        let tx = guard.as_ref().ok_or(ProxyError::Disconnected)?;
        tx.send(Message::Text(frame)).map_err(|_| ProxyError::Disconnected)
    }

    /// Best-effort cancel frame; safe to call from drop guards.
    pub fn cancel(&self, request_id: &str) {
        if let Some(tx) = self.inner.writer_tx.read().as_ref() {
            let _ = tx.send(Message::Text(protocol::cancel_frame(request_id)));
        }
    }

    pub fn set_log_level(&self, level: &str) {
        if let Some(tx) = self.inner.writer_tx.read().as_ref() {
            let _ = tx.send(Message::Text(protocol::set_log_level_frame(level)));
        }
    }

    async fn teardown(&self, kind: CloseKind) {
        self.inner.writer_tx.write().take();
        self.inner.close_all_queues(kind);
        if let Some(mut conn) = self.inner.conn.lock().await.take() {
            conn.reader.abort();
            conn.writer.abort();
            conn.worker.shutdown();
        }
    }

    /// Tear the worker down and launch anew under `identity`. Only one
    /// restart runs at a time; sends during it fail fast as restarting.
    pub async fn restart(
        &self,
        identity: &Identity,
        launcher: &WorkerLauncher,
    ) -> Result<(), ProxyError> {
        if self.inner.restarting.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::WorkerRestarting);
        }
        self.teardown(CloseKind::Restarting).await;
        let result = self.start(identity, launcher).await;
        self.inner.restarting.store(false, Ordering::SeqCst);
        result
    }

    /// Idempotent shutdown; pending dequeues see the closed kind.
    pub async fn close(&self) {
        self.teardown(CloseKind::Closed).await;
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::UpstreamEvent;

    #[tokio::test]
    async fn test_send_without_worker_is_disconnected() {
        let bridge = Bridge::new();
        let descriptor = RequestDescriptor {
            request_id: "r1".into(),
            event_type: protocol::EVENT_REQUEST.into(),
            method: "POST".into(),
            path: "v1beta/models/m:generateContent".into(),
            url: None,
            query_params: HashMap::new(),
            headers: HashMap::new(),
            body: Some("{}".into()),
            body_b64: None,
            is_generative: true,
            streaming_mode: crate::config::StreamingMode::Real,
        };
        assert!(matches!(bridge.send(&descriptor), Err(ProxyError::Disconnected)));
    }

    #[tokio::test]
    async fn test_register_unregister_tracks_inflight() {
        let bridge = Bridge::new();
        let queue = bridge.register("r1");
        assert_eq!(bridge.inflight_count(), 1);
        queue.enqueue(UpstreamEvent::StreamClose);
        bridge.unregister("r1");
        assert_eq!(bridge.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_close_closes_registered_queues() {
        let bridge = Bridge::new();
        let queue = bridge.register("r1");
        bridge.close().await;
        match queue.dequeue(Duration::from_millis(20)).await {
            Err(queue::DequeueError::Closed(CloseKind::Closed)) => {}
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(bridge.inflight_count(), 0);
    }
}
