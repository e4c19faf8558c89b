// Per-request event queue between the bridge dispatcher and a handler task

use crate::bridge::protocol::UpstreamEvent;
use crate::error::ProxyError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a queue was closed; surfaces to the waiter as the matching error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    Restarting,
    Closed,
    Disconnected,
    Canceled,
}

impl CloseKind {
    pub fn as_error(self) -> ProxyError {
        match self {
            CloseKind::Restarting => ProxyError::WorkerRestarting,
            CloseKind::Closed => ProxyError::WorkerClosed,
            CloseKind::Disconnected => ProxyError::Disconnected,
            CloseKind::Canceled => ProxyError::Canceled,
        }
    }
}

#[derive(Debug)]
pub enum DequeueError {
    Timeout,
    Closed(CloseKind),
}

/// FIFO of upstream events for one in-flight request. One producer (the
/// bridge dispatcher), one consumer (the handler task). Enqueue after close
/// is a silent no-op; dequeue after close reports the close kind. A waiter
/// that times out consumes nothing: the next value stays for a later dequeue.
#[derive(Debug)]
pub struct EventQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<UpstreamEvent>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<UpstreamEvent>>,
    closed: Mutex<Option<CloseKind>>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closed: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, event: UpstreamEvent) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(event);
        }
    }

    pub async fn dequeue(&self, wait: Duration) -> Result<UpstreamEvent, DequeueError> {
        if let Some(kind) = *self.closed.lock() {
            return Err(DequeueError::Closed(kind));
        }
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => {
                let kind = (*self.closed.lock()).unwrap_or(CloseKind::Closed);
                Err(DequeueError::Closed(kind))
            }
            Err(_) => Err(DequeueError::Timeout),
        }
    }

    /// Close with a kind. First close wins; later closes are no-ops.
    pub fn close(&self, kind: CloseKind) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(kind);
        }
        // Dropping the sender wakes a blocked dequeue with the close kind.
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.lock().is_some()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: &str) -> UpstreamEvent {
        UpstreamEvent::Chunk { data: data.to_string() }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EventQueue::new();
        queue.enqueue(chunk("a"));
        queue.enqueue(chunk("b"));
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await.unwrap(), chunk("a"));
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await.unwrap(), chunk("b"));
    }

    #[tokio::test]
    async fn test_dequeue_timeout_keeps_later_value() {
        let queue = EventQueue::new();
        let err = queue.dequeue(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, DequeueError::Timeout));
        queue.enqueue(chunk("late"));
        assert_eq!(queue.dequeue(Duration::from_millis(50)).await.unwrap(), chunk("late"));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_with_kind() {
        let queue = std::sync::Arc::new(EventQueue::new());
        let waiter = queue.clone();
        let handle = tokio::spawn(async move { waiter.dequeue(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close(CloseKind::Restarting);
        match handle.await.unwrap() {
            Err(DequeueError::Closed(CloseKind::Restarting)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_noop() {
        let queue = EventQueue::new();
        queue.close(CloseKind::Canceled);
        queue.enqueue(chunk("ghost"));
        match queue.dequeue(Duration::from_millis(20)).await {
            Err(DequeueError::Closed(CloseKind::Canceled)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_first_close_kind_wins() {
        let queue = EventQueue::new();
        queue.close(CloseKind::Closed);
        queue.close(CloseKind::Canceled);
        match queue.dequeue(Duration::from_millis(20)).await {
            Err(DequeueError::Closed(CloseKind::Closed)) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
