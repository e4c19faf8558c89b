// Egress worker: holds the authenticated session and performs real upstream calls

use crate::auth::IdentityFile;
use crate::bridge::launcher::{ENV_WORKER_IDENTITY, ENV_WORKER_WS};
use crate::bridge::protocol::{
    self, stream_close_frame, RequestDescriptor, EVENT_CANCEL, EVENT_HANDSHAKE, EVENT_REQUEST,
    EVENT_SET_LOG_LEVEL,
};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

pub mod filters;
pub mod upstream;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

fn set_log_level(level: &str) {
    let on = matches!(level.to_ascii_lowercase().as_str(), "debug" | "trace");
    VERBOSE.store(on, Ordering::Relaxed);
    tracing::info!("worker log level set to {} (verbose={})", level, on);
}

/// Entry point for the `worker` subcommand: connection details arrive via
/// environment, configuration via the usual variables.
pub async fn run_from_env() -> Result<()> {
    crate::config::init_from_env();
    let ws_url = std::env::var(ENV_WORKER_WS).context("missing bridge websocket url")?;
    let identity_path =
        PathBuf::from(std::env::var(ENV_WORKER_IDENTITY).context("missing identity path")?);
    run_worker(ws_url, identity_path).await
}

/// Connect back to the bridge, handshake, then serve descriptor frames until
/// the channel closes. Each request runs as its own task; `cancel_request`
/// frames abort the matching task and leave a tombstone so a late descriptor
/// with the same id is not dispatched.
pub async fn run_worker(ws_url: String, identity_path: PathBuf) -> Result<()> {
    let identity = IdentityFile::load(&identity_path)
        .with_context(|| format!("loading identity {identity_path:?}"))?;
    let cookie_header = identity.cookie_header();

    let (ws, _) = tokio_tungstenite::connect_async(ws_url.as_str())
        .await
        .with_context(|| format!("connecting to bridge {ws_url}"))?;
    let (mut sink, mut source) = ws.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    out_tx
        .send(Message::Text(protocol::handshake_frame()))
        .ok();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let cancels: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut tombstones: HashSet<String> = HashSet::new();

    while let Some(frame) = source.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!("undecodable frame from bridge");
            continue;
        };
        let event_type = value
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or(EVENT_REQUEST);

        match event_type {
            EVENT_CANCEL => {
                let Some(id) = value.get("request_id").and_then(|v| v.as_str()) else {
                    continue;
                };
                if let Some(cancel) = cancels.lock().remove(id) {
                    let _ = cancel.send(());
                }
                tombstones.insert(id.to_string());
            }
            EVENT_SET_LOG_LEVEL => {
                if let Some(level) = value.get("level").and_then(|v| v.as_str()) {
                    set_log_level(level);
                }
            }
            EVENT_HANDSHAKE => {}
            _ => {
                let descriptor: RequestDescriptor = match serde_json::from_value(value) {
                    Ok(descriptor) => descriptor,
                    Err(e) => {
                        tracing::warn!("bad request descriptor: {}", e);
                        continue;
                    }
                };
                let id = descriptor.request_id.clone();
                if verbose() {
                    tracing::info!("[{}] {} {}", id, descriptor.method, descriptor.path);
                }
                if tombstones.remove(&id) {
                    // Canceled before dispatch; acknowledge and move on.
                    let _ = out_tx.send(Message::Text(stream_close_frame(&id)));
                    continue;
                }

                let (cancel_tx, cancel_rx) = oneshot::channel();
                cancels.lock().insert(id.clone(), cancel_tx);

                let cancels = cancels.clone();
                let out = out_tx.clone();
                let cookie = cookie_header.clone();
                tokio::spawn(async move {
                    upstream::run_request(descriptor, cookie, out, cancel_rx).await;
                    cancels.lock().remove(&id);
                });
            }
        }
    }

    tracing::info!("bridge channel closed; worker exiting");
    writer.abort();
    Ok(())
}
