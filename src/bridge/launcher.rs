// Spawning the egress worker: subprocess in production, task in tests

use crate::auth::Identity;
use crate::error::ProxyError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Environment passed to a spawned worker subprocess.
pub const ENV_WORKER_WS: &str = "AISTUDIO_WORKER_WS";
pub const ENV_WORKER_IDENTITY: &str = "AISTUDIO_WORKER_IDENTITY";

pub type InProcessWorker = Arc<dyn Fn(String, PathBuf) -> JoinHandle<()> + Send + Sync>;

/// How the bridge brings up its single worker.
#[derive(Clone)]
pub enum WorkerLauncher {
    /// Re-exec this binary with the `worker` subcommand.
    Process,
    /// Run the worker as a task inside this process. Used by tests so
    /// scenarios can run against a scripted upstream without a subprocess.
    InProcess(InProcessWorker),
}

pub enum WorkerHandle {
    Child(tokio::process::Child),
    Task(JoinHandle<()>),
}

impl WorkerHandle {
    pub fn shutdown(&mut self) {
        match self {
            WorkerHandle::Child(child) => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!("worker already gone: {}", e);
                }
            }
            WorkerHandle::Task(handle) => handle.abort(),
        }
    }
}

impl WorkerLauncher {
    pub fn spawn(&self, ws_url: &str, identity: &Identity) -> Result<WorkerHandle, ProxyError> {
        match self {
            WorkerLauncher::Process => {
                let exe = std::env::current_exe()
                    .map_err(|e| ProxyError::WorkerUnavailable(e.to_string()))?;
                let child = tokio::process::Command::new(exe)
                    .arg("worker")
                    .env(ENV_WORKER_WS, ws_url)
                    .env(ENV_WORKER_IDENTITY, &identity.path)
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| ProxyError::WorkerUnavailable(e.to_string()))?;
                tracing::info!(
                    "launched worker pid={:?} identity={}",
                    child.id(),
                    identity.display_name()
                );
                Ok(WorkerHandle::Child(child))
            }
            WorkerLauncher::InProcess(spawn) => {
                Ok(WorkerHandle::Task(spawn(ws_url.to_string(), identity.path.clone())))
            }
        }
    }
}
