// AI Studio proxy: OpenAI/Gemini-compatible endpoints served through an
// authenticated egress worker.

pub mod agent;
pub mod api;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod proxy;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Server entry point: load configuration, scan identities, start serving.
pub async fn run() -> Result<()> {
    config::init_from_env();

    let registry = auth::IdentityRegistry::scan(config::resolve_auth_dir());
    if registry.is_empty() {
        tracing::warn!(
            "no identities in {:?}; requests will fail until one is added",
            config::resolve_auth_dir()
        );
    }

    let dispatcher = proxy::Dispatcher::new(registry, bridge::launcher::WorkerLauncher::Process);

    api::start_server(dispatcher).await
}
