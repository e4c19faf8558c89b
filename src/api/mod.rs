// HTTP API server

use crate::config;
use crate::error::ProxyError;
use crate::proxy::Dispatcher;
use anyhow::Result;
use axum::extract::{Request, State};
use axum::http::{header, Method};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

pub mod handlers;
pub mod mappers;
pub mod streaming;

static SERVER_HANDLE: OnceCell<RwLock<Option<oneshot::Sender<()>>>> = OnceCell::new();

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

fn provided_api_key(request: &Request) -> Option<String> {
    let headers = request.headers();
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-goog-api-key")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        })
}

/// Key check for everything except `/` and `/health`. With no configured
/// keys the surface is open.
async fn require_api_key(State(_state): State<AppState>, request: Request, next: Next) -> Response {
    let keys = config::get().api_keys;
    if keys.is_empty() {
        return next.run(request).await;
    }

    if let Some(provided) = provided_api_key(&request) {
        if keys.iter().any(|key| key == &provided) {
            return next.run(request).await;
        }
    }

    let err = ProxyError::AuthRejected;
    let path = request.uri().path();
    let body = if path.starts_with("/v1/") || path.starts_with("/openai/") {
        err.openai_body()
    } else {
        err.gemini_body()
    };
    (axum::http::StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let protected = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/openai/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::openai_models))
        .route("/openai/v1/models", get(handlers::openai_models))
        .route("/v1beta/models", get(handlers::gemini_models))
        .route("/v1alpha/models", get(handlers::gemini_models))
        .route("/v1beta/models/*action", post(handlers::gemini_generate))
        .route("/v1alpha/models/*action", post(handlers::gemini_generate))
        .route("/management/settings", get(handlers::get_settings).put(handlers::put_settings))
        .route("/management/accounts", get(handlers::list_accounts))
        .route("/management/accounts/reload", post(handlers::reload_accounts))
        .route("/management/accounts/switch", post(handlers::switch_account))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

pub async fn start_server(dispatcher: Arc<Dispatcher>) -> Result<()> {
    let config = config::get();
    let addr = format!("{}:{}", config.host, config.port);

    let app = build_router(AppState { dispatcher });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("API server listening on {}", addr);

    let (tx, rx) = oneshot::channel::<()>();
    SERVER_HANDLE
        .get_or_init(|| RwLock::new(None))
        .write()
        .replace(tx);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            rx.await.ok();
        })
        .await?;

    Ok(())
}

pub async fn stop_server() -> Result<()> {
    if let Some(lock) = SERVER_HANDLE.get() {
        if let Some(tx) = lock.write().take() {
            let _ = tx.send(());
            tracing::info!("API server stopped");
        }
    }
    Ok(())
}

pub fn is_server_running() -> bool {
    SERVER_HANDLE
        .get()
        .map(|lock| lock.read().is_some())
        .unwrap_or(false)
}
