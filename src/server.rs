use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::errors::{AppError, AppResult};
use crate::hub::{ConnectionHub, ConnectionPump};
use crate::marketdata::{Candle, Pair, PriceStore};

pub const SUBSCRIBE_PATH: &str = "/ws";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[derive(Clone)]
struct AppState {
    hub: Arc<ConnectionHub>,
    store: Arc<PriceStore>,
}

/// Accepts subscriber upgrades and owns their lifecycle through shutdown.
pub struct Server {
    config: ServerConfig,
    hub: Arc<ConnectionHub>,
    store: Arc<PriceStore>,
    listener: TcpListener,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        hub: Arc<ConnectionHub>,
        store: Arc<PriceStore>,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| AppError::Server(format!("failed to bind {}: {e}", config.listen_addr)))?;
        Ok(Self {
            config,
            hub,
            store,
            listener,
        })
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    fn router(&self) -> Router {
        let state = AppState {
            hub: Arc::clone(&self.hub),
            store: Arc::clone(&self.store),
        };
        Router::new()
            .route(SUBSCRIBE_PATH, get(subscribe))
            .route("/health", get(health))
            .route("/history/:base/:quote", get(history))
            .layer(TimeoutLayer::new(self.config.read_timeout))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serves until `shutdown` fires, then drains subscribers: normal close
    /// first, force-close once the grace period is spent.
    #[instrument(skip_all)]
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        let addr = self.local_addr()?;
        let app = self.router();
        let grace = self.config.shutdown_grace;

        let stop = shutdown.clone();
        let serve = axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await });
        let mut server = tokio::spawn(async move { serve.await });
        info!(%addr, path = SUBSCRIBE_PATH, "listening for subscribers");

        tokio::select! {
            result = &mut server => {
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(AppError::Io(e)),
                    Err(e) => Err(AppError::Server(e.to_string())),
                };
            }
            _ = shutdown.cancelled() => {}
        }

        info!("shutting down server");
        drain(&self.hub, &mut server, grace).await;
        info!("server stopped");
        Ok(())
    }
}

/// Closes subscribers and waits for the http server, both within one `grace`
/// window.
async fn drain(hub: &ConnectionHub, server: &mut JoinHandle<io::Result<()>>, grace: Duration) {
    let deadline = Instant::now() + grace;
    let forced = hub.shutdown(grace).await;
    if forced > 0 {
        warn!(forced, "shutdown grace period exceeded");
    }

    match tokio::time::timeout_at(deadline, &mut *server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "http server exited with error"),
        Ok(Err(e)) => warn!(error = %e, "http server task failed"),
        Err(_) => {
            warn!("http server did not drain in time, aborting");
            server.abort();
        }
    }
}

async fn subscribe(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| ConnectionPump::serve(state.hub, socket))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    pairs: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.len(),
        pairs: state.store.len(),
    })
}

#[derive(Debug, Serialize)]
struct HistoryResponse {
    pair: Pair,
    open: Option<Candle>,
    sealed: Vec<Candle>,
}

async fn history(
    Path((base, quote)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, StatusCode> {
    let pair = Pair::new(base, quote);
    let entry = state.store.get(&pair).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(HistoryResponse {
        open: entry.candle.clone(),
        sealed: entry.history.iter().cloned().collect(),
        pair,
    }))
}
