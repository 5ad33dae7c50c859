//! HTTP delivery server
//!
//! Serves the live stream and a JSON status endpoint. Every stream request
//! gets its own hub subscription, encoder and cancellation token.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::State, routing::get, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::broadcast::BroadcastHub;
use crate::codec::Codec;
use crate::config::StreamConfig;
use crate::error::DeliveryError;

pub use handlers::ApiResponse;

/// Shared state for handlers
pub struct AppState {
    pub hub: BroadcastHub,
    /// Codec advertised to the receiver
    pub codec: Codec,
    pub bitrate: u32,
    pub max_connection: Option<Duration>,
    pub body_buffer: usize,
    /// Parent of every connection token
    pub shutdown: CancellationToken,
    pub active_connections: AtomicUsize,
    pub started: Instant,
}

impl AppState {
    pub fn new(hub: BroadcastHub, config: &StreamConfig) -> Self {
        Self {
            hub,
            codec: config.codec,
            bitrate: config.bitrate,
            max_connection: config.max_connection(),
            body_buffer: config.body_buffer.max(1),
            shutdown: CancellationToken::new(),
            active_connections: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }
}

/// Stream endpoint path for a codec
pub fn stream_path(codec: Codec) -> String {
    format!("/stream.{}", codec.extension())
}

/// Build the router. Every codec gets its own stream path.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/status", get(handlers::get_status));
    for codec in Codec::ALL {
        router = router.route(
            &stream_path(codec),
            get(move |State(state): State<Arc<AppState>>| {
                handlers::stream_audio(state, codec)
            }),
        );
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

pub struct StreamServer {
    state: Arc<AppState>,
    bind: String,
    port: u16,
}

impl StreamServer {
    pub fn new(hub: BroadcastHub, config: &StreamConfig) -> Self {
        Self {
            state: Arc::new(AppState::new(hub, config)),
            bind: config.bind_address.clone(),
            port: config.port,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Cancelling this ends every open stream and stops the listener
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Bind the listener. Returns the bound address and the running server.
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<()>), DeliveryError> {
        let addr = format!("{}:{}", self.bind, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DeliveryError::BindFailed(format!("{}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| DeliveryError::BindFailed(e.to_string()))?;

        tracing::info!("Stream server listening on http://{}", local);

        let shutdown = self.state.shutdown.clone();
        let app = router(self.state);
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Stream server error: {}", e);
            }
            tracing::info!("Stream server stopped");
        });

        Ok((local, handle))
    }
}
