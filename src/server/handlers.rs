//! HTTP API handlers

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::broadcast::{HubStats, StreamingReader};
use crate::codec::{Codec, EncoderParams, EncodingSession};
use crate::error::{DeliveryError, Error, HubError};
use crate::server::AppState;

/// PCM sample frames pulled from the hub per encode call
const READ_FRAMES: usize = 1024;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiResponse::<()>::error(msg))).into_response()
}

/// Server status
#[derive(serde::Serialize)]
pub struct ServerStatus {
    pub codec: Codec,
    pub mime_type: &'static str,
    pub active_connections: usize,
    pub uptime_seconds: u64,
    pub hub: HubStats,
}

/// Get server status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ServerStatus>> {
    let status = ServerStatus {
        codec: state.codec,
        mime_type: state.codec.mime_type(),
        active_connections: state.active_connections.load(Ordering::Relaxed),
        uptime_seconds: state.started.elapsed().as_secs(),
        hub: state.hub.stats(),
    };

    Json(ApiResponse::ok(status))
}

/// Stream live audio encoded with `codec`.
///
/// The response body stays open until the hub stops, the client goes away,
/// the connection limit expires or the server shuts down.
pub async fn stream_audio(state: Arc<AppState>, codec: Codec) -> Response {
    let handle = match state.hub.subscribe() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("Rejecting stream request: {}", e);
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let format = state.hub.format();
    let session = match EncodingSession::open(codec, EncoderParams::new(format, state.bitrate)) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!("Failed to open {:?} encoder: {}", codec, e);
            if let Err(e) = state.hub.unsubscribe(handle.id()) {
                tracing::debug!("{}", e);
            }
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
        }
    };

    let cancel = state.shutdown.child_token();
    let id = handle.id();
    let reader = StreamingReader::new(handle, cancel.clone());
    let (tx, rx) = mpsc::channel(state.body_buffer);

    let active = state.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(subscriber = id, active, "Client connected to {:?} stream", codec);

    let read_size = format.bytes_per_frame() * READ_FRAMES;
    tokio::spawn(pump(state.clone(), reader, session, tx, cancel.clone(), read_size));

    if let Some(limit) = state.max_connection {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(limit) => {
                    tracing::info!(subscriber = id, "Connection time limit reached");
                    cancel.cancel();
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    let body = CancelOnDrop {
        inner: ReceiverStream::new(rx),
        _guard: cancel.drop_guard(),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, codec.mime_type())
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .unwrap_or_else(|e| error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Response body stream that cancels its connection when dropped
struct CancelOnDrop<S> {
    inner: S,
    _guard: DropGuard,
}

impl<S: Stream + Unpin> Stream for CancelOnDrop<S> {
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

type BodyTx = mpsc::Sender<Result<Bytes, Infallible>>;

/// Move encoded packets from one subscriber to one response body
async fn pump(
    state: Arc<AppState>,
    mut reader: StreamingReader,
    mut session: EncodingSession,
    tx: BodyTx,
    cancel: CancellationToken,
    read_size: usize,
) {
    let id = reader.subscriber_id();

    let result = deliver(&mut reader, &mut session, &tx, &cancel, read_size).await;
    let flush = match &result {
        Ok(()) => !cancel.is_cancelled(),
        Err(e) => {
            tracing::info!(subscriber = id, "Stream ended: {}", e);
            false
        }
    };

    match session.close() {
        Ok(tail) if flush => {
            for packet in tail {
                if send(&tx, &cancel, packet).await.is_err() {
                    break;
                }
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(subscriber = id, "Encoder close failed: {}", e),
    }

    match state.hub.unsubscribe(id) {
        Ok(()) => {}
        // the hub already dropped us (stopped or evicted)
        Err(HubError::NotSubscribed(_)) => {
            tracing::debug!(subscriber = id, "Already unsubscribed")
        }
        Err(e) => tracing::warn!(subscriber = id, "Unsubscribe failed: {}", e),
    }

    let stats = session.stats();
    let active = state.active_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    tracing::info!(
        subscriber = id,
        active,
        packets = stats.packets_produced,
        bytes = stats.bytes_produced,
        "Client disconnected"
    );
}

async fn deliver(
    reader: &mut StreamingReader,
    session: &mut EncodingSession,
    tx: &BodyTx,
    cancel: &CancellationToken,
    read_size: usize,
) -> Result<(), Error> {
    if let Some(header) = session.take_header() {
        send(tx, cancel, header).await?;
    }

    while let Some(pcm) = reader.read(read_size).await {
        for packet in session.encode(&pcm)? {
            send(tx, cancel, packet).await?;
        }
    }
    Ok(())
}

async fn send(tx: &BodyTx, cancel: &CancellationToken, packet: Bytes) -> Result<(), DeliveryError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        sent = tx.send(Ok(packet)) => sent.map_err(|_| DeliveryError::WriteFailed),
    }
}
