//! Cast receiver transport
//!
//! `rust_cast` talks to the device over a blocking TLS socket, so each
//! connection is owned by one `cast-control` thread. Commands reach it over
//! a channel and answers come back on a oneshot. The thread pings the
//! receiver while idle so the virtual connection stays up.

use std::net::IpAddr;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rust_cast::channels::media::{Media, StreamType};
use rust_cast::channels::receiver::CastDeviceApp;
use rust_cast::CastDevice;
use tokio::sync::oneshot;

use super::{ControlTransport, MediaRequest, PlaybackSession};
use crate::error::ControlError;

/// Platform endpoint every sender connects to first
const RECEIVER_ID: &str = "receiver-0";

/// Idle time between keep-alive pings
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

enum Command {
    Play { media: MediaRequest, reply: Reply<()> },
    Quit { reply: Reply<()> },
}

/// [`ControlTransport`] speaking the Cast protocol through `rust_cast`
#[derive(Default)]
pub struct CastTransport {
    /// Inbox of the control thread while connected
    worker: Mutex<Option<Sender<Command>>>,
}

impl CastTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn commands(&self) -> Result<Sender<Command>, ControlError> {
        self.worker
            .lock()
            .clone()
            .ok_or(ControlError::NoSession)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (reply, answer) = oneshot::channel();
        self.commands()?
            .send(build(reply))
            .map_err(|_| ControlError::Command("control connection closed".to_string()))?;
        answer
            .await
            .map_err(|_| ControlError::Command("control connection closed".to_string()))?
    }
}

#[async_trait]
impl ControlTransport for CastTransport {
    async fn connect(&self, address: IpAddr, port: u16, app_id: &str) -> Result<String, ControlError> {
        if self.worker.lock().is_some() {
            return Err(ControlError::SessionActive);
        }

        let (commands, inbox) = crossbeam_channel::unbounded();
        let (ready, launched) = oneshot::channel();
        let app_id = app_id.to_string();
        thread::Builder::new()
            .name("cast-control".to_string())
            .spawn(move || run(address, port, &app_id, ready, inbox))
            .map_err(|e| ControlError::Connection {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let session_id = launched.await.map_err(|_| ControlError::Connection {
            address: address.to_string(),
            reason: "control thread exited".to_string(),
        })??;

        *self.worker.lock() = Some(commands);
        Ok(session_id)
    }

    async fn play_media(&self, _session: &PlaybackSession, media: &MediaRequest) -> Result<(), ControlError> {
        let media = media.clone();
        self.request(|reply| Command::Play { media, reply }).await
    }

    async fn quit(&self, _session: &PlaybackSession) -> Result<(), ControlError> {
        let result = self.request(|reply| Command::Quit { reply }).await;
        // the thread exits once its inbox is gone
        self.worker.lock().take();
        result
    }
}

/// Body of the `cast-control` thread
fn run(
    address: IpAddr,
    port: u16,
    app_id: &str,
    ready: Reply<String>,
    inbox: Receiver<Command>,
) {
    let connection_error = |e: rust_cast::errors::Error| ControlError::Connection {
        address: address.to_string(),
        reason: e.to_string(),
    };
    let command_error = |e: rust_cast::errors::Error| ControlError::Command(e.to_string());

    let opened = (|| -> Result<_, ControlError> {
        let device = CastDevice::connect_without_host_verification(address.to_string(), port)
            .map_err(connection_error)?;
        device.connection.connect(RECEIVER_ID).map_err(connection_error)?;
        device.heartbeat.ping().map_err(connection_error)?;

        let app = CastDeviceApp::from_str(app_id).unwrap_or_else(|_| CastDeviceApp::Custom(app_id.to_string()));
        let app = device.receiver.launch_app(&app).map_err(command_error)?;
        device
            .connection
            .connect(app.transport_id.clone())
            .map_err(command_error)?;
        Ok((device, app))
    })();

    let (device, app) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    tracing::debug!("Launched {} on {} (transport {})", app.app_id, address, app.transport_id);
    if ready.send(Ok(app.session_id.clone())).is_err() {
        return;
    }

    loop {
        match inbox.recv_timeout(HEARTBEAT_INTERVAL) {
            Ok(Command::Play { media, reply }) => {
                let request = Media {
                    content_id: media.url,
                    content_type: media.mime_type,
                    stream_type: StreamType::Live,
                    duration: None,
                    metadata: None,
                };
                let result = device
                    .media
                    .load(app.transport_id.clone(), app.session_id.clone(), &request)
                    .map(|_| ())
                    .map_err(command_error);
                let _ = reply.send(result);
            }
            Ok(Command::Quit { reply }) => {
                let result = device
                    .receiver
                    .stop_app(app.session_id.clone())
                    .map(|_| ())
                    .map_err(command_error);
                let _ = reply.send(result);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = device.heartbeat.ping() {
                    tracing::warn!("Lost connection to {}: {}", address, e);
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    fn session() -> PlaybackSession {
        PlaybackSession {
            device_name: "Kitchen".to_string(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8009,
            app_session_id: "none".to_string(),
        }
    }

    #[tokio::test]
    async fn test_refused_connection() {
        // grab a free port, then close it so nothing listens there
        let port = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let transport = CastTransport::new();
        let result = transport
            .connect(IpAddr::V4(Ipv4Addr::LOCALHOST), port, "CC1AD845")
            .await;
        assert!(matches!(result, Err(ControlError::Connection { .. })));
        assert!(transport.worker.lock().is_none());
    }

    #[tokio::test]
    async fn test_commands_without_connection() {
        let transport = CastTransport::new();
        let media = MediaRequest::new("http://127.0.0.1:8080/stream.flac", "audio/flac");
        assert!(matches!(
            transport.play_media(&session(), &media).await,
            Err(ControlError::NoSession)
        ));
        assert!(matches!(
            transport.quit(&session()).await,
            Err(ControlError::NoSession)
        ));
    }
}
