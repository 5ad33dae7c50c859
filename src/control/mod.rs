//! Receiver session control
//!
//! A [`SessionController`] owns at most one playback session on one
//! receiver. The wire protocol lives behind [`ControlTransport`]:
//! [`CastTransport`] talks to real devices, [`DryRunTransport`] only logs.

pub mod cast;

pub use cast::CastTransport;

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;

use crate::constants::DEFAULT_APP_ID;
use crate::discovery::DeviceDescriptor;
use crate::error::ControlError;

/// Subtitle track id meaning "no subtitles"
pub const NO_SUBTITLES: &str = "NONE";

/// One-shot request to play a URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaRequest {
    pub url: String,
    pub mime_type: String,
    pub subtitle_track: String,
}

impl MediaRequest {
    pub fn new(url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: mime_type.into(),
            subtitle_track: NO_SUBTITLES.to_string(),
        }
    }
}

/// Application session on a connected receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSession {
    pub device_name: String,
    pub address: IpAddr,
    pub port: u16,
    pub app_session_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitOutcome {
    /// The receiver confirmed in time
    Acknowledged,
    /// Timed out or failed; the session was dropped locally anyway
    Abandoned,
}

/// Device control protocol
#[async_trait]
pub trait ControlTransport: Send + Sync {
    /// Open a control channel and launch `app_id`. Returns the app session id.
    async fn connect(&self, address: IpAddr, port: u16, app_id: &str) -> Result<String, ControlError>;

    async fn play_media(&self, session: &PlaybackSession, media: &MediaRequest) -> Result<(), ControlError>;

    async fn quit(&self, session: &PlaybackSession) -> Result<(), ControlError>;
}

#[async_trait]
impl<T: ControlTransport + ?Sized> ControlTransport for Box<T> {
    async fn connect(&self, address: IpAddr, port: u16, app_id: &str) -> Result<String, ControlError> {
        (**self).connect(address, port, app_id).await
    }

    async fn play_media(&self, session: &PlaybackSession, media: &MediaRequest) -> Result<(), ControlError> {
        (**self).play_media(session, media).await
    }

    async fn quit(&self, session: &PlaybackSession) -> Result<(), ControlError> {
        (**self).quit(session).await
    }
}

pub struct SessionController<T> {
    transport: T,
    app_id: String,
    session: Option<PlaybackSession>,
}

impl<T: ControlTransport> SessionController<T> {
    pub fn new(transport: T) -> Self {
        Self::with_app_id(transport, DEFAULT_APP_ID)
    }

    pub fn with_app_id(transport: T, app_id: impl Into<String>) -> Self {
        Self {
            transport,
            app_id: app_id.into(),
            session: None,
        }
    }

    pub fn session(&self) -> Option<&PlaybackSession> {
        self.session.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn connect(&mut self, device: &DeviceDescriptor) -> Result<&PlaybackSession, ControlError> {
        if self.session.is_some() {
            return Err(ControlError::SessionActive);
        }

        let app_session_id = self
            .transport
            .connect(device.address, device.port, &self.app_id)
            .await?;
        tracing::info!(
            "Connected to {} at {}:{} (session {})",
            device.name,
            device.address,
            device.port,
            app_session_id
        );

        Ok(&*self.session.insert(PlaybackSession {
            device_name: device.name.clone(),
            address: device.address,
            port: device.port,
            app_session_id,
        }))
    }

    /// Ask the receiver to play `url`. Sent once, never retried.
    pub async fn play_media(&self, url: &str, mime_type: &str) -> Result<(), ControlError> {
        let session = self.session.as_ref().ok_or(ControlError::NoSession)?;
        let media = MediaRequest::new(url, mime_type);

        tracing::info!("Playing {} ({}) on {}", media.url, media.mime_type, session.device_name);
        self.transport.play_media(session, &media).await
    }

    /// Stop the receiver application, waiting at most `timeout`
    pub async fn quit(&mut self, timeout: Duration) -> Result<QuitOutcome, ControlError> {
        let session = self.session.take().ok_or(ControlError::NoSession)?;

        let outcome = match tokio::time::timeout(timeout, self.transport.quit(&session)).await {
            Ok(Ok(())) => QuitOutcome::Acknowledged,
            Ok(Err(e)) => {
                tracing::warn!("Quit on {} failed: {}", session.device_name, e);
                QuitOutcome::Abandoned
            }
            Err(_) => {
                tracing::warn!(
                    "Quit on {} failed: {}",
                    session.device_name,
                    ControlError::CommandTimeout(timeout)
                );
                QuitOutcome::Abandoned
            }
        };

        tracing::info!("Session {} closed: {:?}", session.app_session_id, outcome);
        Ok(outcome)
    }
}

/// A command as seen by the dry-run transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Connect { address: IpAddr, port: u16, app_id: String },
    PlayMedia(MediaRequest),
    Quit { app_session_id: String },
}

/// Logs every command instead of talking to a device
#[derive(Default)]
pub struct DryRunTransport {
    next_session: AtomicU64,
    history: Mutex<Vec<ControlCommand>>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands issued so far, oldest first
    pub fn history(&self) -> Vec<ControlCommand> {
        self.history.lock().clone()
    }

    fn record(&self, command: ControlCommand) {
        tracing::info!("[dry-run] {:?}", command);
        self.history.lock().push(command);
    }
}

#[async_trait]
impl ControlTransport for DryRunTransport {
    async fn connect(&self, address: IpAddr, port: u16, app_id: &str) -> Result<String, ControlError> {
        self.record(ControlCommand::Connect {
            address,
            port,
            app_id: app_id.to_string(),
        });
        let n = self.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("dry-run-{}", n))
    }

    async fn play_media(&self, _session: &PlaybackSession, media: &MediaRequest) -> Result<(), ControlError> {
        self.record(ControlCommand::PlayMedia(media.clone()));
        Ok(())
    }

    async fn quit(&self, session: &PlaybackSession) -> Result<(), ControlError> {
        self.record(ControlCommand::Quit {
            app_session_id: session.app_session_id.clone(),
        });
        Ok(())
    }
}
