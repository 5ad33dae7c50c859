//! Pull-style reader over one subscriber queue
//!
//! Chunks arrive in the hub's chunk size; encoders want their own window
//! sizes. The reader re-windows the byte stream and races every wait
//! against the connection's cancellation token.

use bytes::{Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use super::hub::{SubscriberHandle, SubscriberId};

pub struct StreamingReader {
    handle: SubscriberHandle,
    cancel: CancellationToken,
    buf: BytesMut,
    closed: bool,
}

impl StreamingReader {
    pub fn new(handle: SubscriberHandle, cancel: CancellationToken) -> Self {
        Self {
            handle,
            cancel,
            buf: BytesMut::new(),
            closed: false,
        }
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.handle.id()
    }

    /// Bytes buffered but not yet handed out
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Read exactly `n` bytes.
    ///
    /// Once the queue is closed the remaining bytes come back as a shorter
    /// window, then `None`. Cancellation returns `None` at once and discards
    /// whatever was buffered.
    pub async fn read(&mut self, n: usize) -> Option<Bytes> {
        while self.buf.len() < n && !self.closed {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.buf.clear();
                    return None;
                }
                chunk = self.handle.recv() => match chunk {
                    Some(chunk) => self.buf.extend_from_slice(&chunk),
                    None => self.closed = true,
                },
            }
        }

        if self.cancel.is_cancelled() {
            self.buf.clear();
            return None;
        }
        if n > 0 && self.buf.is_empty() {
            return None;
        }

        let take = n.min(self.buf.len());
        Some(self.buf.split_to(take).freeze())
    }
}
