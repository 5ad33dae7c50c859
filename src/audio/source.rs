//! Raw PCM sources feeding the broadcast hub
//!
//! Every source hands out fixed-size chunks of interleaved s16le samples.
//! Reads block; the hub drives them from its own thread.

use std::io::{ErrorKind, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::constants::BYTES_PER_SAMPLE;
use crate::error::SourceError;

/// Sample rate and channel layout agreed with the source up front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes in one interleaved sample frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// PCM bytes per second of audio
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }
}

/// Blocking producer of raw PCM chunks
pub trait AudioSource: Send + 'static {
    /// Format of every chunk this source produces
    fn format(&self) -> AudioFormat;

    /// Read the next chunk. `Ok(None)` is a clean end of stream.
    fn read_chunk(&mut self) -> Result<Option<Bytes>, SourceError>;
}

impl AudioSource for Box<dyn AudioSource> {
    fn format(&self) -> AudioFormat {
        (**self).format()
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        (**self).read_chunk()
    }
}

/// Source over any byte reader (pipe, file, child stdout)
pub struct ReaderSource<R> {
    reader: R,
    format: AudioFormat,
    chunk_size: usize,
    eof: bool,
}

impl<R: Read + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R, format: AudioFormat, chunk_size: usize) -> Self {
        Self {
            reader,
            format,
            chunk_size,
            eof: false,
        }
    }
}

impl<R: Read + Send + 'static> AudioSource for ReaderSource<R> {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        if self.eof {
            return Ok(None);
        }

        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(SourceError::Io(e)),
            }
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }
}

/// Source fed from another thread over a bounded channel.
///
/// Dropping every sender ends the stream.
pub struct ChannelSource {
    rx: Receiver<Bytes>,
    format: AudioFormat,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Bytes>, format: AudioFormat) -> Self {
        Self { rx, format }
    }
}

/// Create a channel-backed source and the sender that feeds it
pub fn channel_source(format: AudioFormat, capacity: usize) -> (Sender<Bytes>, ChannelSource) {
    let (tx, rx) = bounded(capacity);
    (tx, ChannelSource::new(rx, format))
}

impl AudioSource for ChannelSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        Ok(self.rx.recv().ok())
    }
}

/// Records the monitor of a PulseAudio sink through a `parec` child process
pub struct ParecSource {
    child: Child,
    inner: ReaderSource<ChildStdout>,
}

impl ParecSource {
    /// Start recording `<sink_name>.monitor`
    pub fn spawn(sink_name: &str, format: AudioFormat, chunk_size: usize) -> Result<Self, SourceError> {
        let mut child = Command::new("parec")
            .arg(format!("--device={}.monitor", sink_name))
            .arg("--format=s16le")
            .arg(format!("--rate={}", format.sample_rate))
            .arg(format!("--channels={}", format.channels))
            .arg("--raw")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("failed to spawn parec: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unavailable("parec has no stdout".to_string()))?;

        tracing::info!(sink = sink_name, pid = child.id(), "Recording sink monitor");

        Ok(Self {
            child,
            inner: ReaderSource::new(stdout, format, chunk_size),
        })
    }
}

impl AudioSource for ParecSource {
    fn format(&self) -> AudioFormat {
        self.inner.format()
    }

    fn read_chunk(&mut self) -> Result<Option<Bytes>, SourceError> {
        self.inner.read_chunk()
    }
}

impl Drop for ParecSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!("parec already exited: {}", e);
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_reader_source_chunks_and_tail() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut source = ReaderSource::new(Cursor::new(data.clone()), AudioFormat::new(44100, 2), 4096);

        let a = source.read_chunk().unwrap().unwrap();
        let b = source.read_chunk().unwrap().unwrap();
        let c = source.read_chunk().unwrap().unwrap();
        assert_eq!(a.len(), 4096);
        assert_eq!(b.len(), 4096);
        assert_eq!(c.len(), 10_000 - 8192);
        assert!(source.read_chunk().unwrap().is_none());

        let joined: Vec<u8> = [a, b, c].iter().flat_map(|c| c.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = channel_source(AudioFormat::new(48000, 1), 4);
        tx.send(Bytes::from_static(b"abcd")).unwrap();
        drop(tx);

        assert_eq!(source.read_chunk().unwrap().unwrap(), Bytes::from_static(b"abcd"));
        assert!(source.read_chunk().unwrap().is_none());
    }

    #[test]
    fn test_format_sizes() {
        let format = AudioFormat::new(44100, 2);
        assert_eq!(format.bytes_per_frame(), 4);
        assert_eq!(format.bytes_per_second(), 176_400);
    }
}
