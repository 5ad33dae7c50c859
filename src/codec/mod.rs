//! Encoding pipeline
//!
//! Every codec sits behind [`PacketEncoder`]: push raw PCM, then pull
//! packets until the codec has nothing ready. Codecs buffer internally, so
//! one push can yield zero packets or several. [`EncodingSession`] owns one
//! codec for one connection and runs the drain loop after every push.

pub mod aac;
pub mod flac;
pub mod ogg;
pub mod ogg_opus;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::audio::AudioFormat;
use crate::error::CodecError;

pub use aac::AacEncoder;
pub use flac::FlacEncoder;
pub use ogg_opus::OpusOggEncoder;

/// Output codec of the stream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    Flac,
    Opus,
    Aac,
}

impl Codec {
    /// Every codec the stream endpoint serves
    pub const ALL: [Codec; 3] = [Codec::Flac, Codec::Opus, Codec::Aac];

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Flac => "audio/flac",
            Codec::Opus => "audio/ogg",
            Codec::Aac => "audio/aac",
        }
    }

    /// File extension used in the stream path
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::Flac => "flac",
            Codec::Opus => "ogg",
            Codec::Aac => "aac",
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::Flac
    }
}

/// Parameters an encoder is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Target bitrate in bits per second; ignored by lossless codecs
    pub bitrate: u32,
}

impl EncoderParams {
    pub fn new(format: AudioFormat, bitrate: u32) -> Self {
        Self {
            sample_rate: format.sample_rate,
            channels: format.channels,
            bitrate,
        }
    }
}

/// Codec boundary: push PCM, pull packets
pub trait PacketEncoder: Send {
    /// Queue interleaved s16le PCM. Never produces output by itself.
    fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), CodecError>;

    /// Next ready packet, or `Ok(None)` when the codec needs more input
    fn try_receive(&mut self) -> Result<Option<Bytes>, CodecError>;

    /// Encode whatever is still buffered and return the final packets
    fn finish(&mut self) -> Result<Vec<Bytes>, CodecError>;
}

/// Instantiate a codec. Returns the stream header and the encoder.
pub fn open_encoder(
    codec: Codec,
    params: EncoderParams,
) -> Result<(Bytes, Box<dyn PacketEncoder>), CodecError> {
    match codec {
        Codec::Flac => {
            let encoder = FlacEncoder::new(params)?;
            Ok((encoder.header(), Box::new(encoder)))
        }
        Codec::Opus => {
            let encoder = OpusOggEncoder::new(params)?;
            Ok((encoder.header(), Box::new(encoder)))
        }
        Codec::Aac => {
            let encoder = AacEncoder::new(params)?;
            Ok((encoder.header(), Box::new(encoder)))
        }
    }
}

/// Encoding statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    pub packets_produced: u64,
    pub bytes_produced: u64,
}

/// One codec instance bound to one output stream
pub struct EncodingSession {
    codec: Codec,
    encoder: Option<Box<dyn PacketEncoder>>,
    header: Option<Bytes>,
    stats: EncoderStats,
}

impl EncodingSession {
    pub fn open(codec: Codec, params: EncoderParams) -> Result<Self, CodecError> {
        let (header, encoder) = open_encoder(codec, params)?;
        Ok(Self::from_encoder(codec, header, encoder))
    }

    /// Wrap an already opened encoder. An empty `header` means none is sent.
    pub fn from_encoder(codec: Codec, header: Bytes, encoder: Box<dyn PacketEncoder>) -> Self {
        Self {
            codec,
            encoder: Some(encoder),
            header: Some(header).filter(|h| !h.is_empty()),
            stats: EncoderStats::default(),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn mime_type(&self) -> &'static str {
        self.codec.mime_type()
    }

    /// Stream header; `Some` on the first call only
    pub fn take_header(&mut self) -> Option<Bytes> {
        self.header.take()
    }

    /// Push one block of PCM and drain every packet the codec has ready
    pub fn encode(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        let encoder = self.encoder.as_mut().ok_or(CodecError::AlreadyClosed)?;
        encoder.push_pcm(pcm)?;

        let mut packets = Vec::new();
        while let Some(packet) = encoder.try_receive()? {
            packets.push(packet);
        }
        self.record(&packets);
        Ok(packets)
    }

    /// Flush the codec and release it. A second call is an error.
    pub fn close(&mut self) -> Result<Vec<Bytes>, CodecError> {
        let mut encoder = self.encoder.take().ok_or(CodecError::AlreadyClosed)?;
        let packets = encoder.finish()?;
        self.record(&packets);
        Ok(packets)
    }

    pub fn is_closed(&self) -> bool {
        self.encoder.is_none()
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    fn record(&mut self, packets: &[Bytes]) {
        self.stats.packets_produced += packets.len() as u64;
        self.stats.bytes_produced += packets.iter().map(|p| p.len() as u64).sum::<u64>();
    }
}

/// Collects PCM until a whole codec frame is available
pub(crate) struct FrameAccumulator {
    pending: BytesMut,
    frame_bytes: usize,
    sample_frame_bytes: usize,
}

impl FrameAccumulator {
    pub(crate) fn new(frame_bytes: usize, sample_frame_bytes: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(frame_bytes * 2),
            frame_bytes,
            sample_frame_bytes,
        }
    }

    pub(crate) fn push(&mut self, pcm: &[u8]) {
        self.pending.extend_from_slice(pcm);
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.len()
    }

    /// One full frame, if buffered
    pub(crate) fn take_frame(&mut self) -> Option<Bytes> {
        if self.pending.len() >= self.frame_bytes {
            Some(self.pending.split_to(self.frame_bytes).freeze())
        } else {
            None
        }
    }

    /// Everything left, trimmed to whole sample frames
    pub(crate) fn take_rest(&mut self) -> Bytes {
        let whole = self.pending.len() - self.pending.len() % self.sample_frame_bytes;
        let rest = self.pending.split_to(whole).freeze();
        self.pending.clear();
        rest
    }
}

/// Interleaved s16le bytes to samples
pub(crate) fn pcm_to_i16(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}
