//! Opus in Ogg (RFC 7845)
//!
//! Header pages carry `OpusHead` and `OpusTags`; every 20 ms of PCM becomes
//! one Opus packet on its own page.

use bytes::{BufMut, Bytes, BytesMut};
use opus::{Application, Bitrate, Channels, Encoder};

use super::ogg::{OggStream, FLAG_BOS, FLAG_EOS};
use super::{pcm_to_i16, EncoderParams, FrameAccumulator, PacketEncoder};
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::CodecError;

const SUPPORTED_RATES: [u32; 5] = [8_000, 12_000, 16_000, 24_000, 48_000];
const MIN_BITRATE: u32 = 6_000;
const MAX_BITRATE: u32 = 510_000;

/// Frame duration in milliseconds
const FRAME_MS: u32 = 20;

/// Granule positions always count 48 kHz samples
const GRANULE_PER_FRAME: u64 = 48_000 * FRAME_MS as u64 / 1000;

/// Encoder delay at 48 kHz reported in OpusHead
const PRE_SKIP: u16 = 312;

/// Largest packet libopus will produce
const MAX_PACKET_SIZE: usize = 4000;

const VENDOR: &str = concat!("pacc ", env!("CARGO_PKG_VERSION"));

pub struct OpusOggEncoder {
    encoder: Encoder,
    sample_rate: u32,
    channels: u16,
    acc: FrameAccumulator,
    ogg: OggStream,
    granule: u64,
    encode_buffer: Vec<u8>,
    header: Bytes,
}

impl OpusOggEncoder {
    pub fn new(params: EncoderParams) -> Result<Self, CodecError> {
        if !SUPPORTED_RATES.contains(&params.sample_rate) {
            return Err(CodecError::ConfigRejected(format!(
                "Opus needs one of {:?} Hz, got {}",
                SUPPORTED_RATES, params.sample_rate
            )));
        }
        let channels = match params.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::ConfigRejected(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };
        if !(MIN_BITRATE..=MAX_BITRATE).contains(&params.bitrate) {
            return Err(CodecError::ConfigRejected(format!(
                "Opus bitrate out of range: {}",
                params.bitrate
            )));
        }

        let mut encoder = Encoder::new(params.sample_rate, channels, Application::Audio)
            .map_err(|e| CodecError::Unavailable(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::Bits(params.bitrate as i32))
            .map_err(|e| CodecError::ConfigRejected(format!("Failed to set bitrate: {}", e)))?;

        let sample_frame_bytes = params.channels as usize * BYTES_PER_SAMPLE;
        let frame_samples = (params.sample_rate * FRAME_MS / 1000) as usize;

        let mut ogg = OggStream::new(stream_serial());
        let header = header_pages(&mut ogg, params.sample_rate, params.channels);

        Ok(Self {
            encoder,
            sample_rate: params.sample_rate,
            channels: params.channels,
            acc: FrameAccumulator::new(frame_samples * sample_frame_bytes, sample_frame_bytes),
            ogg,
            granule: 0,
            encode_buffer: vec![0u8; MAX_PACKET_SIZE],
            header,
        })
    }

    fn frame_bytes(&self) -> usize {
        (self.sample_rate * FRAME_MS / 1000) as usize * self.channels as usize * BYTES_PER_SAMPLE
    }

    /// The two header pages: identification then comments
    pub fn header(&self) -> Bytes {
        self.header.clone()
    }

    fn encode_frame(&mut self, pcm: &[u8], flags: u8) -> Result<Bytes, CodecError> {
        let samples = pcm_to_i16(pcm);
        let len = self
            .encoder
            .encode(&samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.granule += GRANULE_PER_FRAME;
        Ok(self.ogg.page(&self.encode_buffer[..len], self.granule, flags))
    }
}

impl PacketEncoder for OpusOggEncoder {
    fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), CodecError> {
        self.acc.push(pcm);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>, CodecError> {
        match self.acc.take_frame() {
            Some(pcm) => self.encode_frame(&pcm, 0).map(Some),
            None => Ok(None),
        }
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, CodecError> {
        let mut packets = Vec::new();
        while let Some(pcm) = self.acc.take_frame() {
            packets.push(self.encode_frame(&pcm, 0)?);
        }

        // the last page must carry EOS; pad the tail (or silence) to a frame
        let mut tail = self.acc.take_rest().to_vec();
        tail.resize(self.frame_bytes(), 0);
        packets.push(self.encode_frame(&tail, FLAG_EOS)?);
        Ok(packets)
    }
}

fn header_pages(ogg: &mut OggStream, sample_rate: u32, channels: u16) -> Bytes {
    let mut head = BytesMut::with_capacity(19);
    head.put_slice(b"OpusHead");
    head.put_u8(1);
    head.put_u8(channels as u8);
    head.put_u16_le(PRE_SKIP);
    head.put_u32_le(sample_rate);
    // output gain, channel mapping family
    head.put_i16_le(0);
    head.put_u8(0);

    let mut tags = BytesMut::with_capacity(16 + VENDOR.len());
    tags.put_slice(b"OpusTags");
    tags.put_u32_le(VENDOR.len() as u32);
    tags.put_slice(VENDOR.as_bytes());
    tags.put_u32_le(0);

    let mut out = BytesMut::new();
    out.put(ogg.page(&head, 0, FLAG_BOS));
    out.put(ogg.page(&tags, 0, 0));
    out.freeze()
}

/// Stream serial numbers only need to differ between concurrent streams
fn stream_serial() -> u32 {
    chrono::Utc::now().timestamp_subsec_nanos() ^ std::process::id()
}
