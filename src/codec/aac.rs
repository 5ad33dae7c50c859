//! AAC-LC in ADTS
//!
//! Every AAC frame carries its own ADTS header, so a listener can start
//! decoding anywhere and the stream has no separate header. Encoding goes
//! through libfdk-aac.

use bytes::Bytes;
use fdk_aac::enc::{
    AudioObjectType, BitRate, ChannelMode, Encoder, EncoderParams as FdkParams, Transport,
};

use super::{pcm_to_i16, EncoderParams, FrameAccumulator, PacketEncoder};
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::CodecError;

/// Sample frames per AAC-LC frame
pub const FRAME_SAMPLES: usize = 1024;

/// Silent frames fed on finish to push out the encoder's lookahead
const FLUSH_FRAMES: usize = 3;

/// Room for one ADTS frame at any legal bitrate
const MAX_FRAME_BYTES: usize = 8192;

/// libfdk-aac encoder handle
struct Handle(Encoder);

// SAFETY: the handle has no thread affinity and is only used through
// `&mut AacEncoder`, so it is never touched from two threads at once
unsafe impl Send for Handle {}

pub struct AacEncoder {
    handle: Handle,
    frame_bytes: usize,
    acc: FrameAccumulator,
    output: Vec<u8>,
}

impl AacEncoder {
    pub fn new(params: EncoderParams) -> Result<Self, CodecError> {
        let channels = match params.channels {
            1 => ChannelMode::Mono,
            2 => ChannelMode::Stereo,
            n => {
                return Err(CodecError::ConfigRejected(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        let encoder = Encoder::new(FdkParams {
            bit_rate: BitRate::Cbr(params.bitrate),
            sample_rate: params.sample_rate,
            transport: Transport::Adts,
            channels,
            audio_object_type: AudioObjectType::Mpeg4LowComplexity,
        })
        .map_err(|e| {
            CodecError::ConfigRejected(format!(
                "AAC rejected {} Hz at {} bps: {:?}",
                params.sample_rate, params.bitrate, e
            ))
        })?;

        let sample_frame_bytes = params.channels as usize * BYTES_PER_SAMPLE;
        let frame_bytes = FRAME_SAMPLES * sample_frame_bytes;
        Ok(Self {
            handle: Handle(encoder),
            frame_bytes,
            acc: FrameAccumulator::new(frame_bytes, sample_frame_bytes),
            output: vec![0u8; MAX_FRAME_BYTES],
        })
    }

    /// ADTS needs no out-of-band header
    pub fn header(&self) -> Bytes {
        Bytes::new()
    }

    /// Feed one frame of PCM. The encoder lags a few frames behind, so
    /// early calls return `None`.
    fn encode_frame(&mut self, pcm: &[u8]) -> Result<Option<Bytes>, CodecError> {
        let samples = pcm_to_i16(pcm);
        let info = self
            .handle
            .0
            .encode(&samples, &mut self.output)
            .map_err(|e| CodecError::EncodingFailed(format!("{:?}", e)))?;

        if info.output_size == 0 {
            Ok(None)
        } else {
            Ok(Some(Bytes::copy_from_slice(&self.output[..info.output_size])))
        }
    }
}

impl PacketEncoder for AacEncoder {
    fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), CodecError> {
        self.acc.push(pcm);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>, CodecError> {
        while let Some(pcm) = self.acc.take_frame() {
            if let Some(packet) = self.encode_frame(&pcm)? {
                return Ok(Some(packet));
            }
        }
        Ok(None)
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, CodecError> {
        let mut packets = Vec::new();
        while let Some(pcm) = self.acc.take_frame() {
            packets.extend(self.encode_frame(&pcm)?);
        }

        let mut tail = self.acc.take_rest().to_vec();
        if !tail.is_empty() {
            tail.resize(self.frame_bytes, 0);
            packets.extend(self.encode_frame(&tail)?);
        }

        let silence = vec![0u8; self.frame_bytes];
        for _ in 0..FLUSH_FRAMES {
            packets.extend(self.encode_frame(&silence)?);
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> EncoderParams {
        EncoderParams {
            sample_rate: 44100,
            channels: 2,
            bitrate: 128_000,
        }
    }

    /// ADTS sync word and protection-absent bit
    fn is_adts_frame(packet: &[u8]) -> bool {
        packet.len() > 7 && packet[0] == 0xFF && packet[1] & 0xF0 == 0xF0
    }

    /// The 13-bit frame length field of an ADTS header
    fn adts_length(packet: &[u8]) -> usize {
        ((packet[3] as usize & 0x03) << 11) | ((packet[4] as usize) << 3) | (packet[5] as usize >> 5)
    }

    #[test]
    fn test_no_header() {
        let encoder = AacEncoder::new(params()).unwrap();
        assert!(encoder.header().is_empty());
    }

    #[test]
    fn test_frames_are_adts() {
        let mut encoder = AacEncoder::new(params()).unwrap();
        // one second of a quiet ramp
        let pcm: Vec<u8> = (0..44100 * 2)
            .flat_map(|n| ((n % 2000) as i16 - 1000).to_le_bytes())
            .collect();
        encoder.push_pcm(&pcm).unwrap();

        let mut packets = Vec::new();
        while let Some(packet) = encoder.try_receive().unwrap() {
            packets.push(packet);
        }
        packets.extend(encoder.finish().unwrap());

        // 44100 / 1024 frames in, plus the flush
        assert!(packets.len() >= 40, "{} packets", packets.len());
        for packet in &packets {
            assert!(is_adts_frame(packet));
            assert_eq!(adts_length(packet), packet.len());
        }
    }

    #[test]
    fn test_partial_frame_yields_nothing() {
        let mut encoder = AacEncoder::new(params()).unwrap();
        encoder.push_pcm(&[0u8; FRAME_SAMPLES * 4 - 4]).unwrap();
        assert!(encoder.try_receive().unwrap().is_none());
    }

    #[test]
    fn test_rejects_surround() {
        let bad = EncoderParams {
            channels: 6,
            ..params()
        };
        assert!(matches!(AacEncoder::new(bad), Err(CodecError::ConfigRejected(_))));
    }
}
