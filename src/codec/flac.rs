//! Streaming FLAC framer
//!
//! Emits a `fLaC` marker with a STREAMINFO block as the stream header, then
//! one fixed-blocksize frame per 4096 sample frames. Subframes are stored
//! verbatim, so the output is valid lossless FLAC that any decoder can join
//! from the header on. Total sample count and MD5 are left unknown since
//! the stream has no end.

use bytes::{BufMut, Bytes, BytesMut};

use super::{pcm_to_i16, EncoderParams, FrameAccumulator, PacketEncoder};
use crate::constants::BYTES_PER_SAMPLE;
use crate::error::CodecError;

/// Sample frames per FLAC frame
pub const BLOCK_SIZE: usize = 4096;

const MAX_SAMPLE_RATE: u32 = 655_350;
const MAX_CHANNELS: u16 = 8;
const BITS_PER_SAMPLE: u8 = 16;

pub struct FlacEncoder {
    sample_rate: u32,
    channels: u16,
    acc: FrameAccumulator,
    frame_number: u64,
}

impl FlacEncoder {
    pub fn new(params: EncoderParams) -> Result<Self, CodecError> {
        if params.channels == 0 || params.channels > MAX_CHANNELS {
            return Err(CodecError::ConfigRejected(format!(
                "FLAC supports 1-{} channels, got {}",
                MAX_CHANNELS, params.channels
            )));
        }
        if params.sample_rate == 0 || params.sample_rate > MAX_SAMPLE_RATE {
            return Err(CodecError::ConfigRejected(format!(
                "unsupported FLAC sample rate: {}",
                params.sample_rate
            )));
        }

        let sample_frame_bytes = params.channels as usize * BYTES_PER_SAMPLE;
        Ok(Self {
            sample_rate: params.sample_rate,
            channels: params.channels,
            acc: FrameAccumulator::new(BLOCK_SIZE * sample_frame_bytes, sample_frame_bytes),
            frame_number: 0,
        })
    }

    /// `fLaC` marker followed by the (last) STREAMINFO metadata block
    pub fn header(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(42);
        out.put_slice(b"fLaC");
        // last-metadata-block flag set, type 0 (STREAMINFO), length 34
        out.put_u8(0x80);
        out.put_slice(&[0, 0, 34]);

        out.put_u16(BLOCK_SIZE as u16);
        out.put_u16(BLOCK_SIZE as u16);
        // min/max frame size unknown
        out.put_slice(&[0; 6]);

        let packed: u64 = (u64::from(self.sample_rate) << 44)
            | (u64::from(self.channels - 1) << 41)
            | (u64::from(BITS_PER_SAMPLE - 1) << 36);
        out.put_u64(packed);
        // MD5 unknown
        out.put_slice(&[0; 16]);
        out.freeze()
    }

    fn encode_frame(&mut self, pcm: &[u8]) -> Bytes {
        let channels = self.channels as usize;
        let samples = pcm_to_i16(pcm);
        let block = samples.len() / channels;

        let mut frame = Vec::with_capacity(16 + pcm.len() + channels + 2);
        frame.push(0xFF);
        // sync tail, reserved bit, fixed blocking strategy
        frame.push(0xF8);
        // block size as 16-bit (n-1) after the frame number
        frame.push((0b0111 << 4) | sample_rate_code(self.sample_rate));
        // independent channels, 16 bits per sample
        frame.push((((channels - 1) as u8) << 4) | (0b100 << 1));
        write_utf8_number(self.frame_number, &mut frame);
        frame.extend_from_slice(&((block - 1) as u16).to_be_bytes());
        let header_crc = crc8(&frame);
        frame.push(header_crc);

        for ch in 0..channels {
            // zero pad bit, VERBATIM subframe type, no wasted bits
            frame.push(0b0000_0010);
            for i in 0..block {
                frame.extend_from_slice(&samples[i * channels + ch].to_be_bytes());
            }
        }

        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        self.frame_number += 1;
        Bytes::from(frame)
    }
}

impl PacketEncoder for FlacEncoder {
    fn push_pcm(&mut self, pcm: &[u8]) -> Result<(), CodecError> {
        self.acc.push(pcm);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<Bytes>, CodecError> {
        Ok(self.acc.take_frame().map(|pcm| self.encode_frame(&pcm)))
    }

    fn finish(&mut self) -> Result<Vec<Bytes>, CodecError> {
        let mut packets = Vec::new();
        while let Some(pcm) = self.acc.take_frame() {
            packets.push(self.encode_frame(&pcm));
        }
        let rest = self.acc.take_rest();
        if !rest.is_empty() {
            packets.push(self.encode_frame(&rest));
        }
        Ok(packets)
    }
}

/// Frame header sample rate code; 0 defers to STREAMINFO
fn sample_rate_code(rate: u32) -> u8 {
    match rate {
        88_200 => 0b0001,
        176_400 => 0b0010,
        192_000 => 0b0011,
        8_000 => 0b0100,
        16_000 => 0b0101,
        22_050 => 0b0110,
        24_000 => 0b0111,
        32_000 => 0b1000,
        44_100 => 0b1001,
        48_000 => 0b1010,
        96_000 => 0b1011,
        _ => 0b0000,
    }
}

/// FLAC's UTF-8-like variable length frame number coding
fn write_utf8_number(n: u64, out: &mut Vec<u8>) {
    if n < 0x80 {
        out.push(n as u8);
        return;
    }

    let (len, lead): (u32, u8) = if n < 0x800 {
        (2, 0xC0)
    } else if n < 0x1_0000 {
        (3, 0xE0)
    } else if n < 0x20_0000 {
        (4, 0xF0)
    } else if n < 0x400_0000 {
        (5, 0xF8)
    } else if n < 0x8000_0000 {
        (6, 0xFC)
    } else {
        (7, 0xFE)
    };

    let shift = 6 * (len - 1);
    out.push(lead | (n >> shift) as u8);
    for i in (0..len - 1).rev() {
        out.push(0x80 | ((n >> (6 * i)) & 0x3F) as u8);
    }
}

/// CRC-8, polynomial x^8 + x^2 + x + 1
fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |mut crc, &b| {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x07 } else { crc << 1 };
        }
        crc
    })
}

/// CRC-16, polynomial x^16 + x^15 + x^2 + 1
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |mut crc, &b| {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x8005 } else { crc << 1 };
        }
        crc
    })
}

/// Minimal reader for the frames this encoder writes
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Parse a header followed by verbatim frames back to interleaved samples
    pub(crate) fn decode(stream: &[u8]) -> Vec<i16> {
        assert_eq!(&stream[..4], b"fLaC", "missing stream marker");
        let channels = (((stream[8 + 12] >> 1) & 0x07) + 1) as usize;
        let mut pos = 4 + 4 + 34;
        let mut samples = Vec::new();

        while pos < stream.len() {
            let frame = &stream[pos..];
            assert_eq!(&frame[..2], &[0xFF, 0xF8], "lost frame sync");

            let mut cursor = 4;
            let lead = frame[cursor];
            let extra = if lead < 0x80 { 0 } else { lead.leading_ones() as usize - 1 };
            cursor += 1 + extra;
            let block = u16::from_be_bytes([frame[cursor], frame[cursor + 1]]) as usize + 1;
            cursor += 2;
            assert_eq!(crc8(&frame[..cursor]), frame[cursor], "header crc");
            cursor += 1;

            let mut planes = Vec::with_capacity(channels);
            for _ in 0..channels {
                assert_eq!(frame[cursor], 0b0000_0010, "expected verbatim subframe");
                cursor += 1;
                let plane: Vec<i16> = frame[cursor..cursor + block * 2]
                    .chunks_exact(2)
                    .map(|b| i16::from_be_bytes([b[0], b[1]]))
                    .collect();
                cursor += block * 2;
                planes.push(plane);
            }

            let crc = u16::from_be_bytes([frame[cursor], frame[cursor + 1]]);
            assert_eq!(crc16(&frame[..cursor]), crc, "frame crc");
            cursor += 2;

            for i in 0..block {
                for plane in &planes {
                    samples.push(plane[i]);
                }
            }
            pos += cursor;
        }
        samples
    }
}
