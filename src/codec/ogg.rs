//! Ogg page writer, one packet per page

use bytes::{BufMut, Bytes, BytesMut};

pub const FLAG_BOS: u8 = 0x02;
pub const FLAG_EOS: u8 = 0x04;

/// Largest packet that fits in one page's segment table
pub const MAX_PACKET: usize = 255 * 255 - 1;

static CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            r = if r & 0x8000_0000 != 0 { (r << 1) ^ 0x04C1_1DB7 } else { r << 1 };
            j += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// Ogg checksum: CRC-32 poly 0x04C11DB7, zero init, no reflection
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// One logical Ogg bitstream
pub struct OggStream {
    serial: u32,
    sequence: u32,
}

impl OggStream {
    pub fn new(serial: u32) -> Self {
        Self { serial, sequence: 0 }
    }

    /// Wrap `packet` in a complete page
    pub fn page(&mut self, packet: &[u8], granule: u64, flags: u8) -> Bytes {
        debug_assert!(packet.len() <= MAX_PACKET, "packet too large for a single page");

        let mut lacing = vec![255u8; packet.len() / 255];
        lacing.push((packet.len() % 255) as u8);

        let mut page = BytesMut::with_capacity(27 + lacing.len() + packet.len());
        page.put_slice(b"OggS");
        page.put_u8(0);
        page.put_u8(flags);
        page.put_u64_le(granule);
        page.put_u32_le(self.serial);
        page.put_u32_le(self.sequence);
        // checksum placeholder
        page.put_u32_le(0);
        page.put_u8(lacing.len() as u8);
        page.put_slice(&lacing);
        page.put_slice(packet);

        let crc = crc32(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());

        self.sequence = self.sequence.wrapping_add(1);
        page.freeze()
    }
}
