//! ADTS (Audio Data Transport Stream) headers wrapping raw AAC frames.

pub const HEADER_LEN: usize = 7;
const CRC_LEN: usize = 2;

/// Frames carry exactly one raw data block; headers announcing more are
/// rejected since the blocks cannot be split without parsing the AAC.
pub const SAMPLES_PER_BLOCK: u32 = 1024;

const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// MPEG-4 audio object type minus one (1 = AAC LC).
    pub profile: u8,
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
    pub crc_present: bool,
    /// Whole frame including the header.
    pub frame_len: usize,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        // 12 sync bits, then ID, then a layer field that is always 00
        if bytes[0] != 0xFF || bytes[1] & 0xF6 != 0xF0 {
            return None;
        }

        let crc_present = bytes[1] & 0x01 == 0;
        let profile = bytes[2] >> 6;
        let sample_rate_index = (bytes[2] >> 2) & 0x0F;
        let sample_rate = *SAMPLE_RATES.get(sample_rate_index as usize)?;

        // configuration 0 means the layout lives in an in-band PCE, which we
        // cannot hand to the decoder
        let channel_config = ((bytes[2] & 0x01) << 2) | (bytes[3] >> 6);
        if channel_config == 0 {
            return None;
        }

        if bytes[6] & 0x03 != 0 {
            return None;
        }

        let frame_len = (((bytes[3] & 0x03) as usize) << 11)
            | ((bytes[4] as usize) << 3)
            | ((bytes[5] as usize) >> 5);

        let header = Self {
            profile,
            sample_rate_index,
            sample_rate,
            channel_config,
            crc_present,
            frame_len,
        };
        if frame_len <= header.header_len() {
            return None;
        }
        Some(header)
    }

    pub fn header_len(&self) -> usize {
        if self.crc_present {
            HEADER_LEN + CRC_LEN
        } else {
            HEADER_LEN
        }
    }

    pub fn channels(&self) -> u16 {
        match self.channel_config {
            7 => 8,
            n => n as u16,
        }
    }

    pub fn samples_per_frame(&self) -> u32 {
        SAMPLES_PER_BLOCK
    }

    /// The two-byte AudioSpecificConfig a decoder needs in place of the
    /// per-frame ADTS header.
    pub fn audio_specific_config(&self) -> [u8; 2] {
        let object_type = self.profile + 1;
        [
            (object_type << 3) | (self.sample_rate_index >> 1),
            ((self.sample_rate_index & 0x01) << 7) | (self.channel_config << 3),
        ]
    }

    pub fn same_stream(&self, other: &Self) -> bool {
        self.profile == other.profile
            && self.sample_rate_index == other.sample_rate_index
            && self.channel_config == other.channel_config
    }
}
