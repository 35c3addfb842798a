//! MPEG audio Layer III frame headers.

pub const HEADER_LEN: usize = 4;

const BITRATES_V1: [u32; 16] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0];
const BITRATES_V2: [u32; 16] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0];

const SAMPLE_RATES_V1: [u32; 3] = [44100, 48000, 32000];
const SAMPLE_RATES_V2: [u32; 3] = [22050, 24000, 16000];
const SAMPLE_RATES_V25: [u32; 3] = [11025, 12000, 8000];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: MpegVersion,
    pub bitrate_kbps: u32,
    pub sample_rate: u32,
    pub padding: bool,
    pub channels: u16,
    pub frame_len: usize,
}

impl FrameHeader {
    /// Parse the four header bytes at the start of `bytes`.
    ///
    /// Only Layer III is accepted. Free-format bitrates and reserved
    /// version/sample-rate/emphasis values are rejected so that random
    /// payload bytes rarely look like a header.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }
        if bytes[0] != 0xFF || bytes[1] & 0xE0 != 0xE0 {
            return None;
        }

        let version = match (bytes[1] >> 3) & 0x03 {
            0 => MpegVersion::Mpeg25,
            2 => MpegVersion::Mpeg2,
            3 => MpegVersion::Mpeg1,
            _ => return None,
        };
        // layer bits 01 are Layer III
        if (bytes[1] >> 1) & 0x03 != 0x01 {
            return None;
        }

        let bitrate_index = (bytes[2] >> 4) as usize;
        let bitrate_kbps = match version {
            MpegVersion::Mpeg1 => BITRATES_V1[bitrate_index],
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => BITRATES_V2[bitrate_index],
        };
        if bitrate_kbps == 0 {
            return None;
        }

        let rate_index = ((bytes[2] >> 2) & 0x03) as usize;
        if rate_index == 3 {
            return None;
        }
        let sample_rate = match version {
            MpegVersion::Mpeg1 => SAMPLE_RATES_V1[rate_index],
            MpegVersion::Mpeg2 => SAMPLE_RATES_V2[rate_index],
            MpegVersion::Mpeg25 => SAMPLE_RATES_V25[rate_index],
        };

        if bytes[3] & 0x03 == 0x02 {
            return None;
        }

        let padding = (bytes[2] >> 1) & 0x01 == 1;
        let channels = if bytes[3] >> 6 == 0x03 { 1 } else { 2 };

        let coefficient = match version {
            MpegVersion::Mpeg1 => 144_000,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 72_000,
        };
        let frame_len = (coefficient * bitrate_kbps / sample_rate) as usize + padding as usize;

        Some(Self {
            version,
            bitrate_kbps,
            sample_rate,
            padding,
            channels,
            frame_len,
        })
    }

    pub fn samples_per_frame(&self) -> u32 {
        match self.version {
            MpegVersion::Mpeg1 => 1152,
            MpegVersion::Mpeg2 | MpegVersion::Mpeg25 => 576,
        }
    }

    /// Fields that cannot change between frames of one stream. Bitrate and
    /// padding vary freely (VBR).
    pub fn same_stream(&self, other: &Self) -> bool {
        self.version == other.version
            && self.sample_rate == other.sample_rate
            && self.channels == other.channels
    }
}
