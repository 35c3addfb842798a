//! Incremental MP3 / ADTS-AAC demuxer.
//!
//! Bytes arrive in arbitrary chunks; complete frames come out as
//! [`EncodedPacket`]s. Every decision is made only once enough bytes are
//! buffered to make it, so the packet sequence does not depend on where
//! the network happened to split the stream.

pub mod adts;
pub mod mp3;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info};
use std::ops::Range;

use crate::error::{PlayerError, Result};

/// Longest header any candidate container needs before it can be judged.
const PROBE_LEN: usize = adts::HEADER_LEN;
const ID3_HEADER_LEN: usize = 10;

/// Container guess taken from the HTTP `Content-Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatHint {
    Mp3,
    AdtsAac,
    Unknown,
}

impl FormatHint {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let Some(content_type) = content_type else {
            return FormatHint::Unknown;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "audio/mpeg" => FormatHint::Mp3,
            "application/octet-stream" => FormatHint::AdtsAac,
            _ => FormatHint::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Mp3,
    Aac,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormatDescription {
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub frames_per_packet: u32,
    /// Codec configuration the decoder needs up front (AAC AudioSpecificConfig).
    pub magic_cookie: Option<Vec<u8>>,
}

/// Where one packet sits inside a playback buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDescription {
    pub offset: usize,
    pub size: usize,
    /// Audio frames (samples per channel) the packet decodes to.
    pub frames: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub data: Bytes,
    pub frames: u32,
}

impl EncodedPacket {
    pub fn description(&self) -> PacketDescription {
        PacketDescription {
            offset: 0,
            size: self.data.len(),
            frames: self.frames,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    FormatDiscovered(AudioFormatDescription),
    PacketsReady(Vec<EncodedPacket>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Mp3,
    Adts,
}

impl Container {
    fn name(&self) -> &'static str {
        match self {
            Container::Mp3 => "MP3",
            Container::Adts => "ADTS",
        }
    }

    fn header_len(&self) -> usize {
        match self {
            Container::Mp3 => mp3::HEADER_LEN,
            Container::Adts => adts::HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Mp3(mp3::FrameHeader),
    Adts(adts::FrameHeader),
}

impl Frame {
    fn parse(container: Container, bytes: &[u8]) -> Option<Frame> {
        match container {
            Container::Mp3 => mp3::FrameHeader::parse(bytes).map(Frame::Mp3),
            Container::Adts => adts::FrameHeader::parse(bytes).map(Frame::Adts),
        }
    }

    fn container(&self) -> Container {
        match self {
            Frame::Mp3(_) => Container::Mp3,
            Frame::Adts(_) => Container::Adts,
        }
    }

    fn frame_len(&self) -> usize {
        match self {
            Frame::Mp3(h) => h.frame_len,
            Frame::Adts(h) => h.frame_len,
        }
    }

    /// Bytes of the frame handed to the decoder. ADTS headers are stripped
    /// because the decoder is configured from the magic cookie instead.
    fn payload_range(&self) -> Range<usize> {
        match self {
            Frame::Mp3(h) => 0..h.frame_len,
            Frame::Adts(h) => h.header_len()..h.frame_len,
        }
    }

    fn samples(&self) -> u32 {
        match self {
            Frame::Mp3(h) => h.samples_per_frame(),
            Frame::Adts(h) => h.samples_per_frame(),
        }
    }

    fn same_stream(&self, other: &Frame) -> bool {
        match (self, other) {
            (Frame::Mp3(a), Frame::Mp3(b)) => a.same_stream(b),
            (Frame::Adts(a), Frame::Adts(b)) => a.same_stream(b),
            _ => false,
        }
    }

    fn format(&self) -> AudioFormatDescription {
        match self {
            Frame::Mp3(h) => AudioFormatDescription {
                codec: Codec::Mp3,
                sample_rate: h.sample_rate,
                channels: h.channels,
                frames_per_packet: h.samples_per_frame(),
                magic_cookie: None,
            },
            Frame::Adts(h) => AudioFormatDescription {
                codec: Codec::Aac,
                sample_rate: h.sample_rate,
                channels: h.channels(),
                frames_per_packet: adts::SAMPLES_PER_BLOCK,
                magic_cookie: Some(h.audio_specific_config().to_vec()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Searching,
    Synced,
}

pub struct Demuxer {
    hint: FormatHint,
    candidates: &'static [Container],
    buffer: BytesMut,
    state: SyncState,
    /// Bytes thrown away while searching for sync since the last discontinuity.
    skipped: usize,
    id3_remaining: usize,
    sync_limit: usize,
    /// First confirmed frame; later frames must agree with its fixed fields.
    reference: Option<Frame>,
    format: Option<AudioFormatDescription>,
}

impl Demuxer {
    #[cfg(test)]
    pub fn open(hint: FormatHint) -> Self {
        Self::with_sync_limit(hint, crate::config::DEFAULT_SYNC_SEARCH_LIMIT)
    }

    pub fn with_sync_limit(hint: FormatHint, sync_limit: usize) -> Self {
        let candidates: &'static [Container] = match hint {
            FormatHint::Mp3 => &[Container::Mp3],
            FormatHint::AdtsAac => &[Container::Adts],
            FormatHint::Unknown => &[Container::Mp3, Container::Adts],
        };
        Self {
            hint,
            candidates,
            buffer: BytesMut::new(),
            state: SyncState::Searching,
            skipped: 0,
            id3_remaining: 0,
            sync_limit,
            reference: None,
            format: None,
        }
    }

    #[cfg(test)]
    pub fn format(&self) -> Option<&AudioFormatDescription> {
        self.format.as_ref()
    }

    /// Feed the next chunk of the stream.
    ///
    /// `discontinuous` must be set for the first chunk after open and after
    /// every resume: buffered partial frames are dropped and sync is searched
    /// for again instead of stitching unrelated bytes together.
    pub fn parse(&mut self, bytes: &[u8], discontinuous: bool) -> Result<Vec<DemuxEvent>> {
        if discontinuous {
            self.reset_sync();
        }
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut packets = Vec::new();
        loop {
            let progressed = match self.state {
                SyncState::Searching => self.search(&mut events)?,
                SyncState::Synced => self.next_packet(&mut packets)?,
            };
            if !progressed {
                break;
            }
        }

        if !packets.is_empty() {
            events.push(DemuxEvent::PacketsReady(packets));
        }
        Ok(events)
    }

    /// The stream ended. Fails if it never produced a recognizable frame.
    pub fn finish(&self) -> Result<()> {
        if self.format.is_some() {
            Ok(())
        } else {
            Err(self.sync_error("stream ended before a frame sync was found"))
        }
    }

    fn reset_sync(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Discontinuity: dropping {} buffered bytes", self.buffer.len());
        }
        self.buffer.clear();
        self.state = SyncState::Searching;
        self.skipped = 0;
        self.id3_remaining = 0;
    }

    fn search(&mut self, events: &mut Vec<DemuxEvent>) -> Result<bool> {
        if self.id3_remaining > 0 {
            let n = self.id3_remaining.min(self.buffer.len());
            self.buffer.advance(n);
            self.id3_remaining -= n;
            return Ok(n > 0);
        }

        if self.buffer.len() < 3 {
            return Ok(false);
        }
        if self.buffer.starts_with(b"ID3") {
            if self.buffer.len() < ID3_HEADER_LEN {
                return Ok(false);
            }
            self.id3_remaining = id3_tag_len(&self.buffer[..ID3_HEADER_LEN]);
            debug!("Skipping {} byte ID3v2 tag", self.id3_remaining);
            return Ok(true);
        }

        if self.buffer.len() < PROBE_LEN {
            return Ok(false);
        }
        let candidates = self.candidates;
        for &container in candidates {
            let Some(frame) = Frame::parse(container, &self.buffer) else {
                continue;
            };
            if let Some(reference) = &self.reference {
                if !frame.same_stream(reference) {
                    continue;
                }
            }
            // confirm against the header that should follow this frame
            let next_at = frame.frame_len();
            if self.buffer.len() < next_at + container.header_len() {
                return Ok(false);
            }
            match Frame::parse(container, &self.buffer[next_at..]) {
                Some(next) if next.same_stream(&frame) => {
                    self.acquire_sync(frame, events);
                    return Ok(true);
                }
                _ => continue,
            }
        }

        // nothing here; jump to the next byte that could start a header or a tag
        let skip = self.buffer[1..]
            .iter()
            .position(|&b| b == 0xFF || b == b'I')
            .map(|p| p + 1)
            .unwrap_or(self.buffer.len());
        self.buffer.advance(skip);
        self.skipped += skip;
        if self.skipped > self.sync_limit {
            return Err(self.sync_error(&format!(
                "no frame sync within {} bytes",
                self.sync_limit
            )));
        }
        Ok(true)
    }

    fn acquire_sync(&mut self, frame: Frame, events: &mut Vec<DemuxEvent>) {
        if self.skipped > 0 {
            debug!("Frame sync found after skipping {} bytes", self.skipped);
        }
        self.state = SyncState::Synced;
        self.skipped = 0;

        if self.format.is_none() {
            let format = frame.format();
            info!(
                "Stream format: {} {:?}, {} Hz, {} channel(s)",
                frame.container().name(),
                format.codec,
                format.sample_rate,
                format.channels
            );
            self.reference = Some(frame);
            self.format = Some(format.clone());
            events.push(DemuxEvent::FormatDiscovered(format));
        }
    }

    fn next_packet(&mut self, packets: &mut Vec<EncodedPacket>) -> Result<bool> {
        let Some(reference) = self.reference else {
            return Err(PlayerError::ParseFailure("synced without a reference frame".into()));
        };
        let container = reference.container();
        if self.buffer.len() < container.header_len() {
            return Ok(false);
        }

        let frame = Frame::parse(container, &self.buffer)
            .filter(|frame| frame.same_stream(&reference))
            .ok_or_else(|| {
                PlayerError::ParseFailure(format!("lost {} frame sync", container.name()))
            })?;
        if self.buffer.len() < frame.frame_len() {
            return Ok(false);
        }

        let bytes = self.buffer.split_to(frame.frame_len()).freeze();
        packets.push(EncodedPacket {
            data: bytes.slice(frame.payload_range()),
            frames: frame.samples(),
        });
        Ok(true)
    }

    fn sync_error(&self, detail: &str) -> PlayerError {
        match (self.hint, &self.format) {
            (FormatHint::Unknown, None) => {
                PlayerError::UnsupportedFormat(format!("neither MP3 nor ADTS: {}", detail))
            }
            _ => {
                let names: Vec<&str> = self.candidates.iter().map(|c| c.name()).collect();
                PlayerError::ParseFailure(format!("{}: {}", names.join("/"), detail))
            }
        }
    }
}

/// Total length of an ID3v2 tag from its 10-byte header.
fn id3_tag_len(header: &[u8]) -> usize {
    let size = header[6..10]
        .iter()
        .fold(0usize, |acc, &b| (acc << 7) | (b & 0x7F) as usize);
    let footer = if header[5] & 0x10 != 0 { ID3_HEADER_LEN } else { 0 };
    ID3_HEADER_LEN + size + footer
}
