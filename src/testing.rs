//! Fixtures shared by the unit tests: synthetic frames and fake I/O.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use reqwest::Url;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::demux::{mp3, AudioFormatDescription, Codec, EncodedPacket, PacketDescription};
use crate::device::{AudioDevice, DeviceNotifier, OutputChannel};
use crate::error::{PlayerError, Result};
use crate::events::BufferToken;
use crate::stream::{HttpResponse, Transport};

/// MPEG-1 Layer III, 44.1 kHz stereo, with the payload filled with `fill`.
pub fn mp3_frame(bitrate_index: u8, padding: bool, fill: u8) -> Vec<u8> {
    let header = [0xFF, 0xFB, (bitrate_index << 4) | ((padding as u8) << 1), 0x00];
    let len = mp3::FrameHeader::parse(&header)
        .expect("valid mp3 header")
        .frame_len;
    let mut frame = header.to_vec();
    frame.resize(len, fill);
    frame
}

/// `count` 128 kbps frames of 417 bytes each.
pub fn mp3_stream(count: usize, fill: u8) -> Vec<u8> {
    (0..count).flat_map(|_| mp3_frame(9, false, fill)).collect()
}

/// AAC LC, 44.1 kHz stereo, no CRC.
pub fn adts_frame(payload_len: usize, fill: u8) -> Vec<u8> {
    let len = payload_len + 7;
    let profile = 1u8;
    let rate_index = 4u8;
    let channels = 2u8;
    let mut frame = vec![
        0xFF,
        0xF1,
        (profile << 6) | (rate_index << 2) | (channels >> 2),
        ((channels & 0x03) << 6) | ((len >> 11) & 0x03) as u8,
        ((len >> 3) & 0xFF) as u8,
        (((len & 0x07) << 5) as u8) | 0x1F,
        0xFC,
    ];
    frame.resize(len, fill);
    frame
}

pub fn adts_stream(count: usize, fill: u8) -> Vec<u8> {
    (0..count).flat_map(|_| adts_frame(200, fill)).collect()
}

/// An ID3v2.3 tag with a zeroed body of `body_len` bytes.
pub fn id3_tag(body_len: usize) -> Vec<u8> {
    let mut tag = b"ID3".to_vec();
    tag.extend([3, 0, 0]);
    tag.extend([
        ((body_len >> 21) & 0x7F) as u8,
        ((body_len >> 14) & 0x7F) as u8,
        ((body_len >> 7) & 0x7F) as u8,
        (body_len & 0x7F) as u8,
    ]);
    tag.resize(10 + body_len, 0);
    tag
}

pub fn mp3_format() -> AudioFormatDescription {
    AudioFormatDescription {
        codec: Codec::Mp3,
        sample_rate: 44100,
        channels: 2,
        frames_per_packet: 1152,
        magic_cookie: None,
    }
}

pub fn packet(len: usize) -> EncodedPacket {
    EncodedPacket {
        data: Bytes::from(vec![0u8; len]),
        frames: 1152,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    Create(AudioFormatDescription),
    Submit {
        token: BufferToken,
        len: usize,
        packets: Vec<PacketDescription>,
    },
    Start,
    Stop,
}

/// Records every call; clones share the record.
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    fail_create: bool,
    fail_submit: bool,
    fail_start: bool,
    calls: Arc<Mutex<Vec<DeviceCall>>>,
}

impl FakeDevice {
    pub fn failing_create() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    pub fn failing_submit() -> Self {
        Self {
            fail_submit: true,
            ..Self::default()
        }
    }

    pub fn failing_start() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn submitted_tokens(&self) -> Vec<BufferToken> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                DeviceCall::Submit { token, .. } => Some(*token),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: DeviceCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl AudioDevice for FakeDevice {
    fn create_channel(
        &self,
        format: &AudioFormatDescription,
        _notifier: DeviceNotifier,
    ) -> Result<Box<dyn OutputChannel>> {
        if self.fail_create {
            return Err(PlayerError::DeviceFailure("no output device".into()));
        }
        self.record(DeviceCall::Create(format.clone()));
        Ok(Box::new(FakeChannel {
            device: self.clone(),
        }))
    }
}

struct FakeChannel {
    device: FakeDevice,
}

impl OutputChannel for FakeChannel {
    fn submit(&mut self, token: BufferToken, data: &[u8], packets: &[PacketDescription]) -> Result<()> {
        if self.device.fail_submit {
            return Err(PlayerError::DeviceFailure("submit rejected".into()));
        }
        self.device.record(DeviceCall::Submit {
            token,
            len: data.len(),
            packets: packets.to_vec(),
        });
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.device.fail_start {
            return Err(PlayerError::DeviceFailure("start rejected".into()));
        }
        self.device.record(DeviceCall::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.device.record(DeviceCall::Stop);
        Ok(())
    }
}

pub type BodySender = mpsc::UnboundedSender<Result<Bytes>>;

/// Serves one canned response whose body the test feeds by hand.
pub struct FakeTransport {
    status: u16,
    content_type: Option<String>,
    refuse: Option<String>,
    body: Mutex<Option<mpsc::UnboundedReceiver<Result<Bytes>>>>,
    pub connections: AtomicUsize,
}

impl FakeTransport {
    pub fn new(status: u16, content_type: Option<&str>) -> (Arc<Self>, BodySender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            status,
            content_type: content_type.map(str::to_string),
            refuse: None,
            body: Mutex::new(Some(rx)),
            connections: AtomicUsize::new(0),
        };
        (Arc::new(transport), tx)
    }

    pub fn refusing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            status: 0,
            content_type: None,
            refuse: Some(reason.to_string()),
            body: Mutex::new(None),
            connections: AtomicUsize::new(0),
        })
    }
}

impl Transport for FakeTransport {
    fn get(&self, _url: &Url) -> BoxFuture<'static, Result<HttpResponse>> {
        self.connections.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.refuse {
            let err = PlayerError::ConnectionFailure(reason.clone());
            return async move { Err(err) }.boxed();
        }

        // later connections get an empty body
        let body = match self.body.lock().unwrap().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        };
        let response = HttpResponse {
            status: self.status,
            content_type: self.content_type.clone(),
            body,
        };
        async move { Ok(response) }.boxed()
    }
}
