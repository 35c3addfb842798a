//! Sound output through rodio, with symphonia doing the decoding.
//!
//! Each channel owns one rodio [`Sink`] and a blocking decode worker. A
//! submitted buffer is copied into a job; the worker decodes its packets,
//! appends the PCM to the sink and then appends an empty callback source
//! that hands the buffer token back once everything before it has played.
//! Starting and clearing the sink also run on the worker, in order with the
//! jobs.

use log::{debug, warn};
use rodio::buffer::SamplesBuffer;
use rodio::source::EmptyCallback;
use rodio::{OutputStreamHandle, Sink};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use symphonia::core::audio::{Channels, SampleBuffer};
use symphonia::core::codecs::{
    CodecParameters, CodecType, Decoder, DecoderOptions, CODEC_TYPE_AAC, CODEC_TYPE_MP3,
};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;
use symphonia::default::get_codecs;
use tokio::sync::mpsc;

use crate::demux::{AudioFormatDescription, Codec, PacketDescription};
use crate::device::{AudioDevice, DeviceNotifier, OutputChannel};
use crate::error::{PlayerError, Result};
use crate::events::BufferToken;

const MAX_CONSECUTIVE_ERRORS: u32 = 15;

pub struct RodioDevice {
    handle: OutputStreamHandle,
}

impl RodioDevice {
    /// `handle` must come from an `OutputStream` that outlives the device.
    pub fn new(handle: OutputStreamHandle) -> Self {
        Self { handle }
    }
}

impl AudioDevice for RodioDevice {
    fn create_channel(
        &self,
        format: &AudioFormatDescription,
        notifier: DeviceNotifier,
    ) -> Result<Box<dyn OutputChannel>> {
        let decoder = make_decoder(format)?;
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| PlayerError::DeviceFailure(format!("failed to open audio sink: {}", e)))?;
        // nothing plays until the queue says it has buffered enough
        sink.pause();
        Ok(Box::new(RodioChannel::spawn(sink, decoder, notifier)))
    }
}

struct DecodeJob {
    token: BufferToken,
    data: Vec<u8>,
    packets: Vec<PacketDescription>,
    generation: u64,
}

/// Work for the decode worker. Everything that can block on the audio
/// thread goes through here so the session task never waits on rodio.
enum WorkerMsg {
    Decode(DecodeJob),
    Play { generation: u64 },
    Clear { generation: u64 },
}

impl WorkerMsg {
    fn generation(&self) -> u64 {
        match self {
            WorkerMsg::Decode(job) => job.generation,
            WorkerMsg::Play { generation } | WorkerMsg::Clear { generation } => *generation,
        }
    }
}

struct RodioChannel {
    sink: Arc<Sink>,
    /// Bumped by `stop`; messages from an older generation are discarded.
    generation: Arc<AtomicU64>,
    jobs: mpsc::UnboundedSender<WorkerMsg>,
}

impl RodioChannel {
    fn spawn(sink: Sink, decoder: Box<dyn Decoder>, notifier: DeviceNotifier) -> Self {
        let sink = Arc::new(sink);
        let generation = Arc::new(AtomicU64::new(0));
        let (jobs, rx) = mpsc::unbounded_channel();

        let worker = DecodeWorker::new(decoder, sink.clone(), generation.clone(), notifier);
        tokio::task::spawn_blocking(move || worker.run(rx));

        Self {
            sink,
            generation,
            jobs,
        }
    }

    fn send(&self, msg: WorkerMsg) -> Result<()> {
        self.jobs
            .send(msg)
            .map_err(|_| PlayerError::DeviceFailure("decode worker has stopped".into()))
    }
}

impl OutputChannel for RodioChannel {
    fn submit(&mut self, token: BufferToken, data: &[u8], packets: &[PacketDescription]) -> Result<()> {
        self.send(WorkerMsg::Decode(DecodeJob {
            token,
            data: data.to_vec(),
            packets: packets.to_vec(),
            generation: self.generation.load(Ordering::SeqCst),
        }))
    }

    fn start(&mut self) -> Result<()> {
        // queued behind the jobs already submitted, so playback begins
        // once they are on the sink
        self.send(WorkerMsg::Play {
            generation: self.generation.load(Ordering::SeqCst),
        })
    }

    fn stop(&mut self) -> Result<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // pause() only flips a flag; the audio thread sees it within 5 ms
        self.sink.pause();
        self.send(WorkerMsg::Clear { generation })?;
        debug!("Output stopped, queued audio will be discarded");
        Ok(())
    }
}

impl Drop for RodioChannel {
    fn drop(&mut self) {
        // strand whatever the worker has not got to yet
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.sink.stop();
    }
}

struct DecodeWorker {
    decoder: Box<dyn Decoder>,
    sink: Arc<Sink>,
    generation: Arc<AtomicU64>,
    notifier: DeviceNotifier,
    timestamp: u64,
    consecutive_errors: u32,
    last_generation: u64,
}

impl DecodeWorker {
    fn new(
        decoder: Box<dyn Decoder>,
        sink: Arc<Sink>,
        generation: Arc<AtomicU64>,
        notifier: DeviceNotifier,
    ) -> Self {
        Self {
            decoder,
            sink,
            generation,
            notifier,
            timestamp: 0,
            consecutive_errors: 0,
            last_generation: 0,
        }
    }

    fn run(mut self, mut jobs: mpsc::UnboundedReceiver<WorkerMsg>) {
        while let Some(msg) = jobs.blocking_recv() {
            if !self.is_current(msg.generation()) {
                continue;
            }
            match msg {
                WorkerMsg::Decode(job) => {
                    if let Err(err) = self.play_job(job) {
                        self.notifier.failed(err);
                        return;
                    }
                }
                WorkerMsg::Play { .. } => self.sink.play(),
                WorkerMsg::Clear { .. } => {
                    // blocks until the audio thread has skipped every queued
                    // source, then leaves the sink paused
                    self.sink.clear();
                    debug!("Queued audio discarded");
                }
            }
        }
        debug!("Decode worker finished");
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn play_job(&mut self, job: DecodeJob) -> Result<()> {
        if job.generation != self.last_generation {
            // the stream was interrupted; don't let the decoder carry
            // state across the gap
            self.decoder.reset();
            self.last_generation = job.generation;
        }

        let mut decoded = Vec::with_capacity(job.packets.len());
        for desc in &job.packets {
            let Some(bytes) = job.data.get(desc.offset..desc.offset + desc.size) else {
                warn!("Packet description outside its buffer, skipping");
                continue;
            };
            if let Some(buffer) = self.decode(bytes, desc.frames)? {
                decoded.push(buffer);
            }
        }

        // a stop may have landed while we were decoding
        if !self.is_current(job.generation) {
            return Ok(());
        }
        for buffer in decoded {
            self.sink.append(buffer);
        }
        let notifier = self.notifier.clone();
        let token = job.token;
        self.sink.append(EmptyCallback::<f32>::new(Box::new(move || {
            notifier.buffer_consumed(token)
        })));
        Ok(())
    }

    /// `Ok(None)` for a packet that was skipped after a recoverable error.
    fn decode(&mut self, bytes: &[u8], frames: u32) -> Result<Option<SamplesBuffer<f32>>> {
        let packet = Packet::new_from_slice(0, self.timestamp, frames as u64, bytes);
        self.timestamp += frames as u64;

        match self.decoder.decode(&packet) {
            Ok(audio) => {
                self.consecutive_errors = 0;
                let spec = *audio.spec();
                if audio.frames() == 0 {
                    return Ok(None);
                }
                let mut samples = SampleBuffer::<f32>::new(audio.capacity() as u64, spec);
                samples.copy_interleaved_ref(audio);
                Ok(Some(SamplesBuffer::new(
                    spec.channels.count() as u16,
                    spec.rate,
                    samples.samples().to_vec(),
                )))
            }
            Err(SymphoniaError::DecodeError(reason)) => {
                self.consecutive_errors += 1;
                warn!(
                    "Decode error ({}/{}): {}",
                    self.consecutive_errors, MAX_CONSECUTIVE_ERRORS, reason
                );
                if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    return Err(PlayerError::DeviceFailure(format!(
                        "too many consecutive decode errors, last: {}",
                        reason
                    )));
                }
                Ok(None)
            }
            Err(SymphoniaError::ResetRequired) => {
                debug!("Decoder requested a reset");
                self.decoder.reset();
                Ok(None)
            }
            Err(err) => Err(PlayerError::DeviceFailure(format!("decoder failed: {}", err))),
        }
    }
}

fn codec_type(codec: Codec) -> CodecType {
    match codec {
        Codec::Mp3 => CODEC_TYPE_MP3,
        Codec::Aac => CODEC_TYPE_AAC,
    }
}

fn channel_layout(channels: u16) -> Channels {
    match channels {
        1 => Channels::FRONT_LEFT,
        2 => Channels::FRONT_LEFT | Channels::FRONT_RIGHT,
        n => Channels::from_bits_truncate((1u32 << n.min(31)) - 1),
    }
}

fn make_decoder(format: &AudioFormatDescription) -> Result<Box<dyn Decoder>> {
    let mut params = CodecParameters::new();
    params
        .for_codec(codec_type(format.codec))
        .with_sample_rate(format.sample_rate)
        .with_channels(channel_layout(format.channels))
        .with_max_frames_per_packet(format.frames_per_packet as u64);
    if let Some(cookie) = &format.magic_cookie {
        params.with_extra_data(cookie.clone().into_boxed_slice());
    }

    get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| PlayerError::DeviceFailure(format!("no decoder for {:?}: {}", format.codec, e)))
}
