//! Packets in, device buffers out.
//!
//! The queue owns the output channel and the buffer pool. It counts the
//! packets of the current epoch and starts the device once, when that
//! count first exceeds the buffering threshold.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::demux::{AudioFormatDescription, EncodedPacket};
use crate::device::{AudioDevice, DeviceNotifier, OutputChannel};
use crate::error::{PlayerError, Result};
use crate::events::{BufferToken, Epoch};
use crate::pool::BufferPool;

/// Returned by [`PlaybackQueue::enqueue`] the one time per epoch the device
/// is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackStarted;

pub struct PlaybackQueue {
    device: Arc<dyn AudioDevice>,
    notifier: DeviceNotifier,
    channel: Option<Box<dyn OutputChannel>>,
    pool: BufferPool,
    threshold: u64,
    epoch: Epoch,
    received: u64,
    started: bool,
}

impl PlaybackQueue {
    pub fn new(device: Arc<dyn AudioDevice>, notifier: DeviceNotifier, threshold: u64) -> Self {
        Self {
            device,
            notifier,
            channel: None,
            pool: BufferPool::new(),
            threshold,
            epoch: Epoch::FIRST,
            received: 0,
            started: false,
        }
    }

    /// Create the output channel. Only the first call does anything;
    /// returns whether a channel was created.
    pub fn on_format_discovered(&mut self, format: &AudioFormatDescription) -> Result<bool> {
        if self.channel.is_some() {
            debug!("Output channel already exists, ignoring repeated format");
            return Ok(false);
        }
        let channel = self.device.create_channel(format, self.notifier.clone())?;
        self.channel = Some(channel);
        debug!(
            "Created output channel: {:?} {} Hz x{}",
            format.codec, format.sample_rate, format.channels
        );
        Ok(true)
    }

    pub fn enqueue(&mut self, packets: &[EncodedPacket]) -> Result<Option<PlaybackStarted>> {
        let Some(channel) = self.channel.as_mut() else {
            return Err(PlayerError::DeviceFailure(
                "packets arrived before the output channel was created".into(),
            ));
        };

        for packet in packets {
            let ticket = self.pool.checkout(&packet.data);
            let token = BufferToken {
                ticket,
                epoch: self.epoch,
            };
            let data = self
                .pool
                .submit(ticket)
                .map_err(|e| PlayerError::DeviceFailure(e.to_string()))?;
            if let Err(err) = channel.submit(token, data, &[packet.description()]) {
                // the device never took it, so it is ours to recycle
                let _ = self.pool.release(ticket);
                return Err(err);
            }
            self.received += 1;
        }

        if !self.started && self.received > self.threshold {
            channel.start()?;
            self.started = true;
            info!(
                "Buffered {} packets in epoch {}, starting playback",
                self.received, self.epoch
            );
            return Ok(Some(PlaybackStarted));
        }
        Ok(None)
    }

    /// The device finished with a buffer. Returns whether it went back to
    /// the pool; stale or unknown tokens are ignored.
    pub fn on_buffer_consumed(&mut self, token: BufferToken) -> bool {
        if token.epoch != self.epoch {
            debug!("Dropping buffer return from stale epoch {}", token.epoch);
            return false;
        }
        if !self.pool.is_in_flight(token.ticket) {
            debug!("Ignoring return of buffer {} that is not in flight", token.ticket.slot());
            return false;
        }
        match self.pool.release(token.ticket) {
            Ok(()) => true,
            Err(err) => {
                debug!("Ignoring buffer return: {}", err);
                false
            }
        }
    }

    /// Stop the device, discard queued audio and take every buffer back.
    pub fn pause(&mut self) -> Result<()> {
        self.received = 0;
        self.started = false;
        let stopped = match self.channel.as_mut() {
            Some(channel) => channel.stop(),
            None => Ok(()),
        };
        let reclaimed = self.pool.reclaim_all();
        debug!(
            "Paused output, reclaimed {} buffers ({} of {} free)",
            reclaimed,
            self.pool.free_count(),
            self.pool.capacity()
        );
        stopped
    }

    pub fn begin_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.received = 0;
        self.started = false;
    }

    /// Best-effort teardown when the session ends.
    pub fn shutdown(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.stop() {
                warn!("Failed to stop output channel: {}", err);
            }
        }
        self.pool.reclaim_all();
        self.started = false;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    #[cfg(test)]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[cfg(test)]
    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.pool.in_flight()
    }
}
