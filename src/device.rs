//! The seam between the playback queue and whatever makes sound.

use log::debug;

use crate::demux::{AudioFormatDescription, PacketDescription};
use crate::error::{PlayerError, Result};
use crate::events::{BufferToken, DeviceEvent, EventSender, SessionEvent};

pub trait AudioDevice: Send + Sync {
    /// Open an output channel for `format`. The channel reports buffer
    /// returns and asynchronous failures through `notifier`.
    fn create_channel(
        &self,
        format: &AudioFormatDescription,
        notifier: DeviceNotifier,
    ) -> Result<Box<dyn OutputChannel>>;
}

pub trait OutputChannel: Send {
    /// Queue one buffer. The channel must not keep `data` past this call;
    /// `token` comes back through the notifier once the audio has played.
    fn submit(&mut self, token: BufferToken, data: &[u8], packets: &[PacketDescription]) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Stop output and throw away everything queued but not yet played.
    fn stop(&mut self) -> Result<()>;
}

/// Handle a device uses to post back into the session, from any thread.
#[derive(Debug, Clone)]
pub struct DeviceNotifier {
    events: EventSender,
}

impl DeviceNotifier {
    pub fn new(events: EventSender) -> Self {
        Self { events }
    }

    pub fn buffer_consumed(&self, token: BufferToken) {
        self.post(DeviceEvent::BufferConsumed(token));
    }

    pub fn failed(&self, error: PlayerError) {
        self.post(DeviceEvent::Failed(error));
    }

    fn post(&self, event: DeviceEvent) {
        if self.events.send(SessionEvent::Device(event)).is_err() {
            debug!("Session gone, dropping device event");
        }
    }
}
