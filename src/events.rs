//! Everything that can happen to a playback session, as one enum.
//!
//! The network task, the audio device and the UI all post into the same
//! channel; the session task is the only consumer.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

use crate::error::PlayerError;
use crate::pool::BufferTicket;

/// One continuous receive/play attempt. Resuming starts a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(u64);

impl Epoch {
    pub const FIRST: Epoch = Epoch(1);

    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the output device holds for a submitted buffer and hands back when
/// it is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferToken {
    pub ticket: BufferTicket,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Pause,
    Resume,
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Successful response headers; sent once, before any chunk.
    Opened {
        status: u16,
        content_type: Option<String>,
    },
    Chunk(Bytes),
    Finished,
    Failed(PlayerError),
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    BufferConsumed(BufferToken),
    Failed(PlayerError),
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Command(Command),
    Stream { epoch: Epoch, event: StreamEvent },
    Device(DeviceEvent),
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_advance() {
        let second = Epoch::FIRST.next();
        assert!(second > Epoch::FIRST);
        assert_ne!(second, second.next());
        assert_eq!(Epoch::FIRST.to_string(), "#1");
    }
}
