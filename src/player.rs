//! The playback session and the handle the UI holds on to.
//!
//! A session is one tokio task that owns the stream reader, the demuxer and
//! the playback queue. Commands from the UI, network deliveries and device
//! callbacks all arrive as [`SessionEvent`]s on one channel, so every piece
//! of session state is only ever touched from that task.

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config::PlayerConfig;
use crate::demux::{DemuxEvent, Demuxer, FormatHint};
use crate::device::{AudioDevice, DeviceNotifier};
use crate::error::PlayerError;
use crate::events::{Command, DeviceEvent, Epoch, EventReceiver, EventSender, SessionEvent, StreamEvent};
use crate::queue::PlaybackQueue;
use crate::stations::StationDescriptor;
use crate::stream::{StreamReader, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Initialized,
    Starting,
    Playing,
    Paused,
    Error,
}

impl PlayerState {
    /// Label for the single play/pause control.
    pub fn control_label(&self) -> &'static str {
        match self {
            PlayerState::Initialized | PlayerState::Paused => "Play",
            PlayerState::Starting => "Starting",
            PlayerState::Playing => "Pause",
            PlayerState::Error => "Error",
        }
    }

    pub fn control_enabled(&self) -> bool {
        matches!(
            self,
            PlayerState::Initialized | PlayerState::Paused | PlayerState::Playing
        )
    }
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerState::Initialized => "initialized",
            PlayerState::Starting => "starting",
            PlayerState::Playing => "playing",
            PlayerState::Paused => "paused",
            PlayerState::Error => "error",
        };
        f.write_str(name)
    }
}

struct Session {
    station: StationDescriptor,
    config: PlayerConfig,
    transport: Arc<dyn Transport>,
    events: EventSender,
    state: watch::Sender<PlayerState>,
    reader: Option<StreamReader>,
    demuxer: Option<Demuxer>,
    queue: PlaybackQueue,
    epoch: Epoch,
    /// The next chunk handed to the demuxer does not continue the last one.
    discontinuous: bool,
}

impl Session {
    fn new(
        station: StationDescriptor,
        config: PlayerConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn AudioDevice>,
        events: EventSender,
        state: watch::Sender<PlayerState>,
    ) -> Self {
        let queue = PlaybackQueue::new(
            device,
            DeviceNotifier::new(events.clone()),
            config.buffer_threshold,
        );
        Self {
            station,
            config,
            transport,
            events,
            state,
            reader: None,
            demuxer: None,
            queue,
            epoch: Epoch::FIRST,
            discontinuous: true,
        }
    }

    fn current(&self) -> PlayerState {
        *self.state.borrow()
    }

    /// Returns `false` once the session should end.
    fn handle(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Command(Command::Shutdown) => {
                self.shutdown();
                return false;
            }
            SessionEvent::Command(command) => self.on_command(command),
            SessionEvent::Stream { epoch, event } => self.on_stream(epoch, event),
            SessionEvent::Device(event) => self.on_device(event),
        }
        true
    }

    fn on_command(&mut self, command: Command) {
        let state = self.current();
        match (command, state) {
            (Command::Start, PlayerState::Initialized) => self.start(),
            (Command::Pause, PlayerState::Starting | PlayerState::Playing) => self.pause(),
            (Command::Resume, PlayerState::Paused) => self.resume(),
            _ => debug!("Ignoring {:?} while {}", command, state),
        }
    }

    fn start(&mut self) {
        info!("Starting {} ({})", self.station.name, self.station.stream_url);
        self.reader = Some(StreamReader::open(
            self.transport.clone(),
            self.station.stream_url.clone(),
            self.config.read_chunk_size,
            self.epoch,
            self.events.clone(),
        ));
        self.discontinuous = true;
        self.transition(PlayerState::Starting);
    }

    fn pause(&mut self) {
        debug!(
            "Pausing after {} packets, {} buffers in flight",
            self.queue.received(),
            self.queue.in_flight()
        );
        if let Err(err) = self.queue.pause() {
            self.fail(err);
            return;
        }
        if let Some(reader) = &self.reader {
            reader.suspend();
        }
        self.discontinuous = true;
        self.transition(PlayerState::Paused);
    }

    fn resume(&mut self) {
        self.epoch = self.epoch.next();
        self.queue.begin_epoch(self.epoch);
        if let Some(reader) = &self.reader {
            reader.resume(self.epoch);
        }
        debug!("Resuming in epoch {}", self.epoch);
        self.transition(PlayerState::Starting);
    }

    fn on_stream(&mut self, epoch: Epoch, event: StreamEvent) {
        if self.current() == PlayerState::Error {
            return;
        }
        match event {
            StreamEvent::Opened { status, content_type } => {
                if self.demuxer.is_some() {
                    return;
                }
                let hint = FormatHint::from_content_type(content_type.as_deref());
                info!(
                    "Connected: HTTP {}, content type {:?}, reading as {:?}",
                    status, content_type, hint
                );
                self.demuxer = Some(Demuxer::with_sync_limit(hint, self.config.sync_search_limit));
            }
            StreamEvent::Chunk(bytes) => {
                if epoch != self.epoch {
                    debug!("Dropping {} bytes from stale epoch {}", bytes.len(), epoch);
                    return;
                }
                if !matches!(self.current(), PlayerState::Starting | PlayerState::Playing) {
                    debug!("Dropping {} bytes that arrived while paused", bytes.len());
                    return;
                }
                if let Err(err) = self.on_chunk(&bytes) {
                    self.fail(err);
                }
            }
            StreamEvent::Finished => {
                let err = match self.demuxer.as_ref().map(Demuxer::finish) {
                    Some(Err(err)) => err,
                    _ => PlayerError::ConnectionFailure("server closed the stream".into()),
                };
                self.fail(err);
            }
            StreamEvent::Failed(err) => self.fail(err),
        }
    }

    fn on_chunk(&mut self, bytes: &[u8]) -> crate::error::Result<()> {
        let Some(demuxer) = self.demuxer.as_mut() else {
            debug!("Chunk arrived before the response headers, ignoring");
            return Ok(());
        };
        let discontinuous = std::mem::take(&mut self.discontinuous);

        for event in demuxer.parse(bytes, discontinuous)? {
            match event {
                DemuxEvent::FormatDiscovered(format) => {
                    debug!(
                        "Creating output for {:?} {} Hz, {} channels",
                        format.codec, format.sample_rate, format.channels
                    );
                    self.queue.on_format_discovered(&format)?;
                }
                DemuxEvent::PacketsReady(packets) => {
                    if self.queue.enqueue(&packets)?.is_some() {
                        self.transition(PlayerState::Playing);
                    }
                }
            }
        }
        Ok(())
    }

    fn on_device(&mut self, event: DeviceEvent) {
        if self.current() == PlayerState::Error {
            return;
        }
        match event {
            DeviceEvent::BufferConsumed(token) => {
                self.queue.on_buffer_consumed(token);
            }
            DeviceEvent::Failed(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: PlayerError) {
        let what = if err.is_connection_error() {
            "stream connection lost"
        } else if err.is_format_error() {
            "unreadable stream"
        } else if err.is_device_error() {
            "audio output failed"
        } else {
            "playback failed"
        };
        warn!("{}: {} ({})", self.station.name, what, err);
        if let Some(reader) = self.reader.take() {
            reader.cancel();
        }
        self.queue.shutdown();
        self.transition(PlayerState::Error);
    }

    fn shutdown(&mut self) {
        debug!("Shutting down session for {}", self.station.name);
        if let Some(reader) = self.reader.take() {
            reader.cancel();
        }
        self.queue.shutdown();
    }

    fn transition(&self, next: PlayerState) {
        self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            info!("Player state {} -> {}", state, next);
            *state = next;
            true
        });
    }
}

async fn run_session(mut session: Session, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        if !session.handle(event) {
            break;
        }
    }
    debug!("Session task finished");
}

/// Handle to one station's playback session.
///
/// Must be created inside a tokio runtime. Dropping the handle ends the
/// session, so switching stations means replacing the player.
pub struct WebRadioPlayer {
    station: StationDescriptor,
    commands: EventSender,
    state: watch::Receiver<PlayerState>,
}

impl WebRadioPlayer {
    pub fn new(
        station: StationDescriptor,
        config: PlayerConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn AudioDevice>,
    ) -> Self {
        let (commands, events) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PlayerState::Initialized);
        let session = Session::new(
            station.clone(),
            config,
            transport,
            device,
            commands.clone(),
            state_tx,
        );
        tokio::spawn(run_session(session, events));

        Self {
            station,
            commands,
            state,
        }
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn pause(&self) {
        self.send(Command::Pause);
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    pub fn state(&self) -> PlayerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlayerState> {
        self.state.clone()
    }

    pub fn station(&self) -> &StationDescriptor {
        &self.station
    }

    fn send(&self, command: Command) {
        if self.commands.send(SessionEvent::Command(command)).is_err() {
            debug!("Session already ended, dropping {:?}", command);
        }
    }
}

impl Drop for WebRadioPlayer {
    fn drop(&mut self) {
        self.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BufferToken;
    use crate::testing::{mp3_frame, mp3_stream, BodySender, DeviceCall, FakeDevice, FakeTransport};
    use bytes::Bytes;
    use reqwest::Url;
    use std::sync::atomic::Ordering;
    use tokio::time::{timeout, Duration};

    struct Harness {
        session: Session,
        events: EventReceiver,
        states: watch::Receiver<PlayerState>,
        seen: Vec<PlayerState>,
        device: FakeDevice,
        transport: Arc<FakeTransport>,
        body: BodySender,
    }

    fn kzsu() -> StationDescriptor {
        StationDescriptor::new(
            "KZSU",
            Url::parse("http://171.66.118.51/kzsu-1-128.mp3").unwrap(),
        )
    }

    fn harness(status: u16, content_type: Option<&str>) -> Harness {
        let (transport, body) = FakeTransport::new(status, content_type);
        let device = FakeDevice::default();
        let (tx, events) = mpsc::unbounded_channel();
        let (state_tx, states) = watch::channel(PlayerState::Initialized);
        let session = Session::new(
            kzsu(),
            PlayerConfig::default(),
            transport.clone(),
            Arc::new(device.clone()),
            tx,
            state_tx,
        );
        Harness {
            session,
            events,
            states,
            seen: vec![PlayerState::Initialized],
            device,
            transport,
            body,
        }
    }

    impl Harness {
        fn command(&mut self, command: Command) {
            self.session.handle(SessionEvent::Command(command));
            self.record();
        }

        /// Hand the next queued event to the session.
        async fn pump(&mut self) -> SessionEvent {
            let event = timeout(Duration::from_secs(2), self.events.recv())
                .await
                .expect("timed out waiting for a session event")
                .expect("event channel closed");
            self.session.handle(event.clone());
            self.record();
            event
        }

        /// Pump until the reader has delivered `bytes` worth of chunks.
        async fn feed(&mut self, bytes: Vec<u8>) {
            let len = bytes.len();
            self.body.send(Ok(Bytes::from(bytes))).unwrap();
            let mut delivered = 0;
            while delivered < len {
                if let SessionEvent::Stream {
                    event: StreamEvent::Chunk(chunk),
                    ..
                } = self.pump().await
                {
                    delivered += chunk.len();
                }
            }
        }

        fn record(&mut self) {
            if self.states.has_changed().unwrap_or(false) {
                let state = *self.states.borrow_and_update();
                self.seen.push(state);
            }
        }

        fn state(&self) -> PlayerState {
            self.session.current()
        }
    }

    #[tokio::test]
    async fn test_kzsu_reaches_playing_after_threshold() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Start);
        assert_eq!(h.state(), PlayerState::Starting);
        assert!(matches!(
            h.pump().await,
            SessionEvent::Stream { event: StreamEvent::Opened { status: 200, .. }, .. }
        ));

        // the first frame waits for the second to confirm sync; from then
        // on every frame is a packet as soon as it is complete
        for _ in 0..100 {
            h.feed(mp3_frame(9, false, 0x55)).await;
        }
        assert_eq!(h.session.queue.received(), 100);
        assert_eq!(h.state(), PlayerState::Starting);
        assert_eq!(h.device.count(|c| *c == DeviceCall::Start), 0);

        h.feed(mp3_frame(9, false, 0x55)).await;
        assert_eq!(h.session.queue.received(), 101);
        assert_eq!(h.state(), PlayerState::Playing);
        assert_eq!(h.device.count(|c| *c == DeviceCall::Start), 1);

        let calls = h.device.calls();
        assert!(matches!(calls[0], DeviceCall::Create(_)), "format before packets");
        assert_eq!(
            h.seen,
            vec![PlayerState::Initialized, PlayerState::Starting, PlayerState::Playing]
        );
    }

    #[tokio::test]
    async fn test_http_error_never_builds_a_demuxer() {
        let mut h = harness(404, Some("text/html"));
        h.command(Command::Start);
        h.pump().await;
        assert_eq!(h.state(), PlayerState::Error);
        assert!(h.session.demuxer.is_none());
        assert!(h.device.calls().is_empty());
        assert!(!h.state().control_enabled());
        assert_eq!(h.state().control_label(), "Error");
    }

    #[tokio::test]
    async fn test_octet_stream_carrying_mp3_fails() {
        let mut h = harness(200, Some("application/octet-stream"));
        h.command(Command::Start);
        h.pump().await;
        h.body.send(Ok(Bytes::from(mp3_stream(200, 0)))).unwrap();
        while h.state() != PlayerState::Error {
            h.pump().await;
        }
        assert_eq!(h.device.count(|c| matches!(c, DeviceCall::Submit { .. })), 0);
        assert_eq!(h.device.count(|c| matches!(c, DeviceCall::Create(_))), 0);
    }

    #[tokio::test]
    async fn test_pause_resume_resets_counter_and_resyncs() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Start);
        h.pump().await;
        h.feed(mp3_stream(10, 0)).await;
        assert_eq!(h.session.queue.received(), 10);

        h.command(Command::Pause);
        assert_eq!(h.state(), PlayerState::Paused);
        assert!(h.session.discontinuous);
        assert_eq!(h.session.queue.received(), 0);
        assert_eq!(h.device.count(|c| *c == DeviceCall::Stop), 1);

        h.command(Command::Resume);
        assert_eq!(h.state(), PlayerState::Starting);
        assert_eq!(h.session.epoch, Epoch::FIRST.next());

        // resume lands mid-frame; the demuxer must resync rather than
        // splice the old partial frame onto new bytes
        let mut resumed = vec![0u8; 100];
        resumed.extend(mp3_stream(4, 0));
        h.feed(resumed).await;
        assert!(!h.session.discontinuous);
        assert_eq!(h.session.queue.received(), 4);
        assert_eq!(h.transport.connections.load(Ordering::SeqCst), 1);
        assert_eq!(h.device.count(|c| matches!(c, DeviceCall::Create(_))), 1);
    }

    #[tokio::test]
    async fn test_stale_epoch_events_are_dropped() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Start);
        h.pump().await;
        h.feed(mp3_stream(3, 0)).await;
        let old_token: BufferToken = h.device.submitted_tokens()[0];

        h.command(Command::Pause);
        h.command(Command::Resume);

        h.session.handle(SessionEvent::Stream {
            epoch: Epoch::FIRST,
            event: StreamEvent::Chunk(Bytes::from(mp3_stream(5, 0))),
        });
        assert_eq!(h.session.queue.received(), 0);

        h.session
            .handle(SessionEvent::Device(DeviceEvent::BufferConsumed(old_token)));
        assert_eq!(h.session.queue.in_flight(), 0);
        assert_eq!(h.state(), PlayerState::Starting);
    }

    #[tokio::test]
    async fn test_invalid_commands_are_silent() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Pause);
        h.command(Command::Resume);
        assert_eq!(h.state(), PlayerState::Initialized);
        assert_eq!(h.seen, vec![PlayerState::Initialized]);

        h.command(Command::Start);
        h.command(Command::Start);
        h.command(Command::Resume);
        h.command(Command::Pause);
        h.command(Command::Pause);
        assert_eq!(
            h.seen,
            vec![PlayerState::Initialized, PlayerState::Starting, PlayerState::Paused]
        );
    }

    #[tokio::test]
    async fn test_server_closing_stream_is_an_error() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Start);
        h.pump().await;
        h.feed(mp3_stream(3, 0)).await;
        drop(std::mem::replace(&mut h.body, mpsc::unbounded_channel().0));
        h.pump().await;
        assert_eq!(h.state(), PlayerState::Error);

        // terminal: nothing moves it afterwards
        h.command(Command::Resume);
        h.command(Command::Start);
        h.session.handle(SessionEvent::Device(DeviceEvent::Failed(
            PlayerError::DeviceFailure("late".into()),
        )));
        assert_eq!(h.state(), PlayerState::Error);
    }

    #[tokio::test]
    async fn test_device_failure_ends_session() {
        let mut h = harness(200, Some("audio/mpeg"));
        h.command(Command::Start);
        h.session.handle(SessionEvent::Device(DeviceEvent::Failed(
            PlayerError::DeviceFailure("unplugged".into()),
        )));
        assert_eq!(h.state(), PlayerState::Error);
        assert!(h.session.reader.is_none());
    }

    #[test]
    fn test_control_mapping() {
        assert_eq!(PlayerState::Initialized.control_label(), "Play");
        assert_eq!(PlayerState::Paused.control_label(), "Play");
        assert_eq!(PlayerState::Starting.control_label(), "Starting");
        assert_eq!(PlayerState::Playing.control_label(), "Pause");
        assert!(!PlayerState::Starting.control_enabled());
        assert!(PlayerState::Playing.control_enabled());
    }

    #[tokio::test]
    async fn test_player_handle_end_to_end() {
        let (transport, body) = FakeTransport::new(200, Some("audio/mpeg"));
        let device = FakeDevice::default();
        let config = PlayerConfig {
            buffer_threshold: 2,
            ..PlayerConfig::default()
        };
        let player = WebRadioPlayer::new(kzsu(), config, transport, Arc::new(device.clone()));
        let mut states = player.subscribe();
        assert_eq!(player.state(), PlayerState::Initialized);
        assert_eq!(player.station().name, "KZSU");

        player.start();
        body.send(Ok(Bytes::from(mp3_stream(5, 0)))).unwrap();
        timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == PlayerState::Playing),
        )
        .await
        .expect("never reached playing")
        .unwrap();

        player.pause();
        timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == PlayerState::Paused),
        )
        .await
        .expect("never paused")
        .unwrap();
        assert_eq!(player.state().control_label(), "Play");

        drop(player);
        // the session stops its channel on the way out
        timeout(Duration::from_secs(2), async {
            while device.count(|c| *c == DeviceCall::Stop) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session did not shut down");
    }
}
