use anyhow::Result;
use crossterm::event::KeyCode;
use log::debug;
use std::sync::Arc;
use tokio::sync::watch;

use crate::{
    config::PlayerConfig,
    device::AudioDevice,
    player::{PlayerState, WebRadioPlayer},
    stations::StationDescriptor,
    stream::Transport,
    ui::UIState as UIApp,
};

pub struct AppController {
    pub ui_app: UIApp,
    config: PlayerConfig,
    transport: Arc<dyn Transport>,
    device: Arc<dyn AudioDevice>,
    state_rx: Option<watch::Receiver<PlayerState>>,
}

impl AppController {
    pub fn new(
        stations: Vec<StationDescriptor>,
        config: PlayerConfig,
        transport: Arc<dyn Transport>,
        device: Arc<dyn AudioDevice>,
    ) -> Self {
        Self {
            ui_app: UIApp::new(stations),
            config,
            transport,
            device,
            state_rx: None,
        }
    }

    /// Returns `Ok(true)` when the user asked to quit.
    pub fn handle_key_event(&mut self, key_code: KeyCode) -> Result<bool> {
        match key_code {
            KeyCode::Char('q') | KeyCode::Esc | KeyCode::Char('Q') => {
                self.ui_app.quit();
                self.state_rx = None;
                return Ok(true);
            }
            KeyCode::Up => self.ui_app.previous_station(),
            KeyCode::Down => self.ui_app.next_station(),
            KeyCode::Enter => self.play_current_station(),
            KeyCode::Char(' ') => self.toggle_playback(),
            KeyCode::Char('s') | KeyCode::Char('S') => self.set_station(None),
            KeyCode::Char(c) if c.is_ascii_digit() => self.select_station_by_number(c),
            _ => {}
        }
        Ok(false)
    }

    /// Replace the current player. The old session is shut down when its
    /// handle is dropped.
    pub fn set_station(&mut self, station: Option<StationDescriptor>) {
        self.ui_app.player = None;
        self.state_rx = None;

        let Some(station) = station else {
            self.ui_app.status_message = "Stopped".to_string();
            return;
        };
        debug!("Switching to {}", station.name);
        let player = WebRadioPlayer::new(
            station,
            self.config.clone(),
            self.transport.clone(),
            self.device.clone(),
        );
        self.state_rx = Some(player.subscribe());
        self.ui_app.player = Some(player);
    }

    fn play_current_station(&mut self) {
        let Some(selected) = self.ui_app.current_station().cloned() else {
            return;
        };

        // already tuned to this station: behave like the play/pause control
        let same_station = self
            .ui_app
            .playing_station()
            .is_some_and(|s| s.stream_url == selected.stream_url);
        if same_station && self.ui_app.player_state() != Some(PlayerState::Error) {
            self.toggle_playback();
            return;
        }

        self.set_station(Some(selected));
        if let Some(player) = &self.ui_app.player {
            player.start();
        }
    }

    fn toggle_playback(&mut self) {
        let Some(player) = &self.ui_app.player else {
            return;
        };
        let state = player.state();
        if !state.control_enabled() {
            return;
        }
        match state {
            PlayerState::Initialized => player.start(),
            PlayerState::Playing => player.pause(),
            PlayerState::Paused => player.resume(),
            PlayerState::Starting | PlayerState::Error => {}
        }
    }

    fn select_station_by_number(&mut self, digit: char) {
        if let Some(index) = digit.to_digit(10).map(|d| d as usize) {
            if index > 0 && index <= self.ui_app.stations.len() {
                self.ui_app.select_station(index - 1);
            }
        }
    }

    /// Pick up state notifications from the player since the last frame.
    pub fn poll_player_state(&mut self) {
        let Some(rx) = self.state_rx.as_mut() else {
            return;
        };
        if !rx.has_changed().unwrap_or(false) {
            return;
        }
        let state = *rx.borrow_and_update();
        let name = self
            .ui_app
            .playing_station()
            .map(|s| s.name.clone())
            .unwrap_or_default();
        self.ui_app.status_message = match state {
            PlayerState::Initialized => String::new(),
            PlayerState::Starting => format!("Buffering {}…", name),
            PlayerState::Playing => format!("♪ {}", name),
            PlayerState::Paused => format!("{} paused", name),
            PlayerState::Error => format!("Could not play {}, see the log for details", name),
        };
    }

    pub fn should_quit(&self) -> bool {
        self.ui_app.should_quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mp3_stream, FakeDevice, FakeTransport};
    use bytes::Bytes;
    use reqwest::Url;
    use tokio::time::{timeout, Duration};

    fn stations() -> Vec<StationDescriptor> {
        vec![
            StationDescriptor::new("One", Url::parse("http://one.example/live").unwrap()),
            StationDescriptor::new("Two", Url::parse("http://two.example/live").unwrap()),
        ]
    }

    #[tokio::test]
    async fn test_enter_tunes_in_and_space_toggles() {
        let (transport, body) = FakeTransport::new(200, Some("audio/mpeg"));
        let config = PlayerConfig {
            buffer_threshold: 1,
            ..PlayerConfig::default()
        };
        let mut app = AppController::new(stations(), config, transport, Arc::new(FakeDevice::default()));

        app.handle_key_event(KeyCode::Char('2')).unwrap();
        app.handle_key_event(KeyCode::Enter).unwrap();
        assert_eq!(app.ui_app.playing_station().unwrap().name, "Two");

        body.send(Ok(Bytes::from(mp3_stream(4, 0)))).unwrap();
        let mut states = app.ui_app.player.as_ref().unwrap().subscribe();
        timeout(Duration::from_secs(2), states.wait_for(|s| *s == PlayerState::Playing))
            .await
            .expect("never started playing")
            .unwrap();

        app.poll_player_state();
        assert_eq!(app.ui_app.status_message, "♪ Two");

        app.handle_key_event(KeyCode::Char(' ')).unwrap();
        timeout(Duration::from_secs(2), states.wait_for(|s| *s == PlayerState::Paused))
            .await
            .expect("never paused")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_and_quit_drop_the_player() {
        let (transport, _body) = FakeTransport::new(200, Some("audio/mpeg"));
        let mut app = AppController::new(
            stations(),
            PlayerConfig::default(),
            transport,
            Arc::new(FakeDevice::default()),
        );
        app.handle_key_event(KeyCode::Enter).unwrap();
        assert!(app.ui_app.player.is_some());

        app.handle_key_event(KeyCode::Char('s')).unwrap();
        assert!(app.ui_app.player.is_none());
        assert_eq!(app.ui_app.status_message, "Stopped");

        // toggling without a player does nothing
        app.handle_key_event(KeyCode::Char(' ')).unwrap();
        assert!(app.handle_key_event(KeyCode::Char('q')).unwrap());
        assert!(app.should_quit());
    }
}
