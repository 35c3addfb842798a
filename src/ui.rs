use crate::{
    player::{PlayerState, WebRadioPlayer},
    stations::StationDescriptor,
};
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph},
    Frame,
};

const HEADER_HEIGHT: u16 = 4;
const FOOTER_HEIGHT: u16 = 3;
const STATUS_HEIGHT: u16 = 3;
const MARGIN: u16 = 1;

const HIGHLIGHT_WIDTH: usize = 3; // " > "
const SEPARATOR_WIDTH: usize = 3; // " │ "
const MIN_STATION_WIDTH: usize = 12;

pub struct UIState {
    pub stations: Vec<StationDescriptor>,
    pub current_station_index: usize,
    pub list_state: ListState,
    pub should_quit: bool,
    /// Player for the chosen station; replaced whenever the station changes.
    pub player: Option<WebRadioPlayer>,
    pub status_message: String,
}

impl UIState {
    pub fn new(stations: Vec<StationDescriptor>) -> Self {
        let mut list_state = ListState::default();
        list_state.select(if stations.is_empty() { None } else { Some(0) });

        Self {
            stations,
            current_station_index: 0,
            list_state,
            should_quit: false,
            player: None,
            status_message: String::new(),
        }
    }

    pub fn current_station(&self) -> Option<&StationDescriptor> {
        self.stations.get(self.current_station_index)
    }

    pub fn select_station(&mut self, index: usize) {
        if index < self.stations.len() {
            self.current_station_index = index;
            self.list_state.select(Some(index));
        }
    }

    pub fn next_station(&mut self) {
        if !self.stations.is_empty() {
            let next = (self.current_station_index + 1) % self.stations.len();
            self.select_station(next);
        }
    }

    pub fn previous_station(&mut self) {
        if !self.stations.is_empty() {
            let prev = if self.current_station_index == 0 {
                self.stations.len() - 1
            } else {
                self.current_station_index - 1
            };
            self.select_station(prev);
        }
    }

    pub fn player_state(&self) -> Option<PlayerState> {
        self.player.as_ref().map(WebRadioPlayer::state)
    }

    pub fn playing_station(&self) -> Option<&StationDescriptor> {
        self.player.as_ref().map(WebRadioPlayer::station)
    }

    pub fn quit(&mut self) {
        // dropping the player shuts its session down
        self.player = None;
        self.should_quit = true;
    }
}

pub fn render_ui(f: &mut Frame, app: &mut UIState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(MARGIN)
        .constraints([
            Constraint::Length(HEADER_HEIGHT),
            Constraint::Min(6),
            Constraint::Length(STATUS_HEIGHT),
            Constraint::Length(FOOTER_HEIGHT),
        ])
        .split(f.area());

    render_header(f, chunks[0], app);
    render_station_list(f, chunks[1], app);
    render_status(f, chunks[2], app);
    render_footer(f, chunks[3]);
}

fn render_header(f: &mut Frame, area: Rect, app: &UIState) {
    let station_line = match app.playing_station() {
        Some(station) => Line::from(vec![
            Span::styled("Station: ", Style::default()),
            Span::styled(
                station.name.as_str(),
                Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            ),
            Span::styled(" • ", Style::default().fg(Color::Gray)),
            Span::styled(station.stream_url.as_str(), Style::default().fg(Color::Cyan)),
        ]),
        None => Line::from(Span::styled(
            "No station selected",
            Style::default().fg(Color::Gray),
        )),
    };

    let content = vec![
        Line::from(vec![
            Span::styled(
                "WEBRADIO",
                Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD),
            ),
            Span::styled(" - live MP3/AAC streams ", Style::default().fg(Color::Cyan)),
        ]),
        station_line,
    ];

    let header = Paragraph::new(Text::from(content)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta))
            .title("Now Playing"),
    );
    f.render_widget(header, area);
}

fn render_station_list(f: &mut Frame, area: Rect, app: &mut UIState) {
    let rows = station_rows(&app.stations, area.width);
    let playing = app.playing_station().map(|s| s.stream_url.clone());

    let items: Vec<ListItem> = app
        .stations
        .iter()
        .zip(rows)
        .map(|(station, row)| {
            let item = ListItem::new(row);
            if playing.as_ref() == Some(&station.stream_url) {
                item.style(Style::default().fg(Color::Green).add_modifier(Modifier::DIM))
            } else {
                item
            }
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Yellow))
                .title(format!("Stations ({} total)", app.stations.len())),
        )
        .highlight_style(
            Style::default()
                .fg(Color::Black)
                .bg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol(" > ");

    f.render_stateful_widget(list, area, &mut app.list_state);
}

fn station_rows(stations: &[StationDescriptor], area_width: u16) -> Vec<String> {
    let available = (area_width as usize)
        .saturating_sub(4)
        .saturating_sub(HIGHLIGHT_WIDTH + SEPARATOR_WIDTH);
    let name_width = (available * 3 / 10).max(MIN_STATION_WIDTH);
    let url_width = available.saturating_sub(name_width);

    stations
        .iter()
        .map(|station| {
            format!(
                "{:<width$} │ {}",
                truncate_string(&station.name, name_width),
                truncate_string(station.stream_url.as_str(), url_width),
                width = name_width
            )
        })
        .collect()
}

fn render_status(f: &mut Frame, area: Rect, app: &UIState) {
    let control = match app.player_state() {
        Some(state) => {
            let style = if state.control_enabled() {
                Style::default().fg(Color::Black).bg(Color::Green).add_modifier(Modifier::BOLD)
            } else {
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::DIM)
            };
            Span::styled(format!(" {} ", state.control_label()), style)
        }
        None => Span::styled(" Play ", Style::default().fg(Color::DarkGray)),
    };

    let status = Paragraph::new(Text::from(Line::from(vec![
        control,
        Span::raw("  "),
        Span::styled(app.status_message.as_str(), Style::default().fg(Color::White)),
    ])))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue))
            .title("Status"),
    );
    f.render_widget(status, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let controls_text = vec![Line::from(vec![
        Span::styled("↑/↓ ", Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("Navigate • ", Style::default().fg(Color::White)),
        Span::styled("ENTER ", Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)),
        Span::styled("Tune in • ", Style::default().fg(Color::White)),
        Span::styled("SPACE ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::styled("Play/Pause • ", Style::default().fg(Color::White)),
        Span::styled("S ", Style::default().fg(Color::Blue).add_modifier(Modifier::BOLD)),
        Span::styled("Stop • ", Style::default().fg(Color::White)),
        Span::styled("Q ", Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)),
        Span::styled("Quit", Style::default().fg(Color::White)),
    ])];

    let controls = Paragraph::new(Text::from(controls_text))
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Gray))
                .title("Controls"),
        );
    f.render_widget(controls, area);
}

/// Cut `s` to `max_len` chars, ending in "..." when something was dropped.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = s.chars().take(keep).collect();
    out.push_str(&"..."[..max_len.min(3)]);
    out
}
