mod app;
mod config;
mod demux;
mod device;
mod error;
mod events;
mod output;
mod player;
mod pool;
mod queue;
mod stations;
mod stream;
mod ui;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use app::AppController;
use clap::Parser;
use config::{Args, PlayerConfig};
use crossterm::{
    event::{self, Event},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::{info, warn};
use output::RodioDevice;
use ratatui::{backend::CrosstermBackend, Terminal};
use rodio::OutputStream;
use std::fs::File;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use stream::ReqwestTransport;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let stations = match &args.stations {
        Some(path) => stations::load_station_file(path)?,
        None => stations::bundled_stations(),
    };
    info!("Loaded {} stations", stations.len());

    let config = PlayerConfig::from(&args);
    let transport = ReqwestTransport::new(&config.user_agent, config.connect_timeout)
        .context("Failed to build HTTP client")?;

    // the stream must stay alive (and on this thread) for as long as we play
    let (_stream, stream_handle) =
        OutputStream::try_default().context("No audio output device available")?;
    let device = RodioDevice::new(stream_handle);

    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        original_hook(panic);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app_controller =
        AppController::new(stations, config, Arc::new(transport), Arc::new(device));

    let res = run_app(&mut terminal, &mut app_controller).await;

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = &res {
        warn!("UI loop ended with an error: {:#}", err);
    }
    res
}

/// Logs go to stderr unless `--log-file` is given; stderr is unreadable
/// under the alternate screen, so the file is the useful option.
fn init_logging(args: &Args) -> Result<()> {
    let Some(path) = &args.log_file else {
        env_logger::init();
        return Ok(());
    };
    let file = File::create(path)
        .with_context(|| format!("Failed to create log file {}", path.display()))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(file)))
        .init();
    Ok(())
}

async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app_controller: &mut AppController,
) -> Result<()> {
    loop {
        app_controller.poll_player_state();
        terminal.draw(|f| ui::render_ui(f, &mut app_controller.ui_app))?;

        if event::poll(Duration::from_millis(50))? {
            match event::read() {
                Ok(Event::Key(key)) => {
                    if app_controller.handle_key_event(key.code)? {
                        break;
                    }
                }
                Ok(_) => {}
                Err(_) => {}
            }
        }

        sleep(Duration::from_millis(16)).await;

        if app_controller.should_quit() {
            break;
        }
    }

    Ok(())
}
