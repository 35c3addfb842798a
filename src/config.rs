use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Packets that must be queued in an epoch before the device is started.
pub const DEFAULT_BUFFER_THRESHOLD: u64 = 100;
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4 * 1024;
pub const DEFAULT_SYNC_SEARCH_LIMIT: usize = 64 * 1024;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Parser)]
#[command(name = "webradio-tui", version, about = "Play live MP3/AAC internet radio in the terminal")]
pub struct Args {
    /// JSON station list ([{"name": .., "streamurl": ..}]); defaults to the bundled list
    #[arg(long)]
    pub stations: Option<PathBuf>,

    /// Packets to buffer before playback starts
    #[arg(long, default_value_t = DEFAULT_BUFFER_THRESHOLD)]
    pub buffer_threshold: u64,

    /// Largest byte chunk handed from the network to the parser
    #[arg(long, default_value_t = DEFAULT_READ_CHUNK_SIZE)]
    pub read_chunk_size: usize,

    /// Bytes to scan for a frame sync before giving up on a stream
    #[arg(long, default_value_t = DEFAULT_SYNC_SEARCH_LIMIT)]
    pub sync_search_limit: usize,

    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    pub connect_timeout_secs: u64,

    /// Write log output here instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerConfig {
    pub buffer_threshold: u64,
    pub read_chunk_size: usize,
    pub sync_search_limit: usize,
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            sync_search_limit: DEFAULT_SYNC_SEARCH_LIMIT,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&Args> for PlayerConfig {
    fn from(args: &Args) -> Self {
        Self {
            buffer_threshold: args.buffer_threshold,
            // a zero read size would never make progress
            read_chunk_size: args.read_chunk_size.max(1),
            sync_search_limit: args.sync_search_limit,
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PlayerConfig::default();
        assert_eq!(config.buffer_threshold, 100);
        assert_eq!(config.read_chunk_size, 4096);
        assert!(config.user_agent.starts_with("webradio-tui/"));
    }

    #[test]
    fn test_from_args() {
        let args = Args::parse_from([
            "webradio-tui",
            "--buffer-threshold",
            "40",
            "--read-chunk-size",
            "0",
            "--connect-timeout-secs",
            "3",
        ]);
        let config = PlayerConfig::from(&args);
        assert_eq!(config.buffer_threshold, 40);
        assert_eq!(config.read_chunk_size, 1);
        assert_eq!(config.sync_search_limit, DEFAULT_SYNC_SEARCH_LIMIT);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert!(args.stations.is_none());
    }
}
