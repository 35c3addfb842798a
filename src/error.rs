//! Errors raised by the streaming engine.
//!
//! Every variant is fatal to the playback session that produced it and
//! nothing more: the UI can always build a fresh player afterwards.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    /// Non-2xx status, DNS/connect failure, or the server dropped the stream.
    #[error("Connection failed: {0}")]
    ConnectionFailure(String),

    /// Neither the content type nor the stream signature names a known container.
    #[error("Unsupported stream format: {0}")]
    UnsupportedFormat(String),

    /// Frame data that does not parse as the expected container.
    #[error("Malformed stream data: {0}")]
    ParseFailure(String),

    /// Output channel creation, buffer submission or start/stop failed.
    #[error("Audio device failure: {0}")]
    DeviceFailure(String),
}

impl PlayerError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, PlayerError::ConnectionFailure(_))
    }

    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            PlayerError::UnsupportedFormat(_) | PlayerError::ParseFailure(_)
        )
    }

    pub fn is_device_error(&self) -> bool {
        matches!(self, PlayerError::DeviceFailure(_))
    }
}

impl From<reqwest::Error> for PlayerError {
    fn from(err: reqwest::Error) -> Self {
        PlayerError::ConnectionFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
