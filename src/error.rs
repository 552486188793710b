use thiserror::Error;

use crate::buffer::BufferError;
use crate::consumer::ConsumerError;
use crate::discovery::engine::DiscoveryError;
use crate::discovery::protocol::ProtocolError;
use crate::options::OptionError;
use crate::upload::UploadError;

/// Crate-level error, aggregating the per-concern errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("stream buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("discovery protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("option error: {0}")]
    Option(#[from] OptionError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
