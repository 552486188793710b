// Consumer selection.
//
// The recorder records different channels with different engines: the raw
// pass-through engine implemented here, or transcoding engines that live
// outside this crate. Routing is a channel -> kind table built from channel
// range options, with a configurable default kind.

pub mod raw;

use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::options::OptionStore;

pub use raw::{RawConsumer, RawConsumerOptions};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("consumer is already running")]
    AlreadyRunning,

    #[error("consumer has no output target")]
    NoTarget,

    #[error("consumer is not running")]
    NotRunning,

    #[error("a switch request is already pending")]
    SwitchPending,

    #[error("switch request failed")]
    SwitchFailed,

    #[error("unable to create recording file '{path}': {source}")]
    CreateFile {
        path: String,
        source: std::io::Error,
    },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("consumer kind '{0}' is not available in this build")]
    UnsupportedKind(&'static str),
}

/// The engine kinds a channel can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerKind {
    /// Pass-through MPEG-TS streaming (this crate).
    Raw,
    /// Software transcode via ffmpeg; external, not constructible here.
    FfmpegTrans,
    /// Recorder-side media server remux; external, not constructible here.
    MediaServer,
}

impl ConsumerKind {
    pub fn name(self) -> &'static str {
        match self {
            ConsumerKind::Raw => "raw",
            ConsumerKind::FfmpegTrans => "ffmpeg",
            ConsumerKind::MediaServer => "media_server",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(ConsumerKind::Raw),
            "ffmpeg" => Some(ConsumerKind::FfmpegTrans),
            "media_server" => Some(ConsumerKind::MediaServer),
            _ => None,
        }
    }
}

/// Channel -> consumer-kind routing table.
///
/// Options:
///   consumer.dynamic.default            kind used when no range matches
///   consumer.dynamic.channels.raw       channel ranges routed to Raw
///   consumer.dynamic.channels.ffmpeg    channel ranges routed to FfmpegTrans
///   consumer.dynamic.channels.media_server
pub struct ConsumerRouter {
    default: ConsumerKind,
    channels: HashMap<String, ConsumerKind>,
}

impl ConsumerRouter {
    pub fn from_store(store: &OptionStore) -> Self {
        let default = ConsumerKind::parse(&store.get_string("consumer.dynamic.default", "raw"))
            .unwrap_or(ConsumerKind::Raw);

        let mut channels = HashMap::new();
        for kind in [
            ConsumerKind::FfmpegTrans,
            ConsumerKind::MediaServer,
            ConsumerKind::Raw,
        ] {
            let key = format!("consumer.dynamic.channels.{}", kind.name());
            let ranges = store.get_string(&key, "");
            for channel in parse_channel_ranges(&ranges) {
                channels.insert(channel, kind);
            }
        }

        info!(
            default = default.name(),
            mapped = channels.len(),
            "consumer routing table loaded"
        );
        Self { default, channels }
    }

    /// Kind to use for `channel`. The channel must be known before any byte
    /// arrives; there is no lazy re-resolution mid-recording.
    pub fn kind_for(&self, channel: &str) -> ConsumerKind {
        self.channels
            .get(channel.trim())
            .copied()
            .unwrap_or(self.default)
    }

    /// Builds the engine for `channel`. Transcoding kinds are configured
    /// outside this crate; asking for one here is a configuration error.
    pub fn build(
        &self,
        channel: &str,
        opts: RawConsumerOptions,
    ) -> Result<RawConsumer, ConsumerError> {
        match self.kind_for(channel) {
            ConsumerKind::Raw => {
                let consumer = RawConsumer::new(opts);
                consumer.set_channel(channel);
                Ok(consumer)
            }
            other => Err(ConsumerError::UnsupportedKind(other.name())),
        }
    }
}

/// Expands "2-13,700,4.1" into individual channel strings. Entries that are
/// not a simple numeric range are kept verbatim. Oversized or inverted
/// ranges are treated as literals rather than expanded.
pub fn parse_channel_ranges(ranges: &str) -> Vec<String> {
    const MAX_RANGE_SPAN: u64 = 10_000;

    let mut channels = Vec::new();
    for entry in ranges.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if let Some((start, end)) = entry.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<u64>(), end.trim().parse::<u64>())
            {
                if start <= end && end - start <= MAX_RANGE_SPAN {
                    for channel in start..=end {
                        channels.push(channel.to_string());
                    }
                    continue;
                }
            }
        }
        channels.push(entry.to_string());
    }
    channels
}
