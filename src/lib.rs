//! Bridge between a DVR recorder and HDHomeRun-family network tuners.
//!
//! The crate has two halves. The discovery side (`discovery`) finds tuners on
//! the LAN over UDP, keeps a registry of physical devices and their logical
//! capture tuners, and exposes a facade the recorder-facing controller drives.
//! The streaming side (`consumer`) takes the MPEG-TS bytes a tuner produces,
//! buffers them through a bounded ring, and delivers them to a local file or
//! to the recorder's media-upload service, including seamless mid-recording
//! switchover to a new destination.

pub mod buffer;
pub mod config;
pub mod consumer;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod options;
pub mod sink;
pub mod ts;
pub mod upload;

pub use error::{Error, Result};
