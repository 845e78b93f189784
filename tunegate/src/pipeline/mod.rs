//! Transcoding pipeline: profile registry and FFmpeg supervision.

pub mod profiles;
pub mod transcoder;

pub use profiles::{Profile, ProfileRegistry};
pub use transcoder::{TranscodeHandle, Transcoder, pid_alive};
