//! Audio value types and buffers shared by the detector, player and
//! service adapters.
//!
//! The whole pipeline speaks one frame shape: signed-16 PCM, stereo,
//! 48 kHz, with presentation timestamps counted in samples since the
//! start of the track. These defaults are the contract with the WebRTC
//! media layer; `Config` may override them via environment knobs but
//! every component of a session reads the same values.

pub mod fifo;
pub mod frame;

pub use fifo::AudioFifo;
pub use frame::{AudioFrame, ChannelLayout, SampleFormat};

/// Default session sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default outbound frame size in samples per channel (20 ms at 48 kHz).
pub const DEFAULT_FRAME_SIZE: usize = 960;

/// Permitted bounds for the outbound frame size.
pub const FRAME_SIZE_MIN: usize = 128;
pub const FRAME_SIZE_MAX: usize = 4096;
