//! Immutable PCM audio frames.
//!
//! A frame is a fixed slice of interleaved signed-16 samples plus the
//! metadata needed to interpret it: channel layout, sample rate and an
//! optional presentation timestamp (pts) counted in samples since the
//! start of the track. Frames are cheap to clone — the payload lives in
//! an `Arc`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Sample format of a frame. Only signed-16 PCM is used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    S16,
}

impl SampleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleFormat::S16 => "s16",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "s16" => Some(SampleFormat::S16),
            _ => None,
        }
    }
}

/// Channel layout of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    Stereo,
}

impl ChannelLayout {
    pub fn channels(&self) -> usize {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelLayout::Mono => "mono",
            ChannelLayout::Stereo => "stereo",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mono" => Some(ChannelLayout::Mono),
            "stereo" => Some(ChannelLayout::Stereo),
            _ => None,
        }
    }
}

/// One immutable slice of PCM audio.
///
/// `samples` counts samples per channel; the interleaved payload holds
/// `samples * channels` values. Invariants: `duration = samples / rate`,
/// `start_time = pts / rate`.
#[derive(Clone)]
pub struct AudioFrame {
    format: SampleFormat,
    layout: ChannelLayout,
    rate: u32,
    samples: usize,
    pts: Option<i64>,
    data: Arc<[i16]>,
}

impl AudioFrame {
    /// Build a frame from interleaved samples. The length must be a
    /// multiple of the channel count.
    pub fn from_samples(data: Vec<i16>, layout: ChannelLayout, rate: u32) -> Self {
        let channels = layout.channels();
        debug_assert!(data.len() % channels == 0, "interleaved length mismatch");
        let samples = data.len() / channels;
        Self {
            format: SampleFormat::S16,
            layout,
            rate,
            samples,
            pts: None,
            data: data.into(),
        }
    }

    /// A zero-filled frame of `samples` samples per channel.
    pub fn silent(samples: usize, layout: ChannelLayout, rate: u32) -> Self {
        Self::from_samples(vec![0i16; samples * layout.channels()], layout, rate)
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Samples per channel.
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    /// Interleaved payload.
    pub fn data(&self) -> &[i16] {
        &self.data
    }

    /// The same payload with a different presentation timestamp.
    pub fn with_pts(&self, pts: Option<i64>) -> Self {
        Self { pts, ..self.clone() }
    }

    /// Frame length in seconds: `samples / rate`.
    pub fn duration_secs(&self) -> f64 {
        self.samples as f64 / self.rate as f64
    }

    /// Stream-relative time at which this frame starts: `pts / rate`.
    pub fn start_time_secs(&self) -> Option<f64> {
        self.pts.map(|pts| pts as f64 / self.rate as f64)
    }

    /// RMS energy over all interleaved samples.
    ///
    /// Squares are accumulated in f64: i16 squares overflow the sample
    /// width long before a frame ends.
    pub fn energy(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self.data.iter().map(|&s| {
            let s = s as f64;
            s * s
        }).sum();
        (sum_sq / self.data.len() as f64).sqrt()
    }
}

impl fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFrame")
            .field("format", &self.format.as_str())
            .field("layout", &self.layout.as_str())
            .field("rate", &self.rate)
            .field("samples", &self.samples)
            .field("pts", &self.pts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silent_frame_shape() {
        let f = AudioFrame::silent(960, ChannelLayout::Stereo, 48_000);
        assert_eq!(f.samples(), 960);
        assert_eq!(f.data().len(), 1920);
        assert!(f.data().iter().all(|&s| s == 0));
        assert_eq!(f.energy(), 0.0);
        assert_eq!(f.pts(), None);
    }

    #[test]
    fn duration_and_start_time() {
        let f = AudioFrame::silent(960, ChannelLayout::Stereo, 48_000).with_pts(Some(48_000));
        assert!((f.duration_secs() - 0.02).abs() < 1e-9);
        assert_eq!(f.start_time_secs(), Some(1.0));
    }

    #[test]
    fn energy_of_constant_signal() {
        let f = AudioFrame::from_samples(vec![1000i16; 1920], ChannelLayout::Stereo, 48_000);
        assert!((f.energy() - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn energy_does_not_overflow_at_full_scale() {
        let f = AudioFrame::from_samples(vec![i16::MIN; 1920], ChannelLayout::Stereo, 48_000);
        let expected = (i16::MIN as f64).abs();
        assert!((f.energy() - expected).abs() < 1.0);
    }

    #[test]
    fn with_pts_keeps_payload() {
        let f = AudioFrame::from_samples(vec![7i16; 4], ChannelLayout::Stereo, 48_000);
        let g = f.with_pts(Some(100));
        assert_eq!(g.pts(), Some(100));
        assert_eq!(g.data(), f.data());
    }
}
