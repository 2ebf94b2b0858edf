//! Sample FIFO between a frame producer and a frame consumer.
//!
//! Frames written in are flattened to interleaved samples; reads slice
//! fixed-size frames back out. The running `samples_written` counter
//! lets the player stamp outbound pts values.

use std::collections::VecDeque;

use tracing::warn;

use super::frame::{AudioFrame, ChannelLayout};

pub struct AudioFifo {
    layout: ChannelLayout,
    rate: u32,
    buf: VecDeque<i16>,
    samples_written: i64,
}

impl AudioFifo {
    pub fn new(layout: ChannelLayout, rate: u32) -> Self {
        Self {
            layout,
            rate,
            buf: VecDeque::new(),
            samples_written: 0,
        }
    }

    /// Append a frame's samples. A frame with a mismatched rate or
    /// layout is still written, with a warning — the mismatch is a
    /// producer bug, not a reason to drop audio.
    pub fn write(&mut self, frame: &AudioFrame) {
        if frame.rate() != self.rate || frame.layout() != self.layout {
            warn!(
                frame_rate = frame.rate(),
                fifo_rate = self.rate,
                frame_layout = frame.layout().as_str(),
                fifo_layout = self.layout.as_str(),
                "frame format does not match fifo"
            );
        }
        self.buf.extend(frame.data().iter().copied());
        self.samples_written += frame.samples() as i64;
    }

    /// Read exactly `samples` samples per channel, or `None` if fewer
    /// are buffered.
    pub fn read(&mut self, samples: usize) -> Option<AudioFrame> {
        if self.len_samples() < samples {
            return None;
        }
        let take = samples * self.layout.channels();
        let data: Vec<i16> = self.buf.drain(..take).collect();
        Some(AudioFrame::from_samples(data, self.layout, self.rate))
    }

    /// Drain whatever is buffered, whole frames or not.
    pub fn read_partial(&mut self) -> Option<AudioFrame> {
        if self.buf.is_empty() {
            return None;
        }
        // Truncate to whole interleaved sample groups.
        let channels = self.layout.channels();
        let take = (self.buf.len() / channels) * channels;
        let data: Vec<i16> = self.buf.drain(..take).collect();
        self.buf.clear();
        Some(AudioFrame::from_samples(data, self.layout, self.rate))
    }

    /// Buffered samples per channel.
    pub fn len_samples(&self) -> usize {
        self.buf.len() / self.layout.channels()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Samples per channel ever written into this fifo.
    pub fn samples_written(&self) -> i64 {
        self.samples_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(samples: usize) -> AudioFrame {
        AudioFrame::from_samples(vec![1i16; samples * 2], ChannelLayout::Stereo, 48_000)
    }

    #[test]
    fn read_exact_frames() {
        let mut fifo = AudioFifo::new(ChannelLayout::Stereo, 48_000);
        fifo.write(&frame(1000));
        let out = fifo.read(960).expect("enough samples");
        assert_eq!(out.samples(), 960);
        assert_eq!(fifo.len_samples(), 40);
        assert!(fifo.read(960).is_none());
    }

    #[test]
    fn read_partial_drains_remainder() {
        let mut fifo = AudioFifo::new(ChannelLayout::Stereo, 48_000);
        fifo.write(&frame(100));
        let out = fifo.read_partial().expect("fragment");
        assert_eq!(out.samples(), 100);
        assert!(fifo.is_empty());
        assert!(fifo.read_partial().is_none());
    }

    #[test]
    fn samples_written_accumulates() {
        let mut fifo = AudioFifo::new(ChannelLayout::Stereo, 48_000);
        fifo.write(&frame(960));
        fifo.write(&frame(960));
        assert_eq!(fifo.samples_written(), 1920);
        let _ = fifo.read(960);
        // Reads do not affect the write counter.
        assert_eq!(fifo.samples_written(), 1920);
    }

    #[test]
    fn concatenation_preserves_order() {
        let mut fifo = AudioFifo::new(ChannelLayout::Mono, 48_000);
        fifo.write(&AudioFrame::from_samples(vec![1, 2], ChannelLayout::Mono, 48_000));
        fifo.write(&AudioFrame::from_samples(vec![3, 4], ChannelLayout::Mono, 48_000));
        let out = fifo.read_partial().unwrap();
        assert_eq!(out.data(), &[1, 2, 3, 4]);
    }
}
