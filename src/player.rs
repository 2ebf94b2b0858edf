//! Response playback.
//!
//! [`ResponsePlayer`] owns the outbound audio source the transport
//! polls. It plays at most one utterance at a time, paces frames to
//! real time so the peer's jitter buffer never overfills, and signals
//! when the buffer has drained.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioFifo, AudioFrame, ChannelLayout};
use crate::config::AudioConfig;
use crate::error::{SessionError, SessionResult};
use crate::sync::Flag;

/// Allowable look-ahead before a frame's scheduled start. Keeps the
/// client buffer primed without flooding it.
const MAX_BUFFER_SECS: f64 = 0.1;

/// Seconds of grace beyond the frame duration before a send times out.
const SEND_GRACE_SECS: f64 = 5.0;

/// The outbound audio track. The transport calls [`PlayerStream::recv`]
/// whenever it needs a frame (typically every 20 ms); writers go
/// through [`ResponsePlayer::send_utterance`].
pub struct PlayerStream {
    frame_size: usize,
    layout: ChannelLayout,
    rate: u32,
    fifo: StdMutex<AudioFifo>,
    flushed: Flag,
    /// Samples already produced by the track; the next frame's pts.
    produced: AtomicI64,
    start_time: StdMutex<Option<Instant>>,
}

impl PlayerStream {
    fn new(audio: &AudioConfig) -> Self {
        Self {
            frame_size: audio.frame_size,
            layout: audio.layout,
            rate: audio.sample_rate,
            fifo: StdMutex::new(AudioFifo::new(audio.layout, audio.sample_rate)),
            flushed: Flag::new(true),
            produced: AtomicI64::new(0),
            start_time: StdMutex::new(None),
        }
    }

    /// Return one fixed-size frame: buffered audio if a whole frame is
    /// available, silence otherwise. This call never fails; the track
    /// outlives any single utterance.
    pub async fn recv(&self) -> AudioFrame {
        let frame = {
            let mut fifo = self.fifo.lock().unwrap();
            match fifo.read(self.frame_size) {
                Some(frame) => frame,
                None => {
                    // Whatever was written has been played out; any
                    // partial fragment is dropped rather than padded.
                    if fifo.read_partial().is_some() {
                        trace!("dropped partial fragment");
                    }
                    drop(fifo);
                    self.flushed.set();
                    AudioFrame::silent(self.frame_size, self.layout, self.rate)
                }
            }
        };
        let pts = self
            .produced
            .fetch_add(frame.samples() as i64, Ordering::SeqCst);
        let frame = frame.with_pts(Some(pts));
        self.throttle(&frame).await;
        frame
    }

    /// Sleep until just before the frame's scheduled start relative to
    /// the first `recv`.
    async fn throttle(&self, frame: &AudioFrame) {
        let start_time = {
            let mut slot = self.start_time.lock().unwrap();
            *slot.get_or_insert_with(Instant::now)
        };
        let offset = frame.start_time_secs().unwrap_or(0.0);
        let due = start_time + Duration::from_secs_f64(offset);
        // duration_since saturates to zero for frames already overdue.
        let delay = due
            .duration_since(Instant::now())
            .saturating_sub(Duration::from_secs_f64(MAX_BUFFER_SECS));
        if !delay.is_zero() {
            trace!(delay_secs = delay.as_secs_f64(), "throttling playback");
            tokio::time::sleep(delay).await;
        }
    }

    fn write(&self, frame: &AudioFrame) {
        debug!(?frame, "writing frame to the outbound fifo");
        let mut fifo = self.fifo.lock().unwrap();
        fifo.write(frame);
        self.flushed.clear();
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }
}

/// When audio is sent, it is streamed over the owned track in real time.
pub struct ResponsePlayer {
    stream: Arc<PlayerStream>,
}

impl ResponsePlayer {
    pub fn new(audio: &AudioConfig) -> Self {
        let stream = Arc::new(PlayerStream::new(audio));
        info!(
            frame_size = stream.frame_size,
            rate = stream.rate,
            "initialized player stream"
        );
        Self { stream }
    }

    /// The track object to register with the peer connection.
    pub fn audio(&self) -> Arc<PlayerStream> {
        Arc::clone(&self.stream)
    }

    /// Write the frame to the track and return once it has been fully
    /// drained — i.e. the peer received it in real time. Timing matters
    /// here: the turn loop switches from speaking back to listening when
    /// this returns.
    pub async fn send_utterance(&self, frame: &AudioFrame) -> SessionResult<()> {
        if frame.rate() != self.stream.rate {
            return Err(SessionError::unexpected(anyhow::anyhow!(
                "frame rate {} does not match session rate {}",
                frame.rate(),
                self.stream.rate
            )));
        }
        info!(
            duration_secs = format!("{:.3}", frame.duration_secs()),
            "sending utterance..."
        );
        self.stream.write(frame);
        let timeout = frame.duration_secs() + SEND_GRACE_SECS;
        tokio::time::timeout(
            Duration::from_secs_f64(timeout),
            self.stream.flushed.wait(),
        )
        .await
        .map_err(|_| {
            warn!(timeout_secs = timeout, "timed out waiting for playback to drain");
            SessionError::SendTimeout { timeout }
        })?;
        info!("utterance sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> ResponsePlayer {
        ResponsePlayer::new(&AudioConfig::default())
    }

    fn frame_of(samples: usize, amplitude: i16) -> AudioFrame {
        AudioFrame::from_samples(vec![amplitude; samples * 2], ChannelLayout::Stereo, 48_000)
    }

    #[tokio::test(start_paused = true)]
    async fn empty_stream_yields_silence_and_flushes() {
        let p = player();
        let stream = p.audio();
        let frame = stream.recv().await;
        assert_eq!(frame.samples(), 960);
        assert!(frame.data().iter().all(|&s| s == 0));
        assert!(stream.flushed.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn recv_frames_have_monotonic_pts() {
        let p = player();
        let stream = p.audio();
        for i in 0..5 {
            let frame = stream.recv().await;
            assert_eq!(frame.pts(), Some(i * 960));
            assert_eq!(frame.samples(), 960);
            assert_eq!(frame.rate(), 48_000);
            assert_eq!(frame.layout(), ChannelLayout::Stereo);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_utterance_returns_after_drain() {
        let p = player();
        let stream = p.audio();

        // Transport-side poller.
        let poller = tokio::spawn(async move {
            let mut non_silent = 0;
            for _ in 0..20 {
                let frame = stream.recv().await;
                if frame.data().iter().any(|&s| s != 0) {
                    non_silent += 1;
                }
            }
            non_silent
        });

        p.send_utterance(&frame_of(960 * 3, 500)).await.unwrap();
        let non_silent = poller.await.unwrap();
        assert_eq!(non_silent, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unpolled_send_times_out() {
        let p = player();
        let err = p.send_utterance(&frame_of(960, 500)).await.unwrap_err();
        match err {
            SessionError::SendTimeout { timeout } => {
                assert!((timeout - (0.02 + SEND_GRACE_SECS)).abs() < 1e-9);
            }
            other => panic!("expected SendTimeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_fragments_are_dropped() {
        let p = player();
        let stream = p.audio();
        // 1.5 frames worth of audio: one whole frame plays, the
        // fragment is discarded when the fifo underruns.
        stream.write(&frame_of(960 + 480, 500));
        let first = stream.recv().await;
        assert!(first.data().iter().any(|&s| s != 0));
        let second = stream.recv().await;
        assert!(second.data().iter().all(|&s| s == 0));
        assert!(stream.flushed.is_set());
    }

    #[tokio::test]
    async fn rejects_mismatched_rate() {
        let p = player();
        let wrong = AudioFrame::from_samples(vec![0; 960 * 2], ChannelLayout::Stereo, 44_100);
        assert!(p.send_utterance(&wrong).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn playback_is_paced_to_real_time() {
        let p = player();
        let stream = p.audio();
        let start = tokio::time::Instant::now();
        // 20 frames = 400 ms of audio; with a 100 ms look-ahead the
        // last frame may be handed out no earlier than ~280 ms in.
        for _ in 0..20 {
            let _ = stream.recv().await;
        }
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(250),
            "throttle too permissive: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(400),
            "throttle too strict: {elapsed:?}"
        );
    }
}
