//! Utterance detection.
//!
//! An energy-based voice-activity state machine over one live audio
//! track. Each call to [`UtteranceDetector::get_utterance`] returns
//! exactly one bounded audio segment for the current user turn.
//!
//! ```text
//! Draining ──lock──▶ Measuring ─▶ WaitingForSpeech ─▶ Recording ─▶ Done
//!    ▲                (first call)                                  │
//!    └────────────────────────── unlock ◀───────────────────────────┘
//! ```
//!
//! While nothing is listening, a background task keeps pulling frames
//! off the track and throwing them away. Without it the track would
//! buffer the assistant's own synthesised speech (and anything else the
//! peer sent while we were thinking) and the next detection would read
//! stale audio. The drain task and the detection routine are mutually
//! exclusive on one lock, so a frame is either discarded or recorded,
//! never both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioFifo, AudioFrame, ChannelLayout};
use crate::config::AudioConfig;
use crate::error::{SessionError, SessionResult};
use crate::sync::Flag;
use crate::track::{source_str, AudioSource, TrackError, TrackKind};

/// Detection thresholds. All values are seconds unless noted; time is
/// measured in frame time (samples over rate), not wall clock, except
/// the two outer timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListeningConfig {
    /// Time spent measuring baseline noise on the first call.
    #[serde(default = "default_ambient")]
    pub ambient_noise_measurement_secs: f64,
    /// Above-threshold bursts up to this long do not reset the
    /// end-of-utterance silence counter.
    #[serde(default = "default_spike")]
    pub silence_detection_ignore_spike_secs: f64,
    /// Contiguous silence after speech that ends the utterance.
    #[serde(default = "default_end_silence")]
    pub utterance_end_silence_secs: f64,
    /// Floor on an acceptable utterance length.
    #[serde(default = "default_length_min")]
    pub utterance_length_min_secs: f64,
    /// Bound on silence before speech begins (wall clock).
    #[serde(default = "default_start_timeout")]
    pub utterance_start_timeout_secs: f64,
    /// Contiguous above-threshold time required to declare a start.
    #[serde(default = "default_start_speaking")]
    pub utterance_start_speaking_secs: f64,
    /// Hard cap on one detection call and on the recorded length.
    #[serde(default = "default_utterance_timeout")]
    pub utterance_timeout_secs: f64,
    /// Measured background energy is clamped to at least this value so
    /// a perfectly quiet room does not make the detector hair-triggered.
    #[serde(default = "default_energy_floor")]
    pub background_energy_floor: f64,
}

fn default_ambient() -> f64 {
    2.3
}

fn default_spike() -> f64 {
    0.05
}

fn default_end_silence() -> f64 {
    1.5
}

fn default_length_min() -> f64 {
    0.8
}

fn default_start_timeout() -> f64 {
    8.0
}

fn default_start_speaking() -> f64 {
    0.5
}

fn default_utterance_timeout() -> f64 {
    20.0
}

fn default_energy_floor() -> f64 {
    30.0
}

impl Default for ListeningConfig {
    fn default() -> Self {
        Self {
            ambient_noise_measurement_secs: default_ambient(),
            silence_detection_ignore_spike_secs: default_spike(),
            utterance_end_silence_secs: default_end_silence(),
            utterance_length_min_secs: default_length_min(),
            utterance_start_timeout_secs: default_start_timeout(),
            utterance_start_speaking_secs: default_start_speaking(),
            utterance_timeout_secs: default_utterance_timeout(),
            background_energy_floor: default_energy_floor(),
        }
    }
}

/// An audio media sink that detects utterances.
pub struct UtteranceDetector {
    config: ListeningConfig,
    layout: ChannelLayout,
    rate: u32,
    connected: Flag,
    track: StdMutex<Option<Arc<dyn AudioSource>>>,
    /// Held by exactly one of the drain task or a detection call.
    utterance_lock: Arc<AsyncMutex<()>>,
    background_energy: StdMutex<Option<f64>>,
    /// Whether the current detection call has entered its recording
    /// state; decides how an overall timeout is reported.
    recording: AtomicBool,
    drain_task: StdMutex<Option<JoinHandle<()>>>,
}

impl UtteranceDetector {
    pub fn new(config: ListeningConfig, audio: &AudioConfig, connected: Flag) -> Self {
        debug!(?config, "listening config");
        Self {
            config,
            layout: audio.layout,
            rate: audio.sample_rate,
            connected,
            track: StdMutex::new(None),
            utterance_lock: Arc::new(AsyncMutex::new(())),
            background_energy: StdMutex::new(None),
            recording: AtomicBool::new(false),
            drain_task: StdMutex::new(None),
        }
    }

    /// One-shot track assignment. A second assignment is logged and
    /// ignored.
    pub fn set_track(&self, track: Arc<dyn AudioSource>) -> Result<()> {
        if track.kind() != TrackKind::Audio {
            bail!("non-audio tracks not supported: {}", source_str(track.as_ref()));
        }
        if !track.is_live() {
            bail!("non-live tracks not supported: {}", source_str(track.as_ref()));
        }
        let mut slot = self.track.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            warn!(track = %source_str(existing.as_ref()), "track already set, ignoring");
            return Ok(());
        }
        *slot = Some(track);
        Ok(())
    }

    /// Launch the frame-drain background task. Fails if no track is set.
    pub fn start(&self) -> Result<()> {
        let track = self
            .current_track()
            .ok_or_else(|| anyhow!("track not yet set"))?;
        let mut slot = self.drain_task.lock().unwrap();
        if slot.is_some() {
            debug!("detector already started, no-op");
            return Ok(());
        }

        let lock = Arc::clone(&self.utterance_lock);
        let connected = self.connected.clone();
        let frame_timeout = Duration::from_secs_f64(self.config.utterance_timeout_secs);
        *slot = Some(tokio::spawn(async move {
            debug!("drain task waiting for the connected gate");
            connected.wait().await;
            debug!(track = %source_str(track.as_ref()), "drain task running");
            loop {
                let guard = lock.lock().await;
                match tokio::time::timeout(frame_timeout, track.recv()).await {
                    Ok(Ok(frame)) => {
                        trace!(samples = frame.samples(), "discarded frame");
                    }
                    Ok(Err(e)) => {
                        debug!(error = %e, "track ended while draining, drain task exiting");
                        break;
                    }
                    Err(_) => {
                        warn!(
                            timeout_secs = frame_timeout.as_secs_f64(),
                            "timed out waiting to drain a frame"
                        );
                    }
                }
                drop(guard);
            }
        }));
        Ok(())
    }

    /// Cancel the drain task and release the track.
    pub async fn stop(&self) {
        let handle = self.drain_task.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        *self.track.lock().unwrap() = None;
    }

    /// Wait for and return one utterance as a single concatenated frame.
    ///
    /// Acquiring the utterance lock pauses the drain task, so frames
    /// flow to the state machine instead of the bin. The lock releases
    /// on return (success or error) and the drainer resumes.
    pub async fn get_utterance(&self) -> SessionResult<AudioFrame> {
        let track = self
            .current_track()
            .ok_or_else(|| SessionError::unexpected(anyhow!("track not yet set")))?;
        info!("detecting utterance...");
        let _guard = self.utterance_lock.lock().await;
        self.recording.store(false, Ordering::SeqCst);
        let overall = Duration::from_secs_f64(self.config.utterance_timeout_secs);
        let utterance = tokio::time::timeout(overall, self.detect(&track))
            .await
            .map_err(|_| {
                // Running out the clock mid-recording means the user
                // was still talking; anywhere else the call as a whole
                // went stale.
                if self.recording.load(Ordering::SeqCst) {
                    SessionError::UtteranceTooLong {
                        limit: self.config.utterance_timeout_secs,
                    }
                } else {
                    SessionError::DetectionTimeout
                }
            })??;
        info!(
            duration_secs = format!("{:.3}", utterance.duration_secs()),
            "detected utterance"
        );
        Ok(utterance)
    }

    fn current_track(&self) -> Option<Arc<dyn AudioSource>> {
        self.track.lock().unwrap().clone()
    }

    async fn detect(&self, track: &Arc<dyn AudioSource>) -> SessionResult<AudioFrame> {
        let current = *self.background_energy.lock().unwrap();
        let background = match current {
            Some(energy) => energy,
            None => {
                debug!("measuring background energy...");
                let energy = self.measure_background(track).await?;
                *self.background_energy.lock().unwrap() = Some(energy);
                debug!(background_energy = format!("{energy:.3}"), "background measured");
                energy
            }
        };

        let start_timeout = Duration::from_secs_f64(self.config.utterance_start_timeout_secs);
        let prefix = tokio::time::timeout(start_timeout, self.wait_for_speech(track, background))
            .await
            .map_err(|_| {
                debug!("timed out waiting for the user to start speaking");
                SessionError::StartTimeout
            })??;

        self.record(track, background, prefix).await
    }

    /// First call only: listen for a fixed span and take the RMS energy
    /// of the aggregate as the VAD threshold, clamped to the floor.
    async fn measure_background(&self, track: &Arc<dyn AudioSource>) -> SessionResult<f64> {
        let mut fifo = AudioFifo::new(self.layout, self.rate);
        let mut elapsed = 0.0;
        while elapsed < self.config.ambient_noise_measurement_secs {
            let frame = recv(track).await?;
            elapsed += frame.duration_secs();
            fifo.write(&frame);
        }
        let aggregate = fifo
            .read_partial()
            .unwrap_or_else(|| AudioFrame::silent(0, self.layout, self.rate));
        Ok(aggregate.energy().max(self.config.background_energy_floor))
    }

    /// Hold off until audio energy is high enough for long enough.
    ///
    /// The accumulated above-threshold prefix is returned so the start
    /// of the first word is not clipped.
    async fn wait_for_speech(
        &self,
        track: &Arc<dyn AudioSource>,
        background: f64,
    ) -> SessionResult<AudioFrame> {
        let mut sustained = 0.0;
        let mut waited = 0.0;
        let mut fifo = AudioFifo::new(self.layout, self.rate);
        loop {
            let frame = recv(track).await?;
            let energy = frame.energy();
            let frame_time = frame.duration_secs();
            if energy > background {
                sustained += frame_time;
                fifo.write(&frame);
            } else {
                sustained = 0.0;
                let _ = fifo.read_partial();
            }
            trace!(sustained, waited, "waiting for speech");
            if sustained > self.config.utterance_start_speaking_secs {
                debug!(waited_secs = format!("{waited:.3}"), "utterance started");
                break;
            }
            waited += frame_time;
        }
        Ok(fifo
            .read_partial()
            .unwrap_or_else(|| AudioFrame::silent(0, self.layout, self.rate)))
    }

    /// Append frames until the trailing silence is long enough, then
    /// concatenate everything recorded into a single frame.
    async fn record(
        &self,
        track: &Arc<dyn AudioSource>,
        background: f64,
        prefix: AudioFrame,
    ) -> SessionResult<AudioFrame> {
        self.recording.store(true, Ordering::SeqCst);
        let mut fifo = AudioFifo::new(self.layout, self.rate);
        fifo.write(&prefix);
        let mut silence_time = 0.0;
        let mut silence_broken_time = 0.0;
        let mut total_utterance = 0.0;
        while silence_time < self.config.utterance_end_silence_secs {
            let frame = recv(track).await?;
            fifo.write(&frame);
            let energy = frame.energy();
            let frame_time = frame.duration_secs();
            if energy < background {
                silence_time += frame_time;
                silence_broken_time = 0.0;
            } else {
                silence_broken_time += frame_time;
                if silence_broken_time > self.config.silence_detection_ignore_spike_secs {
                    silence_time = 0.0;
                }
            }
            trace!(silence_time, "recording");
            total_utterance += frame_time;
            if total_utterance > self.config.utterance_timeout_secs {
                return Err(SessionError::UtteranceTooLong {
                    limit: self.config.utterance_timeout_secs,
                });
            }
        }
        debug!(
            total_secs = format!("{total_utterance:.3}"),
            "utterance stopped"
        );
        Ok(fifo
            .read_partial()
            .unwrap_or_else(|| AudioFrame::silent(0, self.layout, self.rate)))
    }
}

async fn recv(track: &Arc<dyn AudioSource>) -> SessionResult<AudioFrame> {
    track.recv().await.map_err(|e| match e {
        TrackError::Ended => SessionError::Disconnected,
        TrackError::Transport(_) => SessionError::Disconnected,
    })
}
