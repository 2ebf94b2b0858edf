//! The per-connection session orchestrator.
//!
//! A [`Chatter`] binds one detector, one player, the external service
//! adapters and the signalling channel into a turn loop:
//!
//! ```text
//! listen ─▶ transcribe ─▶ (first turn: detect language, pick voice)
//!    ▲                         │
//!    │                         ▼
//! speak ◀── synthesise ◀── think (LLM)
//! ```
//!
//! The loop is strictly sequential — no two external calls overlap —
//! and every phase transition is narrated on the data channel. Errors
//! dispatch on their variant: a start-of-speech timeout and an
//! over-long utterance are recovered in place, everything else ends
//! the session.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::activity::ActivityKind;
use crate::audio::AudioFrame;
use crate::config::Config;
use crate::detector::UtteranceDetector;
use crate::error::{SessionError, SessionResult};
use crate::player::{PlayerStream, ResponsePlayer};
use crate::services::{CompletionOptions, Services};
use crate::signal::{SignalChannel, Signaller, Status};
use crate::storage::TranscriptStore;
use crate::sync::Flag;
use crate::types::{Character, Message, Role, Transcript};

/// Spoken when the user goes quiet, before giving up on them.
const REPROMPT_TEXT: &str = "Are you still there?";

/// Voice language used for the re-prompt when no character exists yet.
const FALLBACK_LANGUAGE: &str = "en";

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    WaitingForChannel,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Ended,
}

/// One conversational session: detector + player + adapters + turn
/// loop. Created by the signalling layer when an offer is accepted,
/// destroyed when the peer connection closes.
pub struct Chatter {
    inner: Arc<ChatterInner>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

struct ChatterInner {
    config: Config,
    activity: ActivityKind,
    user_id: String,
    detector: UtteranceDetector,
    player: ResponsePlayer,
    services: Services,
    store: Arc<dyn TranscriptStore>,
    signal: Signaller,
    connected: Flag,
    phase: StdMutex<SessionPhase>,
    messages: StdMutex<Vec<Message>>,
    character: StdMutex<Option<Character>>,
    consecutive_silent: AtomicU32,
}

impl Chatter {
    pub fn new(
        config: Config,
        activity: ActivityKind,
        user_id: impl Into<String>,
        services: Services,
        store: Arc<dyn TranscriptStore>,
    ) -> Self {
        let connected = Flag::new(false);
        let detector =
            UtteranceDetector::new(config.listening.clone(), &config.audio, connected.clone());
        let player = ResponsePlayer::new(&config.audio);
        let messages = activity.prompt();
        Self {
            inner: Arc::new(ChatterInner {
                config,
                activity,
                user_id: user_id.into(),
                detector,
                player,
                services,
                store,
                signal: Signaller::new(),
                connected,
                phase: StdMutex::new(SessionPhase::Idle),
                messages: StdMutex::new(messages),
                character: StdMutex::new(None),
                consecutive_silent: AtomicU32::new(0),
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn detector(&self) -> &UtteranceDetector {
        &self.inner.detector
    }

    /// The outbound track to register with the peer connection.
    pub fn audio_out(&self) -> Arc<PlayerStream> {
        self.inner.player.audio()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.inner.phase.lock().unwrap()
    }

    /// Store the signalling channel and release the connected gate.
    /// At most one channel; repeats are logged and ignored.
    pub fn attach_channel(&self, channel: Arc<dyn SignalChannel>) {
        self.inner.signal.attach(channel);
        self.inner.connected.set();
    }

    /// Await the data-channel gate.
    pub async fn wait_connected(&self) {
        self.inner.connected.wait().await;
    }

    /// Start the detector and launch the main task. Idempotent.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut slot = self.task.lock().unwrap();
        if slot.is_some() {
            debug!("session already started, no-op");
            return Ok(());
        }
        debug!("starting detector...");
        self.inner.detector.start()?;
        info!("detector started");
        self.inner.set_phase(SessionPhase::WaitingForChannel);
        let inner = Arc::clone(&self.inner);
        *slot = Some(tokio::spawn(async move { inner.run().await }));
        Ok(())
    }

    /// Emit a stop status, cancel the main task, release the detector
    /// and save the transcript. Safe to call from any state, twice.
    pub async fn stop(&self) {
        let handle = self.task.lock().unwrap().take();
        let Some(handle) = handle else {
            debug!("session not running, stop is a no-op");
            return;
        };
        self.inner.signal.send_status(Status::Stop);
        handle.abort();
        let _ = handle.await;
        self.inner.detector.stop().await;
        self.inner.set_phase(SessionPhase::Ended);

        // Fire and forget; losing a transcript never fails a shutdown.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let transcript = inner.transcript();
            if let Err(e) = inner.store.save(&transcript).await {
                warn!(error = %e, "failed to save transcript");
            }
        });
    }

    /// The current message history (system prefix included).
    pub fn messages(&self) -> Vec<Message> {
        self.inner.messages.lock().unwrap().clone()
    }

    pub fn character(&self) -> Option<Character> {
        self.inner.character.lock().unwrap().clone()
    }
}

impl ChatterInner {
    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock().unwrap() = phase;
    }

    fn enter(&self, phase: SessionPhase, status: Status) {
        self.set_phase(phase);
        self.signal.send_status(status);
    }

    /// The main program loop.
    async fn run(self: Arc<Self>) {
        self.connected.wait().await;
        self.signal.send_status(Status::Hello);
        let max_loops = self.config.session.max_loops;
        let mut i: u64 = 0;
        loop {
            if i == max_loops && max_loops != 0 {
                info!(max_loops, "reached the conversation length cap");
                self.signal.send_status(Status::Maxlen);
                break;
            }
            debug!(i, "starting loop");
            self.signal.send_status(Status::Loopstart);
            if let Err(e) = self.turn().await {
                if !self.dispatch_error(e).await {
                    break;
                }
            }
            i += 1;
        }
        self.signal.send_status(Status::Bye);
        self.set_phase(SessionPhase::Ended);
    }

    /// Decide whether the loop continues after an error. Returns true
    /// to keep looping.
    async fn dispatch_error(&self, e: SessionError) -> bool {
        match e {
            SessionError::UtteranceTooLong { limit } => {
                warn!(limit, "utterance exceeded the per-turn cap");
                self.signal.send_error("utttoolong");
                true
            }
            SessionError::StartTimeout => {
                let count = self.consecutive_silent.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= self.config.session.start_timeout_max_count {
                    info!(count, "user is not speaking, ending the session");
                    self.signal.send_error("usrNotSpeaking");
                    return false;
                }
                debug!(count, "start-of-speech timeout, re-prompting");
                match self.speak_reprompt().await {
                    Ok(()) => true,
                    Err(SessionError::Disconnected) | Err(SessionError::SendTimeout { .. }) => {
                        false
                    }
                    Err(e) => {
                        warn!(error = %e, "re-prompt failed, continuing to listen");
                        true
                    }
                }
            }
            SessionError::Disconnected => {
                // Peer is gone; nobody is listening for an error.
                info!("peer disconnected, exiting the loop");
                false
            }
            SessionError::DetectionTimeout => {
                warn!("detection ran past its hard cap");
                self.signal.send_error("timeout");
                false
            }
            SessionError::SendTimeout { timeout } => {
                warn!(timeout, "playback stalled, exiting the loop");
                false
            }
            SessionError::UserReset(reason) => {
                self.signal.send_error(&reason);
                false
            }
            SessionError::External(e) => {
                error!(error = ?e, "external service failure");
                self.signal.send_error("internal");
                false
            }
            SessionError::Unexpected(e) => {
                error!(error = ?e, "unexpected session failure");
                self.signal.send_error("internal");
                false
            }
        }
    }

    /// One turn: listen, transcribe, think, speak.
    async fn turn(&self) -> SessionResult<()> {
        self.enter(SessionPhase::Listening, Status::Listening);
        let usr_audio = self.detector.get_utterance().await?;
        self.consecutive_silent.store(0, Ordering::SeqCst);

        self.enter(SessionPhase::Transcribing, Status::Transcribing);
        let usr_text = self.transcribe(&usr_audio).await?;
        let usr_msg = self.push_message(Role::User, usr_text.clone());
        self.signal.send_transcript(&usr_msg);

        self.ensure_character(&usr_text).await?;

        self.enter(SessionPhase::Thinking, Status::Thinking);
        let ast_text = self.think().await?;
        if ast_text.trim().is_empty() {
            warn!("got an empty assistant response");
            return Err(SessionError::UserReset("nothing to say".into()));
        }
        let ast_msg = self.push_message(Role::Assistant, ast_text.clone());
        self.signal.send_transcript(&ast_msg);

        self.enter(SessionPhase::Speaking, Status::Speaking);
        let ast_audio = self.synthesize(&ast_text).await?;
        self.player.send_utterance(&ast_audio).await?;
        Ok(())
    }

    async fn transcribe(&self, audio: &AudioFrame) -> SessionResult<String> {
        let language = self
            .character
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.language.clone());
        let text = external(
            self.config.services.stt_timeout_secs,
            "transcription",
            self.services.transcriber.transcribe(audio, language.as_deref()),
        )
        .await?;
        info!(text = %text, "transcribed user utterance");
        Ok(text)
    }

    /// First turn only: detect the language from the user text and pick
    /// a voice for it. Later turns reuse the character; the voice does
    /// not follow a mid-session language switch.
    async fn ensure_character(&self, sample_text: &str) -> SessionResult<()> {
        if self.character.lock().unwrap().is_some() {
            return Ok(());
        }
        let language = external(
            self.config.services.lang_timeout_secs,
            "language detection",
            self.services.language.detect(sample_text),
        )
        .await?;
        debug!(language, "language detected");
        let voice = external(
            self.config.services.voice_timeout_secs,
            "voice selection",
            self.services.voices.voice_for(&language),
        )
        .await?;
        debug!(voice = %voice.name, "voice selected");
        let character = Character::new(voice, language);
        info!(?character, "initialized character");
        *self.character.lock().unwrap() = Some(character);
        Ok(())
    }

    async fn think(&self) -> SessionResult<String> {
        let history = self.messages.lock().unwrap().clone();
        let options = CompletionOptions {
            n: 1,
            max_tokens: self.config.session.max_response_tokens,
            stop: self.config.session.stop_tokens.clone(),
        };
        let text = external(
            self.config.services.llm_timeout_secs,
            "completion",
            self.services.completer.complete(&history, &options),
        )
        .await?;
        info!(chars = text.len(), "got assistant response");
        Ok(text)
    }

    async fn synthesize(&self, text: &str) -> SessionResult<AudioFrame> {
        let voice = self
            .character
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.voice.clone())
            .ok_or_else(|| SessionError::unexpected(anyhow!("no character before synthesis")))?;
        external(
            self.config.services.tts_timeout_secs,
            "speech synthesis",
            self.services.synthesizer.synthesize(text, &voice),
        )
        .await
    }

    /// Ask the user whether they are still there, out loud.
    async fn speak_reprompt(&self) -> SessionResult<()> {
        let chosen = self
            .character
            .lock()
            .unwrap()
            .as_ref()
            .map(|character| character.voice.clone());
        let voice = match chosen {
            Some(voice) => voice,
            None => {
                external(
                    self.config.services.voice_timeout_secs,
                    "voice selection",
                    self.services.voices.voice_for(FALLBACK_LANGUAGE),
                )
                .await?
            }
        };
        let frame = external(
            self.config.services.tts_timeout_secs,
            "speech synthesis",
            self.services.synthesizer.synthesize(REPROMPT_TEXT, &voice),
        )
        .await?;
        self.enter(SessionPhase::Speaking, Status::Speaking);
        self.player.send_utterance(&frame).await
    }

    fn push_message(&self, role: Role, content: String) -> Message {
        let message = Message::new(role, content);
        debug!(?message, "adding message");
        self.messages.lock().unwrap().push(message.clone());
        message
    }

    fn transcript(&self) -> Transcript {
        let language = self
            .character
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.language.clone())
            .unwrap_or_else(|| "und".to_string());
        Transcript {
            activity_kind: self.activity,
            user_id: self.user_id.clone(),
            language,
            messages: self.messages.lock().unwrap().clone(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Bound an external call by its configured timeout and fold failures
/// into [`SessionError::External`].
async fn external<T>(
    timeout_secs: f64,
    label: &str,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> SessionResult<T> {
    match tokio::time::timeout(Duration::from_secs_f64(timeout_secs), fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(SessionError::External(e)),
        Err(_) => Err(SessionError::External(anyhow!(
            "{label} timed out after {timeout_secs} sec"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ChannelLayout;
    use crate::services::{
        Completer, CompletionOptions, LanguageDetector, Synthesizer, Transcriber, VoiceDirectory,
    };
    use crate::signal::test_support::CapturingChannel;
    use crate::storage::NullTranscriptStore;
    use crate::track::test_support::{silent_frame, tone_frame};
    use crate::track::{AudioSource, TrackError};
    use crate::types::Voice;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Amplitude of the stubbed TTS output, distinct from the scripted
    /// user speech so the sink assertions can tell them apart.
    const TTS_AMPLITUDE: i16 = 250;

    struct FakeStt;

    #[async_trait]
    impl Transcriber for FakeStt {
        async fn transcribe(&self, _: &AudioFrame, _: Option<&str>) -> anyhow::Result<String> {
            Ok("usr test".to_string())
        }
    }

    struct FailingStt;

    #[async_trait]
    impl Transcriber for FailingStt {
        async fn transcribe(&self, _: &AudioFrame, _: Option<&str>) -> anyhow::Result<String> {
            anyhow::bail!("stt service down")
        }
    }

    struct FakeLlm {
        reply: String,
    }

    #[async_trait]
    impl Completer for FakeLlm {
        async fn complete(&self, _: &[Message], _: &CompletionOptions) -> anyhow::Result<String> {
            Ok(self.reply.clone())
        }
    }

    struct FakeTts;

    #[async_trait]
    impl Synthesizer for FakeTts {
        async fn synthesize(&self, _: &str, _: &Voice) -> anyhow::Result<AudioFrame> {
            // Three outbound frames of known content.
            Ok(AudioFrame::from_samples(
                vec![TTS_AMPLITUDE; 960 * 3 * 2],
                ChannelLayout::Stereo,
                48_000,
            ))
        }
    }

    struct FakeVoices;

    #[async_trait]
    impl VoiceDirectory for FakeVoices {
        async fn voice_for(&self, language: &str) -> anyhow::Result<Voice> {
            Ok(Voice {
                name: "xx-XX-Standard-A".into(),
                language_code: language.to_string(),
                gender: "FEMALE".into(),
            })
        }
    }

    struct FakeLang;

    #[async_trait]
    impl LanguageDetector for FakeLang {
        async fn detect(&self, _: &str) -> anyhow::Result<String> {
            Ok("fr".to_string())
        }
    }

    fn fake_services() -> Services {
        Services {
            transcriber: Arc::new(FakeStt),
            completer: Arc::new(FakeLlm {
                reply: "ast test".into(),
            }),
            synthesizer: Arc::new(FakeTts),
            voices: Arc::new(FakeVoices),
            language: Arc::new(FakeLang),
        }
    }

    /// An endless generator cycling silence and speech (silence first,
    /// so the ambient measurement sees a quiet room), paced so the
    /// drainer and the detector interleave like they would on a live
    /// track.
    struct CyclingSource {
        position: AtomicUsize,
        speech_frames: usize,
        silence_frames: usize,
    }

    impl CyclingSource {
        fn new(speech_frames: usize, silence_frames: usize) -> Self {
            Self {
                position: AtomicUsize::new(0),
                speech_frames,
                silence_frames,
            }
        }
    }

    #[async_trait]
    impl AudioSource for CyclingSource {
        fn id(&self) -> &str {
            "cycling"
        }

        async fn recv(&self) -> Result<AudioFrame, TrackError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let period = self.speech_frames + self.silence_frames;
            let pos = self.position.fetch_add(1, Ordering::SeqCst) % period;
            Ok(if pos < self.silence_frames {
                silent_frame()
            } else {
                tone_frame(1000)
            })
        }
    }

    /// A short quiet lead-in, then speech that never stops.
    struct SpeechAfterQuiet {
        position: AtomicUsize,
        quiet_frames: usize,
    }

    #[async_trait]
    impl AudioSource for SpeechAfterQuiet {
        fn id(&self) -> &str {
            "speech-after-quiet"
        }

        async fn recv(&self) -> Result<AudioFrame, TrackError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let pos = self.position.fetch_add(1, Ordering::SeqCst);
            Ok(if pos < self.quiet_frames {
                silent_frame()
            } else {
                tone_frame(1000)
            })
        }
    }

    /// Endless silence, paced.
    struct SilentSource;

    #[async_trait]
    impl AudioSource for SilentSource {
        fn id(&self) -> &str {
            "silent"
        }

        async fn recv(&self) -> Result<AudioFrame, TrackError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(silent_frame())
        }
    }

    /// Quiet lead-in, a few seconds of speech, then a hangup
    /// mid-recording.
    struct HangupSource {
        position: AtomicUsize,
    }

    #[async_trait]
    impl AudioSource for HangupSource {
        fn id(&self) -> &str {
            "hangup"
        }

        async fn recv(&self) -> Result<AudioFrame, TrackError> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let pos = self.position.fetch_add(1, Ordering::SeqCst);
            if pos < 10 {
                Ok(silent_frame())
            } else if pos < 30 {
                Ok(tone_frame(1000))
            } else {
                Err(TrackError::Ended)
            }
        }
    }

    fn test_config(max_loops: u64) -> Config {
        let mut config = Config::default();
        config.session.max_loops = max_loops;
        config.listening.ambient_noise_measurement_secs = 0.04;
        config.listening.utterance_start_speaking_secs = 0.04;
        config.listening.utterance_end_silence_secs = 0.1;
        config.listening.utterance_start_timeout_secs = 2.0;
        config.listening.utterance_timeout_secs = 10.0;
        config
    }

    struct Harness {
        chatter: Chatter,
        channel: Arc<CapturingChannel>,
        sink: Arc<Mutex<Vec<AudioFrame>>>,
        pump: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: Config, services: Services, source: Arc<dyn AudioSource>) -> Self {
            let chatter = Chatter::new(
                config,
                ActivityKind::Unstructured,
                "test-user",
                services,
                Arc::new(NullTranscriptStore),
            );
            chatter.detector().set_track(source).unwrap();

            let channel = CapturingChannel::new();
            chatter.attach_channel(channel.clone());

            // Transport-side pump: polls the outbound track and keeps
            // every non-silent frame for assertions.
            let stream = chatter.audio_out();
            let sink: Arc<Mutex<Vec<AudioFrame>>> = Arc::new(Mutex::new(Vec::new()));
            let sink_in_pump = Arc::clone(&sink);
            let pump = tokio::spawn(async move {
                loop {
                    let frame = stream.recv().await;
                    if frame.data().iter().any(|&s| s != 0) {
                        sink_in_pump.lock().unwrap().push(frame);
                    }
                }
            });

            chatter.start().unwrap();
            Self {
                chatter,
                channel,
                sink,
                pump,
            }
        }

        /// Wait until the main loop says goodbye, bounded.
        async fn wait_for_bye(&self) {
            let deadline = Duration::from_secs(20);
            let channel = self.channel.clone();
            tokio::time::timeout(deadline, async move {
                loop {
                    if channel.statuses().iter().any(|s| s == "bye") {
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("session should end");
        }

        async fn finish(self) -> (Chatter, Arc<CapturingChannel>, Vec<AudioFrame>) {
            self.pump.abort();
            let _ = self.pump.await;
            self.chatter.stop().await;
            let sink = self.sink.lock().unwrap().clone();
            (self.chatter, self.channel, sink)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_turn_updates_history_and_plays_the_reply() {
        let harness = Harness::start(
            test_config(1),
            fake_services(),
            Arc::new(CyclingSource::new(30, 30)),
        );
        harness.wait_for_bye().await;
        let (chatter, channel, sink) = harness.finish().await;

        // History: system prefix then exactly one user/assistant pair.
        let messages = chatter.messages();
        let tail: Vec<_> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0], &Message::user("usr test"));
        assert_eq!(tail[1], &Message::assistant("ast test"));

        // One transcript line per appended message.
        assert_eq!(
            channel.transcripts(),
            vec!["user usr test".to_string(), "assistant ast test".to_string()]
        );

        // The sink saw the synthesised frame and nothing else.
        assert_eq!(sink.len(), 3);
        assert!(sink
            .iter()
            .all(|f| f.data().iter().all(|&s| s == 0 || s == TTS_AMPLITUDE)));

        // Character fixed from the first turn.
        let character = chatter.character().expect("character initialized");
        assert_eq!(character.language, "fr");

        // Status narration covers every phase.
        let statuses = channel.statuses();
        for expected in ["hello", "loopstart", "listening", "transcribing", "thinking", "speaking", "maxlen", "bye"] {
            assert!(
                statuses.iter().any(|s| s == expected),
                "missing status {expected}: {statuses:?}"
            );
        }
        assert!(channel.errors().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn max_loops_ends_with_maxlen() {
        let harness = Harness::start(
            test_config(2),
            fake_services(),
            Arc::new(CyclingSource::new(30, 30)),
        );
        harness.wait_for_bye().await;
        let (chatter, channel, _) = harness.finish().await;

        let statuses = channel.statuses();
        assert_eq!(statuses.iter().filter(|s| *s == "loopstart").count(), 2);
        assert_eq!(statuses.iter().filter(|s| *s == "speaking").count(), 2);
        let maxlen = statuses.iter().position(|s| s == "maxlen").expect("maxlen");
        let bye = statuses.iter().position(|s| s == "bye").expect("bye");
        assert!(maxlen < bye, "maxlen precedes bye");
        // Two full turns, two message pairs.
        let non_system = chatter
            .messages()
            .iter()
            .filter(|m| m.role != Role::System)
            .count();
        assert_eq!(non_system, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_user_is_reprompted_then_dropped() {
        let mut config = test_config(10);
        config.listening.utterance_start_timeout_secs = 0.15;
        let harness = Harness::start(config, fake_services(), Arc::new(SilentSource));
        harness.wait_for_bye().await;
        let (chatter, channel, sink) = harness.finish().await;

        // Exactly one spoken re-prompt (3 frames from the stub TTS),
        // then the session ends on the second timeout.
        assert_eq!(sink.len(), 3);
        assert_eq!(channel.errors(), vec!["usrNotSpeaking".to_string()]);
        // The user never said anything, so no transcript lines.
        assert!(channel.transcripts().is_empty());
        assert!(chatter
            .messages()
            .iter()
            .all(|m| m.role == Role::System));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlong_utterance_recovers_into_the_next_turn() {
        let mut config = test_config(2);
        config.listening.utterance_timeout_secs = 0.2;
        // Speech that never pauses long enough to end an utterance.
        let harness = Harness::start(
            config,
            fake_services(),
            Arc::new(SpeechAfterQuiet {
                position: AtomicUsize::new(0),
                quiet_frames: 10,
            }),
        );
        harness.wait_for_bye().await;
        let (_, channel, _) = harness.finish().await;

        assert!(channel.errors().iter().all(|e| e == "utttoolong"));
        assert!(!channel.errors().is_empty());
        // The loop continued past the failed turn up to the cap.
        let statuses = channel.statuses();
        assert_eq!(statuses.iter().filter(|s| *s == "loopstart").count(), 2);
        assert!(statuses.iter().any(|s| s == "maxlen"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn hangup_exits_silently() {
        let harness = Harness::start(
            test_config(5),
            fake_services(),
            Arc::new(HangupSource {
                position: AtomicUsize::new(0),
            }),
        );
        harness.wait_for_bye().await;
        let (_, channel, _) = harness.finish().await;

        assert!(channel.errors().is_empty(), "hangup is not an error");
        assert!(channel.transcripts().is_empty(), "no partial turns surfaced");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stt_failure_surfaces_internal_error() {
        let mut services = fake_services();
        services.transcriber = Arc::new(FailingStt);
        let harness = Harness::start(
            test_config(5),
            services,
            Arc::new(CyclingSource::new(30, 30)),
        );
        harness.wait_for_bye().await;
        let (_, channel, _) = harness.finish().await;
        assert_eq!(channel.errors(), vec!["internal".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_reply_resets_the_user() {
        let mut services = fake_services();
        services.completer = Arc::new(FakeLlm { reply: "  ".into() });
        let harness = Harness::start(
            test_config(5),
            services,
            Arc::new(CyclingSource::new(30, 30)),
        );
        harness.wait_for_bye().await;
        let (_, channel, _) = harness.finish().await;
        assert_eq!(channel.errors(), vec!["nothing to say".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_and_stop_are_idempotent() {
        let chatter = Chatter::new(
            test_config(1),
            ActivityKind::Unstructured,
            "test-user",
            fake_services(),
            Arc::new(NullTranscriptStore),
        );
        chatter
            .detector()
            .set_track(Arc::new(SilentSource))
            .unwrap();
        chatter.start().unwrap();
        chatter.start().unwrap();
        chatter.stop().await;
        chatter.stop().await;
        assert_eq!(chatter.phase(), SessionPhase::Ended);
    }
}
