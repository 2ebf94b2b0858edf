//! External-service seams.
//!
//! One trait per collaborator so the session core is fully
//! unit-testable with fakes: speech-to-text, chat/completion, speech
//! synthesis, the voice directory and language detection. The real
//! implementations live in the submodules and are thin REST wrappers.

pub mod lang;
pub mod llm;
pub mod speech;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::audio::AudioFrame;
use crate::types::{Message, Voice};

/// Transcribe one utterance of audio into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &AudioFrame, language: Option<&str>) -> Result<String>;
}

/// Options for one completion call.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    /// How many candidate replies to request. Only the first is used.
    pub n: u32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
}

/// Produce the assistant's next reply from the message history.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(&self, messages: &[Message], options: &CompletionOptions) -> Result<String>;
}

/// Synthesise text into one audio frame in the session's format.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &Voice) -> Result<AudioFrame>;
}

/// Pick a voice able to speak a language.
#[async_trait]
pub trait VoiceDirectory: Send + Sync {
    async fn voice_for(&self, language: &str) -> Result<Voice>;
}

/// Detect the language of a text sample.
#[async_trait]
pub trait LanguageDetector: Send + Sync {
    async fn detect(&self, text: &str) -> Result<String>;
}

/// The full collaborator set handed to a session at construction.
#[derive(Clone)]
pub struct Services {
    pub transcriber: Arc<dyn Transcriber>,
    pub completer: Arc<dyn Completer>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub voices: Arc<dyn VoiceDirectory>,
    pub language: Arc<dyn LanguageDetector>,
}

impl Services {
    /// Build the production set from configuration. API keys come from
    /// the environment: `OPENAI_API_KEY` for transcription/completion,
    /// `GOOGLE_API_KEY` for synthesis, voices and detection.
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        let openai_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let google_key = std::env::var("GOOGLE_API_KEY")
            .map_err(|_| anyhow::anyhow!("GOOGLE_API_KEY not set"))?;

        let llm = Arc::new(llm::LlmClient::new(
            config.services.openai_base_url.clone(),
            openai_key.clone(),
            llm::Model::parse(&config.services.completion_model)?,
        ));
        let stt = Arc::new(speech::WhisperTranscriber::new(
            config.services.openai_base_url.clone(),
            openai_key,
            config.services.transcription_model.clone(),
        ));
        let tts = Arc::new(speech::CloudSynthesizer::new(
            config.services.tts_base_url.clone(),
            google_key.clone(),
            &config.audio,
        ));
        let voices = Arc::new(speech::CloudVoiceDirectory::new(
            config.services.tts_base_url.clone(),
            google_key.clone(),
        ));
        let detector = Arc::new(lang::CloudLanguageDetector::new(
            config.services.translate_base_url.clone(),
            google_key,
        ));

        Ok(Self {
            transcriber: stt,
            completer: llm,
            synthesizer: tts,
            voices,
            language: detector,
        })
    }
}
