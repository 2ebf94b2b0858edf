//! Configuration management.
//!
//! Settings load from a TOML file under the platform config dir, with
//! the audio/session knobs overridable through the `MOSHI*` environment
//! variables that form the deployment contract.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::audio::{
    ChannelLayout, SampleFormat, DEFAULT_FRAME_SIZE, DEFAULT_SAMPLE_RATE, FRAME_SIZE_MAX,
    FRAME_SIZE_MIN,
};
use crate::detector::ListeningConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Audio contract with the WebRTC media layer
    #[serde(default)]
    pub audio: AudioConfig,
    /// Per-session limits and pacing
    #[serde(default)]
    pub session: SessionConfig,
    /// Utterance detection thresholds
    #[serde(default)]
    pub listening: ListeningConfig,
    /// External service endpoints, models and timeouts
    #[serde(default)]
    pub services: ServicesConfig,
}

/// Sample format, layout, rate and outbound frame size. These values
/// must match across the detector, player and utility helpers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_format")]
    pub format: SampleFormat,
    #[serde(default = "default_layout")]
    pub layout: ChannelLayout,
    /// Outbound frame size in samples per channel.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_format() -> SampleFormat {
    SampleFormat::S16
}

fn default_layout() -> ChannelLayout {
    ChannelLayout::Stereo
}

fn default_frame_size() -> usize {
    DEFAULT_FRAME_SIZE
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            format: default_format(),
            layout: default_layout(),
            frame_size: default_frame_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Per-session turn cap. 0 means unlimited.
    #[serde(default = "default_max_loops")]
    pub max_loops: u64,
    /// Seconds to wait for the signalling data channel after the peer
    /// connection reports connected.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: f64,
    /// Consecutive start-of-speech timeouts before the session ends.
    #[serde(default = "default_start_timeout_max_count")]
    pub start_timeout_max_count: u32,
    /// Token budget for one assistant reply.
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
    /// Completion stop sequences.
    #[serde(default = "default_stop_tokens")]
    pub stop_tokens: Vec<String>,
}

fn default_max_loops() -> u64 {
    30
}

fn default_connection_timeout() -> f64 {
    5.0
}

fn default_start_timeout_max_count() -> u32 {
    2
}

fn default_max_response_tokens() -> u32 {
    64
}

fn default_stop_tokens() -> Vec<String> {
    vec!["user:".to_string()]
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            connection_timeout_secs: default_connection_timeout(),
            start_timeout_max_count: default_start_timeout_max_count(),
            max_response_tokens: default_max_response_tokens(),
            stop_tokens: default_stop_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// OpenAI-compatible API base for transcription and completion.
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    /// Text-to-speech API base for synthesis and the voice directory.
    #[serde(default = "default_tts_base_url")]
    pub tts_base_url: String,
    /// Translation API base for language detection.
    #[serde(default = "default_translate_base_url")]
    pub translate_base_url: String,
    #[serde(default = "default_transcription_model")]
    pub transcription_model: String,
    /// Conversational model id; its class (chat vs. completion) decides
    /// the payload shape.
    #[serde(default = "default_completion_model")]
    pub completion_model: String,
    #[serde(default = "default_stt_timeout")]
    pub stt_timeout_secs: f64,
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: f64,
    #[serde(default = "default_tts_timeout")]
    pub tts_timeout_secs: f64,
    #[serde(default = "default_voice_timeout")]
    pub voice_timeout_secs: f64,
    #[serde(default = "default_lang_timeout")]
    pub lang_timeout_secs: f64,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_tts_base_url() -> String {
    "https://texttospeech.googleapis.com/v1".to_string()
}

fn default_translate_base_url() -> String {
    "https://translation.googleapis.com/language/translate/v2".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_completion_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_stt_timeout() -> f64 {
    10.0
}

fn default_llm_timeout() -> f64 {
    30.0
}

fn default_tts_timeout() -> f64 {
    5.0
}

fn default_voice_timeout() -> f64 {
    5.0
}

fn default_lang_timeout() -> f64 {
    5.0
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            openai_base_url: default_openai_base_url(),
            tts_base_url: default_tts_base_url(),
            translate_base_url: default_translate_base_url(),
            transcription_model: default_transcription_model(),
            completion_model: default_completion_model(),
            stt_timeout_secs: default_stt_timeout(),
            llm_timeout_secs: default_llm_timeout(),
            tts_timeout_secs: default_tts_timeout(),
            voice_timeout_secs: default_voice_timeout(),
            lang_timeout_secs: default_lang_timeout(),
        }
    }
}

impl Config {
    /// Load from file (creating defaults on first run), then apply the
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        let mut config = if config_path.exists() {
            let contents =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            toml::from_str(&contents).context("Failed to parse config file")?
        } else {
            let config = Config::default();
            config.save()?;
            config
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent().context("Config path has no parent")?;

        std::fs::create_dir_all(parent).context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Apply `MOSHI*` environment overrides. The lookup is injected so
    /// tests do not mutate the process environment.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = get("MOSHISAMPLERATE") {
            self.audio.sample_rate = v
                .parse()
                .with_context(|| format!("MOSHISAMPLERATE not a number: {v}"))?;
        }
        if let Some(v) = get("MOSHIAUDIOFORMAT") {
            self.audio.format = SampleFormat::parse(&v)
                .with_context(|| format!("MOSHIAUDIOFORMAT not recognised: {v}"))?;
        }
        if let Some(v) = get("MOSHIAUDIOLAYOUT") {
            self.audio.layout = ChannelLayout::parse(&v)
                .with_context(|| format!("MOSHIAUDIOLAYOUT not recognised: {v}"))?;
        }
        if let Some(v) = get("MOSHIFRAMESIZE") {
            self.audio.frame_size = v
                .parse()
                .with_context(|| format!("MOSHIFRAMESIZE not a number: {v}"))?;
        }
        if let Some(v) = get("MOSHIMAXLOOPS") {
            self.session.max_loops = v
                .parse()
                .with_context(|| format!("MOSHIMAXLOOPS not a number: {v}"))?;
        }
        if let Some(v) = get("MOSHICONNECTIONTIMEOUT") {
            self.session.connection_timeout_secs = v
                .parse()
                .with_context(|| format!("MOSHICONNECTIONTIMEOUT not a number: {v}"))?;
        }
        if let Some(v) = get("MOSHIMAXTOKENS") {
            self.session.max_response_tokens = v
                .parse()
                .with_context(|| format!("MOSHIMAXTOKENS not a number: {v}"))?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(FRAME_SIZE_MIN..=FRAME_SIZE_MAX).contains(&self.audio.frame_size) {
            bail!(
                "frame size {} out of bounds {}..{}",
                self.audio.frame_size,
                FRAME_SIZE_MIN,
                FRAME_SIZE_MAX
            );
        }
        if self.audio.sample_rate == 0 {
            bail!("sample rate must be positive");
        }
        Ok(())
    }
}

/// Get the configuration file path.
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("io", "kaiwa", "kaiwa")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path (transcript storage).
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("io", "kaiwa", "kaiwa")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string.
pub fn default_config_toml() -> String {
    toml::to_string_pretty(&Config::default()).unwrap_or_else(|_| "# defaults\n".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_the_media_contract() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.format, SampleFormat::S16);
        assert_eq!(config.audio.layout, ChannelLayout::Stereo);
        assert_eq!(config.audio.frame_size, 960);
        assert_eq!(config.session.max_loops, 30);
        assert_eq!(config.session.max_response_tokens, 64);
        assert_eq!(config.session.stop_tokens, vec!["user:"]);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("MOSHISAMPLERATE", "44100"),
            ("MOSHIAUDIOLAYOUT", "mono"),
            ("MOSHIFRAMESIZE", "1920"),
            ("MOSHIMAXLOOPS", "2"),
            ("MOSHICONNECTIONTIMEOUT", "1.5"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.audio.sample_rate, 44_100);
        assert_eq!(config.audio.layout, ChannelLayout::Mono);
        assert_eq!(config.audio.frame_size, 1920);
        assert_eq!(config.session.max_loops, 2);
        assert!((config.session.connection_timeout_secs - 1.5).abs() < 1e-9);
    }

    #[test]
    fn frame_size_bounds_enforced() {
        let mut config = Config::default();
        config.audio.frame_size = 64;
        assert!(config.validate().is_err());
        config.audio.frame_size = 8192;
        assert!(config.validate().is_err());
        config.audio.frame_size = 128;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "MOSHIFRAMESIZE").then(|| "huge".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("MOSHIFRAMESIZE"));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.audio.frame_size, config.audio.frame_size);
        assert_eq!(back.services.completion_model, config.services.completion_model);
    }
}
