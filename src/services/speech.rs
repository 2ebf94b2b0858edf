//! Speech services: transcription, synthesis and the voice directory.
//!
//! Audio crosses these seams as 16-bit PCM WAV. The synthesizer asks
//! the API for LINEAR16 at the session sample rate so its output can go
//! straight to the player.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, trace};

use super::{Synthesizer, Transcriber, VoiceDirectory};
use crate::audio::{AudioFrame, ChannelLayout};
use crate::config::AudioConfig;
use crate::types::Voice;

/// Default gender filter for voice selection.
const VOICE_GENDER: &str = "FEMALE";
/// Voice model class filter; "Standard" voices are the cheap tier.
const VOICE_MODEL: &str = "Standard";

// ---------------------------------------------------------------------------
// WAV helpers
// ---------------------------------------------------------------------------

/// Encode a frame as 16-bit PCM WAV bytes.
pub fn encode_wav(frame: &AudioFrame) -> Vec<u8> {
    let num_channels = frame.layout().channels() as u16;
    let sample_rate = frame.rate();
    let bytes_per_sample: u16 = 2;
    let data_size = (frame.data().len() * 2) as u32;
    let file_size = 36 + data_size;

    let mut buf = Vec::with_capacity(44 + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&file_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt sub-chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&num_channels.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * num_channels as u32 * bytes_per_sample as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = num_channels * bytes_per_sample;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(bytes_per_sample * 8).to_le_bytes());

    // data sub-chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for &sample in frame.data() {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// Decode 16-bit PCM WAV bytes into a frame.
pub fn decode_wav(bytes: &[u8]) -> Result<AudioFrame> {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        bail!("not a RIFF/WAVE payload");
    }

    let mut channels: Option<u16> = None;
    let mut rate: Option<u32> = None;
    let mut data: Option<&[u8]> = None;

    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = u32::from_le_bytes(bytes[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body_end = (pos + 8 + size).min(bytes.len());
        let body = &bytes[pos + 8..body_end];
        match id {
            b"fmt " => {
                if body.len() < 16 {
                    bail!("fmt chunk too short");
                }
                let format = u16::from_le_bytes(body[0..2].try_into().unwrap());
                if format != 1 {
                    bail!("only PCM wav supported, got format {format}");
                }
                channels = Some(u16::from_le_bytes(body[2..4].try_into().unwrap()));
                rate = Some(u32::from_le_bytes(body[4..8].try_into().unwrap()));
                let bits = u16::from_le_bytes(body[14..16].try_into().unwrap());
                if bits != 16 {
                    bail!("only 16-bit wav supported, got {bits}");
                }
            }
            b"data" => data = Some(body),
            _ => trace!(chunk = %String::from_utf8_lossy(id), "skipping wav chunk"),
        }
        // Chunks are word-aligned.
        pos += 8 + size + (size & 1);
    }

    let channels = channels.context("wav missing fmt chunk")?;
    let rate = rate.context("wav missing sample rate")?;
    let data = data.context("wav missing data chunk")?;
    let layout = match channels {
        1 => ChannelLayout::Mono,
        2 => ChannelLayout::Stereo,
        n => bail!("unsupported channel count: {n}"),
    };

    let samples: Vec<i16> = data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(AudioFrame::from_samples(samples, layout, rate))
}

/// Adapt a frame to the target layout, duplicating or averaging
/// channels as needed.
pub fn convert_layout(frame: &AudioFrame, layout: ChannelLayout) -> AudioFrame {
    if frame.layout() == layout {
        return frame.clone();
    }
    let data = match (frame.layout(), layout) {
        (ChannelLayout::Mono, ChannelLayout::Stereo) => {
            let mut out = Vec::with_capacity(frame.data().len() * 2);
            for &sample in frame.data() {
                out.push(sample);
                out.push(sample);
            }
            out
        }
        (ChannelLayout::Stereo, ChannelLayout::Mono) => frame
            .data()
            .chunks_exact(2)
            .map(|lr| ((lr[0] as i32 + lr[1] as i32) / 2) as i16)
            .collect(),
        _ => unreachable!("handled by the equality check"),
    };
    AudioFrame::from_samples(data, layout, frame.rate())
}

// ---------------------------------------------------------------------------
// Whisper-style transcription
// ---------------------------------------------------------------------------

pub struct WhisperTranscriber {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: &AudioFrame, language: Option<&str>) -> Result<String> {
        let wav = encode_wav(audio);
        debug!(bytes = wav.len(), "sending audio for transcription");

        let file_part = multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = multipart::Form::new()
            .text("model", self.model.clone())
            .part("file", file_part);
        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .context("Failed to send transcription request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("transcription error ({status}): {body}");
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse transcription response")?;
        Ok(parsed["text"].as_str().unwrap_or("").to_string())
    }
}

// ---------------------------------------------------------------------------
// Cloud text-to-speech
// ---------------------------------------------------------------------------

pub struct CloudSynthesizer {
    client: Client,
    base_url: String,
    api_key: String,
    rate: u32,
    layout: ChannelLayout,
}

impl CloudSynthesizer {
    pub fn new(base_url: String, api_key: String, audio: &AudioConfig) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            rate: audio.sample_rate,
            layout: audio.layout,
        }
    }
}

#[async_trait]
impl Synthesizer for CloudSynthesizer {
    async fn synthesize(&self, text: &str, voice: &Voice) -> Result<AudioFrame> {
        let body = json!({
            "input": { "text": text },
            "voice": {
                "name": voice.name,
                "languageCode": voice.language_code,
                "ssmlGender": voice.gender,
            },
            "audioConfig": {
                "audioEncoding": "LINEAR16",
                "sampleRateHertz": self.rate,
            },
        });
        debug!(voice = %voice.name, chars = text.len(), "requesting speech synthesis");

        let response = self
            .client
            .post(format!("{}/text:synthesize", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("Failed to send synthesis request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("synthesis error ({status}): {body}");
        }

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SynthesisResponse {
            audio_content: String,
        }

        let parsed: SynthesisResponse = response
            .json()
            .await
            .context("Failed to parse synthesis response")?;
        let wav = BASE64
            .decode(parsed.audio_content)
            .context("synthesis payload is not valid base64")?;
        let frame = decode_wav(&wav)?;
        if frame.rate() != self.rate {
            bail!(
                "synthesis returned rate {}, expected {}",
                frame.rate(),
                self.rate
            );
        }
        Ok(convert_layout(&frame, self.layout))
    }
}

// ---------------------------------------------------------------------------
// Voice directory
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct VoiceInfo {
    pub name: String,
    #[serde(rename = "ssmlGender")]
    pub gender: String,
    #[serde(rename = "languageCodes")]
    pub language_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct VoicesResponse {
    #[serde(default)]
    pub voices: Vec<VoiceInfo>,
}

/// Just picks the first match for the configured gender and model
/// class.
pub fn pick_voice(voices: &[VoiceInfo], language: &str) -> Option<Voice> {
    voices
        .iter()
        .find(|v| v.name.contains(VOICE_MODEL) && v.gender == VOICE_GENDER)
        .map(|v| Voice {
            name: v.name.clone(),
            language_code: v
                .language_codes
                .first()
                .cloned()
                .unwrap_or_else(|| language.to_string()),
            gender: v.gender.clone(),
        })
}

pub struct CloudVoiceDirectory {
    client: Client,
    base_url: String,
    api_key: String,
}

impl CloudVoiceDirectory {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl VoiceDirectory for CloudVoiceDirectory {
    async fn voice_for(&self, language: &str) -> Result<Voice> {
        let response = self
            .client
            .get(format!("{}/voices", self.base_url))
            .query(&[("key", self.api_key.as_str()), ("languageCode", language)])
            .send()
            .await
            .context("Failed to list voices")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("voice listing error ({status}): {body}");
        }

        let parsed: VoicesResponse = response
            .json()
            .await
            .context("Failed to parse voice listing")?;
        trace!(count = parsed.voices.len(), language, "voices available");
        pick_voice(&parsed.voices, language).with_context(|| {
            format!("no {VOICE_GENDER} {VOICE_MODEL} voice found for language {language}")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_round_trip() {
        let frame = AudioFrame::from_samples(
            vec![0, 1000, -1000, 32767, -32768, 7, 8, 9],
            ChannelLayout::Stereo,
            48_000,
        );
        let wav = encode_wav(&frame);
        let back = decode_wav(&wav).unwrap();
        assert_eq!(back.rate(), 48_000);
        assert_eq!(back.layout(), ChannelLayout::Stereo);
        assert_eq!(back.data(), frame.data());
    }

    #[test]
    fn silence_round_trip_is_zero_bytes() {
        let frame = AudioFrame::silent(960, ChannelLayout::Stereo, 48_000);
        let wav = encode_wav(&frame);
        // 960 samples x 2 channels x 2 bytes of zero payload.
        assert_eq!(wav.len(), 44 + 960 * 2 * 2);
        assert!(wav[44..].iter().all(|&b| b == 0));
        let back = decode_wav(&wav).unwrap();
        assert_eq!(back.samples(), 960);
        assert_eq!(back.energy(), 0.0);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_wav(b"not audio at all").is_err());
        assert!(decode_wav(&[]).is_err());
    }

    #[test]
    fn mono_upmixes_to_stereo() {
        let mono = AudioFrame::from_samples(vec![1, 2, 3], ChannelLayout::Mono, 48_000);
        let stereo = convert_layout(&mono, ChannelLayout::Stereo);
        assert_eq!(stereo.data(), &[1, 1, 2, 2, 3, 3]);
        assert_eq!(stereo.samples(), 3);
    }

    #[test]
    fn stereo_downmixes_to_mono() {
        let stereo =
            AudioFrame::from_samples(vec![10, 20, -10, -20], ChannelLayout::Stereo, 48_000);
        let mono = convert_layout(&stereo, ChannelLayout::Mono);
        assert_eq!(mono.data(), &[15, -15]);
    }

    #[test]
    fn picks_the_first_standard_female_voice() {
        let listing: VoicesResponse = serde_json::from_value(serde_json::json!({
            "voices": [
                { "name": "fr-FR-Wavenet-A", "ssmlGender": "FEMALE", "languageCodes": ["fr-FR"] },
                { "name": "fr-FR-Standard-B", "ssmlGender": "MALE", "languageCodes": ["fr-FR"] },
                { "name": "fr-FR-Standard-C", "ssmlGender": "FEMALE", "languageCodes": ["fr-FR"] },
            ]
        }))
        .unwrap();
        let voice = pick_voice(&listing.voices, "fr").unwrap();
        assert_eq!(voice.name, "fr-FR-Standard-C");
        assert_eq!(voice.language_code, "fr-FR");
    }

    #[test]
    fn no_match_yields_none() {
        let listing: VoicesResponse = serde_json::from_value(serde_json::json!({
            "voices": [
                { "name": "de-DE-Wavenet-A", "ssmlGender": "FEMALE", "languageCodes": ["de-DE"] },
            ]
        }))
        .unwrap();
        assert!(pick_voice(&listing.voices, "de").is_none());
    }
}
