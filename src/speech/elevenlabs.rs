//! ElevenLabs speech adapters.
//!
//! ## Endpoints:
//! - `POST {api_base}/speech-to-text`: multipart upload, language auto-detected
//! - `POST {api_base}/text-to-speech/{voice_id}`: JSON in, MP3 bytes out
//!
//! Both authenticate with the `xi-api-key` header.

use super::stt::is_format_rejection;
use super::{SpeechInput, SpeechToText, SynthesizedAudio, TextToSpeech, TranscriptionResult, VoiceSelection};
use crate::audio::AudioFormat;
use crate::config::ElevenLabsConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::pool::truncate;
use crate::http::status_error;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "xi-api-key";

#[derive(Debug, Deserialize, Default)]
struct TranscriptResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language_code: Option<String>,
    #[serde(default)]
    language_probability: Option<f32>,
    #[serde(default)]
    words: Vec<TranscriptWord>,
}

#[derive(Debug, Deserialize)]
struct TranscriptWord {
    #[serde(default)]
    end: Option<f64>,
}

/// Upload file name and MIME type for an input.
fn upload_for(input: &SpeechInput<'_>) -> PipelineResult<(&'static str, &'static str)> {
    if input.normalized {
        return Ok(("audio.wav", "audio/wav"));
    }
    match input.format {
        AudioFormat::Wav => Ok(("audio.wav", "audio/wav")),
        AudioFormat::OggOpus => Ok(("audio.ogg", "audio/ogg")),
        AudioFormat::Mp3 => Ok(("audio.mp3", "audio/mpeg")),
        AudioFormat::Mp4 => Ok(("audio.m4a", "audio/mp4")),
        AudioFormat::Webm => Ok(("audio.webm", "audio/webm")),
        AudioFormat::Amr => Ok(("audio.amr", "audio/amr")),
        AudioFormat::AmrWb => Ok(("audio.amr", "audio/amr-wb")),
        other => Err(PipelineError::UnsupportedFormat(format!(
            "no upload type for raw {} audio",
            other.as_str()
        ))),
    }
}

fn into_result(response: TranscriptResponse) -> TranscriptionResult {
    let spoken = response
        .words
        .iter()
        .filter_map(|w| w.end)
        .filter(|end| end.is_finite() && *end >= 0.0)
        .fold(0.0_f64, f64::max);

    TranscriptionResult {
        text: response.text.trim().to_string(),
        detected_language: response.language_code.filter(|code| !code.is_empty()),
        confidence: response.language_probability.unwrap_or_default(),
        billed_duration: Duration::from_secs_f64(spoken),
    }
}

pub struct ElevenLabsSpeechToText {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSpeechToText {
    pub fn new(client: reqwest::Client, config: ElevenLabsConfig) -> Self {
        Self { client, config }
    }

    fn form(&self, input: &SpeechInput<'_>) -> PipelineResult<Form> {
        let (file_name, mime) = upload_for(input)?;
        let file = Part::bytes(input.bytes.to_vec())
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        Ok(Form::new()
            .part("file", file)
            .text("model_id", self.config.stt_model.clone())
            .text("tag_audio_events", "true")
            .text("diarize", "false"))
    }
}

#[async_trait]
impl SpeechToText for ElevenLabsSpeechToText {
    async fn transcribe(&self, input: SpeechInput<'_>) -> PipelineResult<TranscriptionResult> {
        let form = self.form(&input)?;
        debug!(
            format = input.format.as_str(),
            normalized = input.normalized,
            bytes = input.bytes.len(),
            "Uploading audio for transcription"
        );

        let response = self
            .client
            .post(format!("{}/speech-to-text", self.config.api_base.trim_end_matches('/')))
            .header(API_KEY_HEADER, &self.config.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let refused_audio = matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY)
                && (is_format_rejection(&text) || text.contains("invalid_file"));
            if refused_audio {
                return Err(PipelineError::UnsupportedFormat(format!(
                    "transcriber refused {}: {}",
                    input.format.as_str(),
                    truncate(&text, 200)
                )));
            }
            return Err(status_error("stt", status, &text));
        }

        let result = into_result(response.json().await?);
        info!(
            chars = result.text.chars().count(),
            language = result.detected_language.as_deref().unwrap_or("unknown"),
            confidence = result.confidence,
            "Transcription finished"
        );
        Ok(result)
    }
}

/// Multilingual synthesis with one configured voice.
///
/// The voice speaks whatever language the text is in, so the selection
/// computed from the voice table is only logged.
pub struct ElevenLabsTextToSpeech {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsTextToSpeech {
    pub fn new(client: reqwest::Client, config: ElevenLabsConfig) -> Self {
        Self { client, config }
    }

    fn request_body(&self, text: &str) -> Value {
        json!({
            "text": text,
            "model_id": self.config.tts_model,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
                "style": self.config.style,
                "use_speaker_boost": self.config.use_speaker_boost,
            },
        })
    }
}

#[async_trait]
impl TextToSpeech for ElevenLabsTextToSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceSelection) -> PipelineResult<SynthesizedAudio> {
        if self.config.voice_id.trim().is_empty() {
            return Err(PipelineError::Config("elevenlabs.voice_id is not set".to_string()));
        }
        debug!(
            voice_id = %self.config.voice_id,
            locale = %voice.locale,
            chars = text.chars().count(),
            "Requesting synthesis"
        );

        let url = format!(
            "{}/text-to-speech/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.voice_id
        );
        let response = self
            .client
            .post(url)
            .header(ACCEPT, "audio/mpeg")
            .header(API_KEY_HEADER, &self.config.api_key)
            .json(&self.request_body(text))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("tts", status, &body));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("audio/"))
            .unwrap_or("audio/mpeg")
            .to_string();
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(PipelineError::Backend("synthesis returned no audio".to_string()));
        }
        Ok(SynthesizedAudio {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
