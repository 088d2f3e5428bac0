//! Speech-to-text over the Google `v1/speech:recognize` REST API.

use super::{SpeechInput, SpeechToText, TranscriptionResult};
use crate::audio::AudioFormat;
use crate::config::SpeechConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::status_error;
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognitionResult>,
    #[serde(default)]
    total_billed_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecognitionResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
    #[serde(default)]
    language_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    confidence: f32,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct RecognitionConfig<'a> {
    encoding: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sample_rate_hertz: Option<u32>,
    language_code: &'a str,
    alternative_language_codes: &'a [String],
    max_alternatives: u32,
    enable_automatic_punctuation: bool,
}

/// Encoding and sample rate declared for an input.
///
/// Normalized audio is always LINEAR16 at 16 kHz. Raw fallbacks are
/// declared at the fixed rates WhatsApp and the carriers use; a raw WAV
/// leaves the rate to its header.
fn encoding_for(input: &SpeechInput<'_>) -> PipelineResult<(&'static str, Option<u32>)> {
    if input.normalized {
        return Ok(("LINEAR16", Some(16_000)));
    }
    match input.format {
        AudioFormat::Wav => Ok(("LINEAR16", None)),
        AudioFormat::OggOpus => Ok(("OGG_OPUS", Some(48_000))),
        AudioFormat::Webm => Ok(("WEBM_OPUS", Some(48_000))),
        AudioFormat::Amr => Ok(("AMR", Some(8_000))),
        AudioFormat::AmrWb => Ok(("AMR_WB", Some(16_000))),
        other => Err(PipelineError::UnsupportedFormat(format!(
            "no recognizer encoding for raw {} audio",
            other.as_str()
        ))),
    }
}

/// Parse durations like `"2.500s"`.
fn parse_billed_time(value: &str) -> Duration {
    value
        .trim()
        .strip_suffix('s')
        .and_then(|secs| secs.parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or_default()
}

/// A 400 naming the encoding or rate means the backend refused the audio
/// itself, as opposed to the request.
pub(super) fn is_format_rejection(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    ["encoding", "sample rate", "sample_rate", "samplerate", "bad header", "audio format"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn into_result(response: RecognizeResponse) -> TranscriptionResult {
    let text = response
        .results
        .iter()
        .filter_map(|r| r.alternatives.first())
        .map(|alt| alt.transcript.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let first = response.results.first();
    TranscriptionResult {
        text,
        detected_language: first.and_then(|r| r.language_code.clone()),
        confidence: first
            .and_then(|r| r.alternatives.first())
            .map(|alt| alt.confidence)
            .unwrap_or_default(),
        billed_duration: response
            .total_billed_time
            .as_deref()
            .map(parse_billed_time)
            .unwrap_or_default(),
    }
}

/// Google speech recognizer.
///
/// The primary language hint is a backend quirk, not only a preference:
/// with some primary codes the backend rejects or silently returns nothing
/// for OGG_OPUS audio. `en-US` as primary with Arabic variants as
/// alternatives is the combination known to accept every encoding; other
/// combinations should be re-validated before they are deployed.
pub struct GoogleSpeechToText {
    client: reqwest::Client,
    config: SpeechConfig,
}

impl GoogleSpeechToText {
    pub fn new(client: reqwest::Client, config: SpeechConfig) -> Self {
        Self { client, config }
    }

    fn request_config(&self, input: &SpeechInput<'_>) -> PipelineResult<RecognitionConfig<'_>> {
        let (encoding, sample_rate_hertz) = encoding_for(input)?;
        Ok(RecognitionConfig {
            encoding,
            sample_rate_hertz,
            language_code: &self.config.primary_language,
            alternative_language_codes: &self.config.alternative_languages,
            max_alternatives: self.config.max_alternatives,
            enable_automatic_punctuation: self.config.enable_punctuation,
        })
    }
}

#[async_trait]
impl SpeechToText for GoogleSpeechToText {
    async fn transcribe(&self, input: SpeechInput<'_>) -> PipelineResult<TranscriptionResult> {
        let config = self.request_config(&input)?;
        let encoding = config.encoding;
        debug!(
            encoding,
            sample_rate = ?config.sample_rate_hertz,
            bytes = input.bytes.len(),
            "Submitting audio for recognition"
        );

        let body = json!({
            "config": config,
            "audio": { "content": base64::engine::general_purpose::STANDARD.encode(input.bytes) },
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            if status == StatusCode::BAD_REQUEST && is_format_rejection(&text) {
                return Err(PipelineError::UnsupportedFormat(format!(
                    "recognizer refused {}: {}",
                    encoding,
                    crate::http::pool::truncate(&text, 200)
                )));
            }
            return Err(status_error("stt", status, &text));
        }

        let parsed: RecognizeResponse = response.json().await?;
        let result = into_result(parsed);
        info!(
            chars = result.text.chars().count(),
            language = result.detected_language.as_deref().unwrap_or("unknown"),
            confidence = result.confidence,
            billed_ms = result.billed_duration.as_millis() as u64,
            "Recognition finished"
        );
        Ok(result)
    }
}
