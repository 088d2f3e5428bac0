//! Text-to-speech over the Google `v1/text:synthesize` REST API.

use super::{SynthesizedAudio, TextToSpeech, VoiceSelection};
use crate::config::VoiceConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::status_error;
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    #[serde(default)]
    audio_content: Option<String>,
}

/// MIME type for a configured `audioEncoding`.
pub fn content_type_for(encoding: &str) -> &'static str {
    match encoding.to_ascii_uppercase().as_str() {
        "MP3" => "audio/mpeg",
        "OGG_OPUS" => "audio/ogg",
        "LINEAR16" => "audio/wav",
        "MULAW" | "ALAW" => "audio/basic",
        _ => "application/octet-stream",
    }
}

pub struct GoogleTextToSpeech {
    client: reqwest::Client,
    config: VoiceConfig,
    api_key: String,
}

impl GoogleTextToSpeech {
    pub fn new(client: reqwest::Client, config: VoiceConfig, api_key: impl Into<String>) -> Self {
        Self {
            client,
            config,
            api_key: api_key.into(),
        }
    }

    fn request_body(&self, text: &str, voice: &VoiceSelection) -> Value {
        let mut voice_params = json!({
            "languageCode": voice.locale,
            "ssmlGender": self.config.ssml_gender,
        });
        if let Some(name) = &voice.name {
            voice_params["name"] = json!(name);
        }

        json!({
            "input": { "text": text },
            "voice": voice_params,
            "audioConfig": {
                "audioEncoding": self.config.audio_encoding,
                "speakingRate": self.config.speaking_rate,
                "pitch": self.config.pitch,
                "volumeGainDb": 0.0,
            },
        })
    }
}

fn decode_audio(response: SynthesizeResponse) -> PipelineResult<Vec<u8>> {
    let encoded = response
        .audio_content
        .filter(|content| !content.is_empty())
        .ok_or_else(|| PipelineError::Backend("synthesis response has no audioContent".to_string()))?;

    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| PipelineError::Backend(format!("synthesis audio is not valid base64: {}", e)))
}

#[async_trait]
impl TextToSpeech for GoogleTextToSpeech {
    async fn synthesize(&self, text: &str, voice: &VoiceSelection) -> PipelineResult<SynthesizedAudio> {
        debug!(
            locale = %voice.locale,
            voice = voice.name.as_deref().unwrap_or("default"),
            chars = text.chars().count(),
            "Requesting synthesis"
        );

        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&self.request_body(text, voice))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("tts", status, &body));
        }

        let bytes = decode_audio(response.json().await?)?;
        Ok(SynthesizedAudio {
            bytes,
            content_type: content_type_for(&self.config.audio_encoding).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tts() -> GoogleTextToSpeech {
        let config = crate::config::AppConfig::default();
        GoogleTextToSpeech::new(reqwest::Client::new(), config.voice, "key")
    }

    #[test]
    fn test_request_body_carries_voice_and_quality() {
        let voice = VoiceSelection {
            locale: "ar-EG".to_string(),
            name: Some("ar-XA-Standard-A".to_string()),
        };
        let body = tts().request_body("مرحبا", &voice);
        assert_eq!(body["input"]["text"], "مرحبا");
        assert_eq!(body["voice"]["languageCode"], "ar-EG");
        assert_eq!(body["voice"]["name"], "ar-XA-Standard-A");
        assert_eq!(body["voice"]["ssmlGender"], "FEMALE");
        assert_eq!(body["audioConfig"]["audioEncoding"], "MP3");
        assert_eq!(body["audioConfig"]["speakingRate"], 1.0);
    }

    #[test]
    fn test_voice_name_is_optional() {
        let voice = VoiceSelection {
            locale: "sw-KE".to_string(),
            name: None,
        };
        let body = tts().request_body("habari", &voice);
        assert!(body["voice"].get("name").is_none());
    }

    #[test]
    fn test_decode_audio() {
        let ok = SynthesizeResponse {
            audio_content: Some("SUQz".to_string()),
        };
        assert_eq!(decode_audio(ok).unwrap(), b"ID3".to_vec());

        let missing = SynthesizeResponse { audio_content: None };
        assert!(matches!(decode_audio(missing), Err(PipelineError::Backend(_))));

        let garbage = SynthesizeResponse {
            audio_content: Some("***".to_string()),
        };
        assert!(matches!(decode_audio(garbage), Err(PipelineError::Backend(_))));
    }

    #[test]
    fn test_content_type_for_encoding() {
        assert_eq!(content_type_for("MP3"), "audio/mpeg");
        assert_eq!(content_type_for("ogg_opus"), "audio/ogg");
    }
}
