//! # Speech Services
//!
//! Stage contracts for speech recognition and synthesis, plus the REST
//! adapters that implement them. `speech.provider` picks Google or
//! ElevenLabs for both stages.
//!
//! ## Components:
//! - **stt**: `SpeechToText` over Google `speech:recognize`
//! - **tts**: `TextToSpeech` over Google `text:synthesize`
//! - **elevenlabs**: both stages over the ElevenLabs API
//! - **language**: tag normalization and the voice lookup table

pub mod elevenlabs;
pub mod language;
pub mod stt;
pub mod tts;

pub use elevenlabs::{ElevenLabsSpeechToText, ElevenLabsTextToSpeech};
pub use language::{select_voice, VoiceSelection};
pub use stt::GoogleSpeechToText;
pub use tts::GoogleTextToSpeech;

use crate::audio::{AudioFormat, NormalizedAudio};
use crate::error::PipelineResult;
use async_trait::async_trait;
use std::time::Duration;

/// Outcome of one recognition request.
///
/// An empty `text` means the backend processed the audio and heard no
/// speech. That is a successful result, not an error.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TranscriptionResult {
    pub text: String,
    pub detected_language: Option<String>,
    pub confidence: f32,
    pub billed_duration: Duration,
}

impl TranscriptionResult {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Audio handed to the recognizer: either transcoder output or, on the
/// degraded path, the bytes exactly as downloaded.
#[derive(Debug, Clone, Copy)]
pub struct SpeechInput<'a> {
    pub bytes: &'a [u8],
    pub format: AudioFormat,
    pub normalized: bool,
}

impl<'a> SpeechInput<'a> {
    pub fn normalized(audio: &'a NormalizedAudio) -> Self {
        Self {
            bytes: &audio.wav,
            format: AudioFormat::Wav,
            normalized: true,
        }
    }

    pub fn raw(bytes: &'a [u8], content_type: &str) -> Self {
        Self {
            bytes,
            format: AudioFormat::from_content_type(content_type),
            normalized: false,
        }
    }
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, input: SpeechInput<'_>) -> PipelineResult<TranscriptionResult>;
}

/// Encoded speech returned by a synthesis backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceSelection) -> PipelineResult<SynthesizedAudio>;
}
