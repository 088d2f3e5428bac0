//! # Audio Module
//!
//! Converts inbound voice notes into the normalized format used for speech
//! recognition.
//!
//! ## Normalized Audio:
//! - **Sample Rate**: 16kHz (16,000 Hz)
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono (1 channel)
//! - **Container**: WAV, so the recognizer can read the header
//!
//! ## Components:
//! - **processor**: pure PCM math (decode, downmix, resample, encode)
//! - **transcoder**: the `Transcoder` stage contract and its implementations

pub mod processor;
pub mod transcoder;

pub use transcoder::{ChainTranscoder, FfmpegTranscoder, NativeTranscoder, NormalizedAudio, Transcoder};

/// Audio encodings the pipeline knows how to route.
///
/// Derived from the content type the messaging gateway declares for the
/// attachment; parameters such as `; codecs=opus` are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    /// Raw big-endian 16-bit PCM (RFC 2586 `audio/L16`)
    L16,
    OggOpus,
    Amr,
    AmrWb,
    Mp3,
    Mp4,
    Webm,
    Unknown,
}

impl AudioFormat {
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => AudioFormat::Wav,
            "audio/l16" => AudioFormat::L16,
            "audio/ogg" | "audio/opus" | "application/ogg" => AudioFormat::OggOpus,
            "audio/amr" => AudioFormat::Amr,
            "audio/amr-wb" => AudioFormat::AmrWb,
            "audio/mpeg" | "audio/mp3" => AudioFormat::Mp3,
            "audio/mp4" | "audio/aac" | "audio/x-m4a" | "audio/m4a" => AudioFormat::Mp4,
            "audio/webm" => AudioFormat::Webm,
            _ => AudioFormat::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::L16 => "l16",
            AudioFormat::OggOpus => "ogg_opus",
            AudioFormat::Amr => "amr",
            AudioFormat::AmrWb => "amr_wb",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Mp4 => "mp4",
            AudioFormat::Webm => "webm",
            AudioFormat::Unknown => "unknown",
        }
    }
}
