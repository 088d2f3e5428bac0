//! # Configuration Management
//!
//! This module loads the bridge configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix (`APP_AGENT__AGENT_ID=...`)
//! - Well-known platform variables (`PORT`, `TWILIO_AUTH_TOKEN`, ...) used by
//!   the deployment scripts
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Well-known platform variables
//! 2. `APP_` environment variables
//! 3. Configuration file (config.toml)
//! 4. Default values
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same struct is serialized into the defaults layer and
//!   deserialized back out of the merged result
//! - **Nested structs**: one struct per external collaborator keeps each
//!   section small and easy to validate

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the webhook listener binds and how it is reached publicly
/// - `http`: shared outbound connection pool
/// - `messaging`: outbound messaging gateway credentials
/// - `agent`: conversational-agent backend and its token exchange
/// - `speech`: speech-to-text backend
/// - `voice`: text-to-speech backend and voice quality knobs
/// - `cache`: response/audio cache lifetimes
/// - `pipeline`: per-stage timeouts, retry bounds and user-facing phrases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub messaging: MessagingConfig,
    pub agent: AgentConfig,
    pub speech: SpeechConfig,
    pub voice: VoiceConfig,
    pub elevenlabs: ElevenLabsConfig,
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address to bind (use "0.0.0.0" on a PaaS)
/// - `port`: TCP port to listen on
/// - `public_base_url`: externally reachable URL of this service; the gateway
///   fetches synthesized audio from `{public_base_url}/audio/{key}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_base_url: String,
}

/// Outbound connection pool settings shared by every external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Idle connections kept per upstream host
    pub pool_max_idle_per_host: usize,
    /// How long an idle pooled connection is kept before closing (seconds)
    pub pool_idle_timeout_secs: u64,
    /// TCP/TLS connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

/// Messaging gateway (Twilio-style REST API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: String,
    /// Sender address, e.g. "whatsapp:+14155238886"
    pub from_address: String,
    /// Longest body the gateway accepts in a single message
    pub max_message_length: usize,
    /// Largest inbound attachment that is downloaded
    pub max_media_bytes: usize,
}

/// Conversational-agent backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub api_base: String,
    /// Org instance URL, used for the token exchange and sent on session creation
    pub instance_url: String,
    pub agent_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Idle time after which a session is considered expired (seconds)
    pub session_ttl_secs: u64,
    /// A cached token is refreshed this long before its reported expiry (seconds)
    pub token_refresh_margin_secs: u64,
}

/// Speech-to-text backend settings.
///
/// ## Language hints:
/// `primary_language` is not a preference about what users speak. The
/// recognition backend only accepts some raw codecs (OGG/Opus in particular)
/// when the primary hint is one it supports for that codec, so the primary
/// hint is chosen for codec acceptance and the languages users actually speak
/// go into `alternative_languages`. Re-validate this before pointing the
/// adapter at a different backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Which backend serves both recognition and synthesis
    pub provider: SpeechProvider,
    pub endpoint: String,
    pub api_key: String,
    pub primary_language: String,
    pub alternative_languages: Vec<String>,
    pub max_alternatives: u32,
    pub enable_punctuation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechProvider {
    Google,
    ElevenLabs,
}

/// Text-to-speech backend settings.
///
/// `speaking_rate`, `pitch` and `audio_encoding` trade latency against
/// fidelity; none of them affect correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub endpoint: String,
    /// Falls back to `speech.api_key` when empty
    pub api_key: String,
    /// Locale used for languages missing from the voice table
    pub default_locale: String,
    pub audio_encoding: String,
    pub speaking_rate: f32,
    pub pitch: f32,
    pub ssml_gender: String,
}

/// ElevenLabs speech settings, used when `speech.provider` is `elevenlabs`.
///
/// Recognition auto-detects the language. Synthesis uses one multilingual
/// voice for every language, so the voice table is not consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    pub api_base: String,
    pub api_key: String,
    pub voice_id: String,
    pub stt_model: String,
    pub tts_model: String,
    pub stability: f32,
    pub similarity_boost: f32,
    pub style: f32,
    pub use_speaker_boost: bool,
}

/// Cache lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub response_ttl_secs: u64,
    pub audio_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Timeout and retry bound for one external stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl StageConfig {
    fn new(timeout_ms: u64, max_attempts: u32, backoff_base_ms: u64) -> Self {
        Self {
            timeout_ms,
            max_attempts,
            backoff_base_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// User-facing phrases sent when the pipeline cannot produce a real reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackMessages {
    pub no_speech: String,
    pub generic_error: String,
    pub empty_reply: String,
    /// Reply to attachments that are neither text nor audio
    pub unsupported_media: String,
    /// Sent when every turn slot stays busy past the admission wait
    pub overloaded: String,
    pub acknowledgement_en: String,
    pub acknowledgement_ar: String,
    /// Sent after the text reply when a voice note follows
    pub voice_preparation_en: String,
    pub voice_preparation_ar: String,
}

/// Pipeline tuning.
///
/// ## Stage defaults:
/// - download: short, media URLs sometimes 404 for a moment after the webhook
/// - stt: short to medium
/// - agent: long, a single turn can take tens of seconds
/// - tts: medium
/// - delivery: short, one attempt since a resend can duplicate a message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_concurrent_turns: usize,
    pub send_acknowledgements: bool,
    pub send_voice_preparation: bool,
    pub ffmpeg_path: String,
    pub transcode_timeout_ms: u64,
    pub download: StageConfig,
    pub stt: StageConfig,
    pub agent: StageConfig,
    pub tts: StageConfig,
    pub delivery: StageConfig,
    pub fallback: FallbackMessages,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                public_base_url: "http://127.0.0.1:8080".to_string(),
            },
            http: HttpConfig {
                pool_max_idle_per_host: 20,
                pool_idle_timeout_secs: 90,
                connect_timeout_ms: 5_000,
            },
            messaging: MessagingConfig {
                api_base: "https://api.twilio.com/2010-04-01".to_string(),
                account_sid: String::new(),
                auth_token: String::new(),
                from_address: "whatsapp:+14155238886".to_string(),
                max_message_length: 1600,
                max_media_bytes: 16 * 1024 * 1024,
            },
            agent: AgentConfig {
                api_base: "https://api.salesforce.com/einstein/ai-agent/v1".to_string(),
                instance_url: String::new(),
                agent_id: String::new(),
                client_id: String::new(),
                client_secret: String::new(),
                session_ttl_secs: 30 * 60,
                token_refresh_margin_secs: 300,
            },
            speech: SpeechConfig {
                provider: SpeechProvider::Google,
                endpoint: "https://speech.googleapis.com/v1/speech:recognize".to_string(),
                api_key: String::new(),
                primary_language: "en-US".to_string(),
                alternative_languages: vec![
                    "ar-EG".to_string(),
                    "ar-SA".to_string(),
                    "en-GB".to_string(),
                ],
                max_alternatives: 3,
                enable_punctuation: true,
            },
            voice: VoiceConfig {
                endpoint: "https://texttospeech.googleapis.com/v1/text:synthesize".to_string(),
                api_key: String::new(),
                default_locale: "en-US".to_string(),
                audio_encoding: "MP3".to_string(),
                speaking_rate: 1.0,
                pitch: 0.0,
                ssml_gender: "FEMALE".to_string(),
            },
            elevenlabs: ElevenLabsConfig {
                api_base: "https://api.elevenlabs.io/v1".to_string(),
                api_key: String::new(),
                voice_id: String::new(),
                stt_model: "scribe_v1".to_string(),
                tts_model: "eleven_multilingual_v2".to_string(),
                stability: 0.35,
                similarity_boost: 0.6,
                style: 0.0,
                use_speaker_boost: false,
            },
            cache: CacheConfig {
                response_ttl_secs: 60 * 60,
                audio_ttl_secs: 30 * 60,
                sweep_interval_secs: 60,
            },
            pipeline: PipelineConfig {
                max_concurrent_turns: 16,
                send_acknowledgements: false,
                send_voice_preparation: false,
                ffmpeg_path: "ffmpeg".to_string(),
                transcode_timeout_ms: 10_000,
                download: StageConfig::new(10_000, 3, 500),
                stt: StageConfig::new(30_000, 2, 300),
                agent: StageConfig::new(120_000, 3, 500),
                tts: StageConfig::new(30_000, 2, 300),
                delivery: StageConfig::new(10_000, 1, 300),
                fallback: FallbackMessages {
                    no_speech: "I couldn't detect any speech in your voice message. Please try speaking louder, recording a longer message, or sending a text message instead.".to_string(),
                    generic_error: "Sorry, an error occurred. Please try again.".to_string(),
                    empty_reply: "I received your message but couldn't come up with a reply. Please try again.".to_string(),
                    unsupported_media: "I can only understand text and voice messages.".to_string(),
                    overloaded: "I'm handling a lot of messages right now. Please send yours again in a minute.".to_string(),
                    acknowledgement_en: "Give me just a second to find that information...".to_string(),
                    acknowledgement_ar: "إديني ثانية واحدة أجيبلك المعلومة دي".to_string(),
                    voice_preparation_en: "I am sending you a voice note.".to_string(),
                    voice_preparation_ar: "ثانية واحدة، بجهزلك فويس بالرد".to_string(),
                },
            },
        }
    }
}

/// Platform variables that override a config key when set.
///
/// These names predate the `APP_` convention and are what the deployment
/// scripts export, so they win over everything else.
const WELL_KNOWN_OVERRIDES: &[(&str, &str)] = &[
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("PUBLIC_BASE_URL", "server.public_base_url"),
    ("TWILIO_ACCOUNT_SID", "messaging.account_sid"),
    ("TWILIO_AUTH_TOKEN", "messaging.auth_token"),
    ("TWILIO_WHATSAPP_FROM", "messaging.from_address"),
    ("AGENTFORCE_AGENT_ID", "agent.agent_id"),
    ("SALESFORCE_CONSUMER_KEY", "agent.client_id"),
    ("SALESFORCE_CONSUMER_SECRET", "agent.client_secret"),
    ("SALESFORCE_INSTANCE_URL", "agent.instance_url"),
    ("GOOGLE_CLOUD_API_KEY", "speech.api_key"),
    ("ELEVENLABS_API_KEY", "elevenlabs.api_key"),
    ("ELEVENLABS_VOICE_ID", "elevenlabs.voice_id"),
];

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: override server port
    /// - `APP_PIPELINE__AGENT__TIMEOUT_MS=60000`: shorten the agent stage timeout
    /// - `APP_SPEECH__ALTERNATIVE_LANGUAGES=ar-EG,en-GB`: comma separated list
    /// - `PORT=3000`: special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("speech.alternative_languages"),
            );

        for (var, key) in WELL_KNOWN_OVERRIDES {
            if let Ok(value) = env::var(var) {
                settings = settings.set_override(*key, value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - the server can bind (port is not 0)
    /// - every bounded resource allows at least one unit
    /// - every stage makes at least one attempt with a non-zero timeout
    /// - the speech adapter has a primary language hint
    /// - the ElevenLabs voice settings are in range
    ///
    /// Credentials are not checked here: an empty credential surfaces as an
    /// `AuthFailure` on first use, which keeps local runs against fakes simple.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.pipeline.max_concurrent_turns == 0 {
            return Err(anyhow::anyhow!("Max concurrent turns must be greater than 0"));
        }

        if self.messaging.max_media_bytes == 0 {
            return Err(anyhow::anyhow!("Max media size must be greater than 0"));
        }

        if self.messaging.max_message_length < 100 {
            return Err(anyhow::anyhow!("Max message length must be at least 100 characters"));
        }

        if self.speech.primary_language.trim().is_empty() {
            return Err(anyhow::anyhow!("Speech primary language cannot be empty"));
        }

        let voice = &self.elevenlabs;
        for (name, value) in [
            ("stability", voice.stability),
            ("similarity_boost", voice.similarity_boost),
            ("style", voice.style),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("ElevenLabs {} must be between 0 and 1", name));
            }
        }

        if self.cache.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Cache sweep interval must be greater than 0"));
        }

        let stages = [
            ("download", &self.pipeline.download),
            ("stt", &self.pipeline.stt),
            ("agent", &self.pipeline.agent),
            ("tts", &self.pipeline.tts),
            ("delivery", &self.pipeline.delivery),
        ];
        for (name, stage) in stages {
            if stage.max_attempts == 0 {
                return Err(anyhow::anyhow!("Stage '{}' must allow at least one attempt", name));
            }
            if stage.timeout_ms == 0 {
                return Err(anyhow::anyhow!("Stage '{}' timeout cannot be 0", name));
            }
        }

        Ok(())
    }

    /// Copy of the configuration with every credential masked, for the
    /// config endpoint and startup logging.
    pub fn redacted(&self) -> AppConfig {
        let mut copy = self.clone();
        for secret in [
            &mut copy.messaging.auth_token,
            &mut copy.agent.client_secret,
            &mut copy.speech.api_key,
            &mut copy.voice.api_key,
            &mut copy.elevenlabs.api_key,
        ] {
            if !secret.is_empty() {
                *secret = "********".to_string();
            }
        }
        copy
    }

    /// The key the TTS adapter should use.
    pub fn voice_api_key(&self) -> &str {
        if self.voice.api_key.is_empty() {
            &self.speech.api_key
        } else {
            &self.voice.api_key
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.messaging.max_message_length, 1600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.agent.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.speech.primary_language = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stage_timeouts_differ_by_stage() {
        let config = AppConfig::default();
        assert!(config.pipeline.agent.timeout() > config.pipeline.tts.timeout());
        assert!(config.pipeline.download.timeout() < config.pipeline.agent.timeout());
    }

    #[test]
    fn test_redacted_masks_secrets_only() {
        let mut config = AppConfig::default();
        config.messaging.auth_token = "twilio-secret".to_string();
        config.agent.client_secret = "sf-secret".to_string();
        let redacted = config.redacted();
        assert_eq!(redacted.messaging.auth_token, "********");
        assert_eq!(redacted.agent.client_secret, "********");
        // Empty secrets stay empty so the config endpoint shows what is missing
        assert!(redacted.speech.api_key.is_empty());
        assert_eq!(redacted.server.port, config.server.port);
    }

    #[test]
    fn test_speech_provider_names() {
        assert_eq!(AppConfig::default().speech.provider, SpeechProvider::Google);
        let parsed: SpeechProvider = serde_json::from_str("\"elevenlabs\"").unwrap();
        assert_eq!(parsed, SpeechProvider::ElevenLabs);
        assert_eq!(serde_json::to_string(&SpeechProvider::Google).unwrap(), "\"google\"");
    }

    #[test]
    fn test_elevenlabs_defaults_and_ranges() {
        let mut config = AppConfig::default();
        assert_eq!(config.elevenlabs.stt_model, "scribe_v1");
        assert_eq!(config.elevenlabs.tts_model, "eleven_multilingual_v2");
        config.elevenlabs.api_key = "xi-secret".to_string();
        assert_eq!(config.redacted().elevenlabs.api_key, "********");

        config.elevenlabs.stability = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_voice_key_falls_back_to_speech_key() {
        let mut config = AppConfig::default();
        config.speech.api_key = "shared".to_string();
        assert_eq!(config.voice_api_key(), "shared");
        config.voice.api_key = "dedicated".to_string();
        assert_eq!(config.voice_api_key(), "dedicated");
    }
}
