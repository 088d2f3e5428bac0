//! # Voice Bridge - Main Application Entry Point
//!
//! HTTP service that connects a WhatsApp number to a conversational agent.
//! Text messages get a text reply; voice notes are transcribed, answered, and
//! answered again as a voice note.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every external call is asynchronous, so one worker can
//!   wait on many slow backends at once
//! - **trait objects**: each pipeline stage is an `Arc<dyn Trait>`, wired
//!   together once here and swapped for fakes in tests
//! - **Result<T, E>**: startup errors bubble up through `anyhow`
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **http**: shared outbound client pool and the retry policy
//! - **audio**: normalization of inbound voice notes
//! - **speech**: speech-to-text and text-to-speech adapters
//! - **agent**: token exchange, agent client, sessions, turn execution
//! - **cache**: response and audio caches
//! - **messaging**: webhook parsing, media download, outbound delivery
//! - **pipeline**: the turn orchestrator and its telemetry
//! - **state / health / middleware / handlers**: the HTTP surface

mod agent;
mod audio;
mod cache;
mod config;
mod error;
mod handlers;
mod health;
mod http;
mod messaging;
mod middleware;
mod pipeline;
mod speech;
mod state;

use actix_web::{web, App, HttpServer};
use agent::{AgentforceClient, ClientCredentials, TokenCache};
use anyhow::Result;
use audio::{ChainTranscoder, FfmpegTranscoder, NativeTranscoder};
use config::{AppConfig, SpeechProvider};
use messaging::{GatewayMediaFetcher, TwilioGateway};
use pipeline::{Orchestrator, PipelineDeps, PipelineTelemetry};
use speech::{
    ElevenLabsSpeechToText, ElevenLabsTextToSpeech, GoogleSpeechToText, GoogleTextToSpeech, SpeechToText, TextToSpeech,
};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal, set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the pipeline**: one HTTP client shared by every adapter
/// 4. **Starts the cache/session sweeper**
/// 5. **Configures the HTTP server** with middleware and routes
/// 6. **Handles graceful shutdown** on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    debug!(config = ?config.redacted(), "Effective configuration");
    if config.agent.agent_id.is_empty() || config.messaging.account_sid.is_empty() {
        warn!("Agent or messaging credentials are not configured; turns will fail until they are set");
    }

    let pipeline = Arc::new(build_pipeline(&config)?);
    spawn_sweeper(pipeline.clone(), Duration::from_secs(config.cache.sweep_interval_secs));

    let app_state = AppState::new(config.clone(), pipeline);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);
    info!("Audio replies served from {}/audio/{{key}}", config.server.public_base_url);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            .route("/webhook", web::post().to(handlers::receive_message))
            .route("/webhook", web::get().to(handlers::verify))
            .route("/", web::post().to(handlers::receive_message))
            .route("/audio/{key}", web::get().to(handlers::get_audio))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Wire the production adapters into an orchestrator.
///
/// Every adapter gets a clone of the same `reqwest::Client`, so they share
/// one connection pool.
fn build_pipeline(config: &AppConfig) -> Result<Orchestrator> {
    let client = http::build_client(&config.http)?;

    let ffmpeg = FfmpegTranscoder::new(
        config.pipeline.ffmpeg_path.clone(),
        Duration::from_millis(config.pipeline.transcode_timeout_ms),
    );
    let tokens = TokenCache::new(
        Arc::new(ClientCredentials::new(client.clone(), &config.agent)),
        Duration::from_secs(config.agent.token_refresh_margin_secs),
    );

    let (stt, tts): (Arc<dyn SpeechToText>, Arc<dyn TextToSpeech>) = match config.speech.provider {
        SpeechProvider::Google => (
            Arc::new(GoogleSpeechToText::new(client.clone(), config.speech.clone())),
            Arc::new(GoogleTextToSpeech::new(
                client.clone(),
                config.voice.clone(),
                config.voice_api_key(),
            )),
        ),
        SpeechProvider::ElevenLabs => {
            if config.elevenlabs.api_key.is_empty() || config.elevenlabs.voice_id.is_empty() {
                warn!("ElevenLabs API key or voice id is not configured; speech stages will fail until they are set");
            }
            (
                Arc::new(ElevenLabsSpeechToText::new(client.clone(), config.elevenlabs.clone())),
                Arc::new(ElevenLabsTextToSpeech::new(client.clone(), config.elevenlabs.clone())),
            )
        }
    };
    info!(provider = ?config.speech.provider, "Speech provider selected");

    let deps = PipelineDeps {
        fetcher: Arc::new(GatewayMediaFetcher::new(client.clone(), &config.messaging)),
        transcoder: Arc::new(ChainTranscoder::new(NativeTranscoder::default(), Arc::new(ffmpeg))),
        stt,
        tts,
        gateway: Arc::new(TwilioGateway::new(client.clone(), &config.messaging)),
        agent: Arc::new(AgentforceClient::new(client, Arc::new(tokens), &config.agent)),
    };

    Ok(Orchestrator::new(config, deps, Arc::new(PipelineTelemetry::new())))
}

/// Periodically drop expired cache entries and idle sessions. Lazy expiry
/// hides them from readers already; the sweep bounds memory.
fn spawn_sweeper(pipeline: Arc<Orchestrator>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let responses = pipeline.responses().sweep();
            let audio = pipeline.audio_cache().sweep();
            let sessions = pipeline.sessions().sweep_expired();
            if responses + audio + sessions > 0 {
                debug!(responses, audio, sessions, "Swept expired entries");
            }
        }
    });
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. "voice_bridge=trace")
/// - If not set, defaults to "voice_bridge=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and set the global shutdown flag.
///
/// If a handler cannot be installed the server keeps running and relies on
/// actix's own signal handling.
fn setup_signal_handlers() {
    tokio::spawn(async {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set, polling every 100ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
