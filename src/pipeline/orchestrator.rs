//! # Turn Orchestrator
//!
//! Runs one inbound message through the stages and decides what the user
//! receives.
//!
//! ## Voice turn:
//! 1. media download + transcode, joined with a session prewarm
//! 2. STT; an empty transcript ends the turn with the no-speech notice
//! 3. response cache lookup by normalized transcript
//! 4. on a miss, one agent turn and a cache insert
//! 5. reply text delivered (first observable result)
//! 6. spawned: audio cache lookup or synthesis, then audio delivery
//!
//! Text turns skip stages 1, 2, 3 and 6. A failure that exhausts its stage
//! becomes the generic error notice; stage 6 failures only reach the logs and
//! the telemetry error sink.

use super::telemetry::{stage, PipelineTelemetry};
use crate::agent::{AgentBackend, SessionManager, TurnExecutor};
use crate::audio::{NormalizedAudio, Transcoder};
use crate::cache::{AudioCache, CachedAudio, ResponseCache};
use crate::config::{AppConfig, FallbackMessages};
use crate::error::{PipelineError, PipelineResult};
use crate::http::RetryPolicy;
use crate::messaging::{chunk_message, mask_user_key, InboundMessage, MediaFetcher, MediaRef, MessagingGateway};
use crate::speech::language::{detect_script_language, is_arabic};
use crate::speech::{select_voice, SpeechInput, SpeechToText, TextToSpeech, TranscriptionResult, VoiceSelection};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// How long a webhook waits for a turn slot before the busy notice.
const ADMISSION_WAIT: Duration = Duration::from_secs(10);

/// The external collaborators of a turn.
#[derive(Clone)]
pub struct PipelineDeps {
    pub fetcher: Arc<dyn MediaFetcher>,
    pub transcoder: Arc<dyn Transcoder>,
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub gateway: Arc<dyn MessagingGateway>,
    pub agent: Arc<dyn AgentBackend>,
}

/// State of the turn being handled. Lives only inside one `handle` call.
#[derive(Debug, Clone)]
struct PendingTurn {
    user_key: String,
    /// Transcript or message body
    text: String,
    detected_language: Option<String>,
    started_at: Instant,
}

impl PendingTurn {
    /// The Arabic phrase when the user spoke or wrote Arabic, else the English one.
    fn pick<'a>(&self, english: &'a str, arabic: &'a str) -> &'a str {
        let is_ar = self.detected_language.as_deref().is_some_and(is_arabic)
            || detect_script_language(&self.text) == Some("ar");
        if is_ar {
            arabic
        } else {
            english
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Replied { from_cache: bool, audio_dispatched: bool },
    NoSpeech,
    /// Attachment that is neither audio nor accompanied by text
    Unsupported,
    Failed { notice_sent: bool },
    /// No turn slot became free in time; only the busy notice was sent
    Overloaded,
}

impl TurnOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TurnOutcome::Replied { from_cache: true, .. } => "replied_cached",
            TurnOutcome::Replied { .. } => "replied",
            TurnOutcome::NoSpeech => "no_speech",
            TurnOutcome::Unsupported => "unsupported",
            TurnOutcome::Failed { .. } => "failed",
            TurnOutcome::Overloaded => "overloaded",
        }
    }
}

/// What `handle` returns. Test builds also keep the handle of the spawned
/// audio stage so a test can wait for it; otherwise the task is detached.
#[derive(Debug)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    #[cfg(test)]
    audio_task: Option<JoinHandle<()>>,
}

impl TurnReport {
    fn finished(outcome: TurnOutcome) -> Self {
        Self {
            outcome,
            #[cfg(test)]
            audio_task: None,
        }
    }

    fn with_audio(outcome: TurnOutcome, task: JoinHandle<()>) -> Self {
        #[cfg(not(test))]
        drop(task);
        Self {
            outcome,
            #[cfg(test)]
            audio_task: Some(task),
        }
    }
}

/// Downloaded media, with its normalized form when transcoding worked.
struct FetchedAudio {
    raw: Vec<u8>,
    normalized: Option<NormalizedAudio>,
}

#[derive(Debug, Clone)]
struct Settings {
    fallback: FallbackMessages,
    send_acknowledgements: bool,
    send_voice_preparation: bool,
    max_message_length: usize,
    public_base_url: String,
    default_locale: String,
}

pub struct Orchestrator {
    deps: PipelineDeps,
    sessions: Arc<SessionManager>,
    executor: TurnExecutor,
    responses: ResponseCache,
    audio: AudioCache,
    telemetry: Arc<PipelineTelemetry>,
    permits: Semaphore,
    max_turns: usize,
    admission_wait: Duration,
    download_policy: RetryPolicy,
    prewarm_policy: RetryPolicy,
    stt_policy: RetryPolicy,
    tts_policy: RetryPolicy,
    delivery_policy: RetryPolicy,
    settings: Settings,
}

impl Orchestrator {
    pub fn new(config: &AppConfig, deps: PipelineDeps, telemetry: Arc<PipelineTelemetry>) -> Self {
        let pipeline = &config.pipeline;
        let sessions = Arc::new(SessionManager::new(
            deps.agent.clone(),
            Duration::from_secs(config.agent.session_ttl_secs),
        ));
        let executor = TurnExecutor::new(
            sessions.clone(),
            deps.agent.clone(),
            RetryPolicy::from_stage(stage::AGENT, &pipeline.agent),
        );

        Self {
            sessions,
            executor,
            responses: ResponseCache::in_memory(Duration::from_secs(config.cache.response_ttl_secs)),
            audio: AudioCache::in_memory(Duration::from_secs(config.cache.audio_ttl_secs)),
            telemetry,
            permits: Semaphore::new(pipeline.max_concurrent_turns),
            max_turns: pipeline.max_concurrent_turns,
            admission_wait: ADMISSION_WAIT,
            download_policy: RetryPolicy::from_stage(stage::DOWNLOAD, &pipeline.download),
            prewarm_policy: RetryPolicy::single(stage::SESSION_PREWARM, pipeline.agent.timeout()),
            stt_policy: RetryPolicy::from_stage(stage::STT, &pipeline.stt),
            tts_policy: RetryPolicy::from_stage(stage::TTS, &pipeline.tts),
            delivery_policy: RetryPolicy::from_stage(stage::DELIVERY, &pipeline.delivery),
            settings: Settings {
                fallback: pipeline.fallback.clone(),
                send_acknowledgements: pipeline.send_acknowledgements,
                send_voice_preparation: pipeline.send_voice_preparation,
                max_message_length: config.messaging.max_message_length,
                public_base_url: config.server.public_base_url.trim_end_matches('/').to_string(),
                default_locale: config.voice.default_locale.clone(),
            },
            deps,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn responses(&self) -> &ResponseCache {
        &self.responses
    }

    pub fn audio_cache(&self) -> &AudioCache {
        &self.audio
    }

    pub fn telemetry(&self) -> &Arc<PipelineTelemetry> {
        &self.telemetry
    }

    /// Turns currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.max_turns.saturating_sub(self.permits.available_permits())
    }

    /// Handle one inbound message end to end, up to and including text
    /// delivery. The audio stage keeps running after this returns.
    pub async fn handle(self: &Arc<Self>, message: InboundMessage) -> TurnReport {
        let span = info_span!(
            "turn",
            turn_id = %Uuid::new_v4(),
            message_id = %message.message_id,
            user = %mask_user_key(&message.user_key),
        );
        self.admit_and_run(message).instrument(span).await
    }

    async fn admit_and_run(self: &Arc<Self>, message: InboundMessage) -> TurnReport {
        let started = Instant::now();
        let _permit = match tokio::time::timeout(self.admission_wait, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                warn!(in_flight = self.in_flight(), "No turn slot became free, rejecting message");
                self.notify(&message.user_key, &self.settings.fallback.overloaded)
                    .await;
                self.telemetry.record_outcome(TurnOutcome::Overloaded.label());
                return TurnReport::finished(TurnOutcome::Overloaded);
            }
        };

        let report = match message.media.as_ref() {
            Some(media) if message.is_voice() => self.voice_turn(&message.user_key, media, started).await,
            _ if !message.body.is_empty() => TurnReport::finished(self.text_turn(&message, started).await),
            _ => {
                info!("Attachment is not audio and carries no text");
                self.notify(&message.user_key, &self.settings.fallback.unsupported_media)
                    .await;
                TurnReport::finished(TurnOutcome::Unsupported)
            }
        };

        let elapsed = started.elapsed();
        self.telemetry.record_stage(
            stage::TURN,
            elapsed,
            !matches!(report.outcome, TurnOutcome::Failed { .. }),
        );
        self.telemetry.record_outcome(report.outcome.label());
        info!(
            outcome = report.outcome.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Turn finished"
        );
        report
    }

    async fn voice_turn(self: &Arc<Self>, user_key: &str, media: &MediaRef, started_at: Instant) -> TurnReport {
        let (fetched, prewarm) = tokio::join!(self.fetch_audio(media), self.prewarm(user_key));
        if let Err(err) = prewarm {
            warn!(kind = err.kind(), error = %err, "Session prewarm failed, the agent turn will retry the handshake");
        }
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(err) => return TurnReport::finished(self.fail_turn(user_key, &err).await),
        };

        let transcription = match self.transcribe(media, &fetched).await {
            Ok(transcription) => transcription,
            Err(err) => return TurnReport::finished(self.fail_turn(user_key, &err).await),
        };
        if transcription.is_empty() {
            info!("No speech detected");
            self.notify(user_key, &self.settings.fallback.no_speech).await;
            return TurnReport::finished(TurnOutcome::NoSpeech);
        }
        info!(
            language = transcription.detected_language.as_deref().unwrap_or("unknown"),
            confidence = transcription.confidence,
            chars = transcription.text.chars().count(),
            "Transcribed voice message"
        );

        let turn = PendingTurn {
            user_key: user_key.to_string(),
            text: transcription.text.trim().to_string(),
            detected_language: transcription.detected_language,
            started_at,
        };

        let (reply, from_cache) = match self.resolve_reply(&turn, true).await {
            Ok(resolved) => resolved,
            Err(err) => return TurnReport::finished(self.fail_turn(user_key, &err).await),
        };
        if let Err(err) = self.deliver_text(user_key, &reply).await {
            return TurnReport::finished(self.fail_turn(user_key, &err).await);
        }
        info!(
            first_result_ms = turn.started_at.elapsed().as_millis() as u64,
            from_cache,
            "Reply text delivered"
        );

        if self.settings.send_voice_preparation {
            let fallback = &self.settings.fallback;
            self.notify(user_key, turn.pick(&fallback.voice_preparation_en, &fallback.voice_preparation_ar))
                .await;
        }

        let audio_task = self.spawn_audio(&turn, reply);
        TurnReport::with_audio(
            TurnOutcome::Replied {
                from_cache,
                audio_dispatched: true,
            },
            audio_task,
        )
    }

    async fn text_turn(&self, message: &InboundMessage, started_at: Instant) -> TurnOutcome {
        let turn = PendingTurn {
            user_key: message.user_key.clone(),
            text: message.body.clone(),
            detected_language: None,
            started_at,
        };

        let result = match self.resolve_reply(&turn, false).await {
            Ok((reply, _)) => self.deliver_text(&turn.user_key, &reply).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => TurnOutcome::Replied {
                from_cache: false,
                audio_dispatched: false,
            },
            Err(err) => self.fail_turn(&turn.user_key, &err).await,
        }
    }

    /// Download, then transcode. A transcode failure is not fatal: the raw
    /// bytes go to the recognizer instead.
    async fn fetch_audio(&self, media: &MediaRef) -> PipelineResult<FetchedAudio> {
        let raw = self
            .telemetry
            .timed(
                stage::DOWNLOAD,
                self.download_policy.run(|_| self.deps.fetcher.fetch(&media.url)),
            )
            .await?;

        let normalized = match self
            .telemetry
            .timed(stage::TRANSCODE, self.deps.transcoder.transcode(&raw, &media.content_type))
            .await
        {
            Ok(normalized) => {
                debug!(
                    bytes = raw.len(),
                    duration_ms = normalized.duration_ms,
                    "Audio normalized"
                );
                Some(normalized)
            }
            Err(err) => {
                warn!(
                    content_type = %media.content_type,
                    error = %err,
                    "Transcode failed, sending the original audio to STT"
                );
                None
            }
        };

        Ok(FetchedAudio { raw, normalized })
    }

    async fn prewarm(&self, user_key: &str) -> PipelineResult<()> {
        self.telemetry
            .timed(
                stage::SESSION_PREWARM,
                self.prewarm_policy.run(|_| self.sessions.prewarm(user_key)),
            )
            .await
    }

    /// Normalized audio first; if the recognizer refuses it, the original
    /// bytes once. Without normalized audio the original bytes are the only
    /// attempt.
    async fn transcribe(&self, media: &MediaRef, fetched: &FetchedAudio) -> PipelineResult<TranscriptionResult> {
        if let Some(normalized) = &fetched.normalized {
            match self.recognize(SpeechInput::normalized(normalized)).await {
                Err(PipelineError::UnsupportedFormat(detail)) => {
                    warn!(%detail, "Recognizer refused normalized audio, retrying with the original bytes");
                }
                other => return other,
            }
        }
        self.recognize(SpeechInput::raw(&fetched.raw, &media.content_type))
            .await
    }

    async fn recognize(&self, input: SpeechInput<'_>) -> PipelineResult<TranscriptionResult> {
        self.telemetry
            .timed(
                stage::STT,
                self.stt_policy.run(move |_| self.deps.stt.transcribe(input)),
            )
            .await
    }

    /// Reply text for the turn and whether it came from the response cache.
    async fn resolve_reply(&self, turn: &PendingTurn, use_cache: bool) -> PipelineResult<(String, bool)> {
        if use_cache {
            if let Some(cached) = self.responses.get(&turn.text) {
                info!("Response cache hit, skipping the agent");
                return Ok((cached, true));
            }
            if self.settings.send_acknowledgements {
                let fallback = &self.settings.fallback;
                self.notify(&turn.user_key, turn.pick(&fallback.acknowledgement_en, &fallback.acknowledgement_ar))
                    .await;
            }
        }

        match self
            .telemetry
            .timed(stage::AGENT, self.executor.run(&turn.user_key, &turn.text))
            .await
        {
            Ok(reply) => {
                if use_cache {
                    self.responses.put(&turn.text, &reply);
                }
                Ok((reply, false))
            }
            Err(PipelineError::EmptyReply) => {
                warn!("Agent returned no message content, sending fallback");
                Ok((self.settings.fallback.empty_reply.clone(), false))
            }
            Err(err) => Err(err),
        }
    }

    async fn deliver_text(&self, user_key: &str, text: &str) -> PipelineResult<()> {
        let chunks = chunk_message(text, self.settings.max_message_length);
        if chunks.len() > 1 {
            debug!(parts = chunks.len(), "Reply split into several messages");
        }
        for chunk in &chunks {
            self.telemetry
                .timed(
                    stage::DELIVERY,
                    self.delivery_policy
                        .run(|_| self.deps.gateway.send_text(user_key, chunk)),
                )
                .await?;
        }
        Ok(())
    }

    /// Send a fixed phrase. Returns whether it reached the gateway.
    async fn notify(&self, user_key: &str, text: &str) -> bool {
        match self.deliver_text(user_key, text).await {
            Ok(()) => true,
            Err(err) => {
                error!(kind = err.kind(), error = %err, "Could not deliver notice");
                false
            }
        }
    }

    async fn fail_turn(&self, user_key: &str, err: &PipelineError) -> TurnOutcome {
        error!(kind = err.kind(), error = %err, "Turn failed");
        let notice_sent = self
            .notify(user_key, &self.settings.fallback.generic_error)
            .await;
        TurnOutcome::Failed { notice_sent }
    }

    fn spawn_audio(self: &Arc<Self>, turn: &PendingTurn, reply: String) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let user_key = turn.user_key.clone();
        let voice = select_voice(
            turn.detected_language.as_deref(),
            &reply,
            &self.settings.default_locale,
        );

        let task = async move {
            match this.deliver_audio(&user_key, &reply, &voice).await {
                Ok(()) => info!(locale = %voice.locale, "Audio reply delivered"),
                Err((failed_stage, err)) => {
                    error!(
                        stage = failed_stage,
                        kind = err.kind(),
                        error = %err,
                        "Audio reply failed; text reply already delivered"
                    );
                    this.telemetry
                        .record_background_failure(failed_stage, err.kind());
                }
            }
        };
        tokio::spawn(task.instrument(Span::current()))
    }

    async fn deliver_audio(
        &self,
        user_key: &str,
        reply: &str,
        voice: &VoiceSelection,
    ) -> Result<(), (&'static str, PipelineError)> {
        let key = match self.audio.get(&voice.locale, reply) {
            Some((key, _)) => {
                debug!("Audio cache hit");
                key
            }
            None => {
                let synthesized = self
                    .telemetry
                    .timed(
                        stage::TTS,
                        self.tts_policy.run(|_| self.deps.tts.synthesize(reply, voice)),
                    )
                    .await
                    .map_err(|err| (stage::TTS, err))?;
                self.audio.put(
                    &voice.locale,
                    reply,
                    CachedAudio {
                        bytes: Arc::new(synthesized.bytes),
                        content_type: synthesized.content_type,
                    },
                )
            }
        };

        let media_url = format!("{}/audio/{}", self.settings.public_base_url, key);
        self.telemetry
            .timed(
                stage::AUDIO_DELIVERY,
                self.delivery_policy
                    .run(|_| self.deps.gateway.send_audio(user_key, &media_url)),
            )
            .await
            .map_err(|err| (stage::AUDIO_DELIVERY, err))
    }
}
