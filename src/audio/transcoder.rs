//! # Audio Transcoder
//!
//! The first pipeline stage after download. Every implementation turns
//! `(bytes, declared content type)` into `NormalizedAudio` or fails with
//! `PipelineError::TranscodeFailed`; the orchestrator then submits the
//! original bytes to speech recognition instead.
//!
//! ## Implementations:
//! - **NativeTranscoder**: WAV and raw L16, decoded in-process
//! - **FfmpegTranscoder**: compressed codecs (OGG/Opus, AMR, MP3, AAC) piped
//!   through an `ffmpeg` child process over stdin/stdout
//! - **ChainTranscoder**: routes by format, native first where it applies

use super::processor::{AudioProcessor, DecodedAudio};
use super::AudioFormat;
use crate::error::{PipelineError, PipelineResult};
use crate::http::pool::truncate;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// 16 kHz mono 16-bit PCM in a WAV container.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedAudio {
    pub wav: Vec<u8>,
    pub sample_rate: u32,
    pub duration_ms: u64,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, input: &[u8], content_type: &str) -> PipelineResult<NormalizedAudio>;
}

fn failed(message: impl Into<String>) -> PipelineError {
    PipelineError::TranscodeFailed(message.into())
}

/// Read a `key=value` parameter from a content type such as
/// `audio/L16;rate=16000;channels=1`.
fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

/// In-process decoder for uncompressed input.
#[derive(Debug, Clone, Default)]
pub struct NativeTranscoder {
    processor: AudioProcessor,
}

impl NativeTranscoder {
    pub fn supports(format: AudioFormat) -> bool {
        matches!(format, AudioFormat::Wav | AudioFormat::L16)
    }

    fn decode(&self, input: &[u8], content_type: &str) -> Result<DecodedAudio, String> {
        match AudioFormat::from_content_type(content_type) {
            AudioFormat::Wav => self.processor.decode_wav(input),
            AudioFormat::L16 => {
                // RFC 2586 defaults when the parameters are missing
                let rate = content_type_param(content_type, "rate")
                    .and_then(|v| v.parse::<u32>().ok())
                    .unwrap_or(8_000);
                let channels = content_type_param(content_type, "channels")
                    .and_then(|v| v.parse::<u16>().ok())
                    .unwrap_or(1);
                self.processor.decode_l16(input, rate, channels)
            }
            other => Err(format!("{} cannot be decoded natively", other.as_str())),
        }
    }
}

#[async_trait]
impl Transcoder for NativeTranscoder {
    async fn transcode(&self, input: &[u8], content_type: &str) -> PipelineResult<NormalizedAudio> {
        let decoded = self.decode(input, content_type).map_err(failed)?;
        let samples = self.processor.normalize(&decoded);
        let wav = self.processor.encode_wav(&samples).map_err(failed)?;

        Ok(NormalizedAudio {
            wav,
            sample_rate: self.processor.format().sample_rate,
            duration_ms: self.processor.duration_ms(samples.len()),
        })
    }
}

/// Transcoder backed by an external `ffmpeg` binary.
///
/// Input is written to the child's stdin and raw `s16le` samples are read
/// from its stdout, so no temporary files are created. The WAV header is
/// added locally because ffmpeg cannot seek back to fill in chunk sizes when
/// writing to a pipe.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: String,
    timeout: Duration,
    processor: AudioProcessor,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            processor: AudioProcessor::default(),
        }
    }

    fn command(&self) -> Command {
        let rate = self.processor.format().sample_rate.to_string();
        let mut command = Command::new(&self.binary);
        command
            .args(["-hide_banner", "-loglevel", "error", "-i", "pipe:0"])
            .args(["-ar", rate.as_str(), "-ac", "1", "-f", "s16le", "pipe:1"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, input: &[u8], content_type: &str) -> PipelineResult<NormalizedAudio> {
        if input.is_empty() {
            return Err(failed("input is empty"));
        }

        let mut child = self
            .command()
            .spawn()
            .map_err(|e| failed(format!("failed to start '{}': {}", self.binary, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| failed("converter stdin unavailable"))?;
        let payload = input.to_vec();
        // Written from a separate task so a full stdout pipe cannot deadlock us
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            result
        });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| failed(format!("converter timed out after {}ms", self.timeout.as_millis())))?
            .map_err(|e| failed(format!("converter failed: {}", e)))?;

        if let Ok(Err(e)) = writer.await {
            // A converter that rejects its input closes stdin early
            debug!(error = %e, "Converter closed stdin before all input was written");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!(
                "converter exited with {} for {}: {}",
                output.status,
                content_type,
                truncate(stderr.trim(), 200)
            )));
        }

        let samples = self.processor.read_s16le(&output.stdout).map_err(failed)?;
        let wav = self.processor.encode_wav(&samples).map_err(failed)?;

        Ok(NormalizedAudio {
            wav,
            sample_rate: self.processor.format().sample_rate,
            duration_ms: self.processor.duration_ms(samples.len()),
        })
    }
}

/// Routes each input to the decoder that can handle it.
///
/// Natively decodable formats try the in-process decoder first and fall
/// back to the external one; everything else goes straight to the external
/// decoder.
pub struct ChainTranscoder {
    native: NativeTranscoder,
    external: Arc<dyn Transcoder>,
}

impl ChainTranscoder {
    pub fn new(native: NativeTranscoder, external: Arc<dyn Transcoder>) -> Self {
        Self { native, external }
    }
}

#[async_trait]
impl Transcoder for ChainTranscoder {
    async fn transcode(&self, input: &[u8], content_type: &str) -> PipelineResult<NormalizedAudio> {
        if input.is_empty() {
            return Err(failed("input is empty"));
        }

        let format = AudioFormat::from_content_type(content_type);
        if NativeTranscoder::supports(format) {
            match self.native.transcode(input, content_type).await {
                Ok(audio) => return Ok(audio),
                Err(e) => warn!(format = format.as_str(), error = %e, "Native decode failed, trying converter"),
            }
        }

        self.external.transcode(input, content_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn mono_wav(rate: u32, samples: usize) -> Vec<u8> {
        let data: Vec<i16> = (0..samples).map(|i| (i % 200) as i16 * 50).collect();
        let mut out = Cursor::new(Vec::new());
        wav::write(
            wav::Header::new(wav::WAV_FORMAT_PCM, 1, rate, 16),
            &wav::BitDepth::Sixteen(data),
            &mut out,
        )
        .unwrap();
        out.into_inner()
    }

    struct RecordingTranscoder {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transcoder for RecordingTranscoder {
        async fn transcode(&self, _input: &[u8], content_type: &str) -> PipelineResult<NormalizedAudio> {
            self.calls.lock().unwrap().push(content_type.to_string());
            Ok(NormalizedAudio {
                wav: vec![1, 2, 3],
                sample_rate: 16_000,
                duration_ms: 0,
            })
        }
    }

    fn chain() -> (ChainTranscoder, Arc<RecordingTranscoder>) {
        let external = Arc::new(RecordingTranscoder {
            calls: Mutex::new(Vec::new()),
        });
        (ChainTranscoder::new(NativeTranscoder::default(), external.clone()), external)
    }

    #[test]
    fn test_content_type_param() {
        assert_eq!(
            content_type_param("audio/L16; rate=16000; channels=2", "rate").as_deref(),
            Some("16000")
        );
        assert_eq!(content_type_param("audio/L16", "rate"), None);
    }

    #[tokio::test]
    async fn test_native_wav_is_normalized() {
        let audio = NativeTranscoder::default()
            .transcode(&mono_wav(8_000, 8_000), "audio/wav")
            .await
            .unwrap();
        assert_eq!(audio.sample_rate, 16_000);
        assert_eq!(audio.duration_ms, 1_000);
    }

    #[tokio::test]
    async fn test_l16_with_zero_rate_is_transcode_failure() {
        let result = NativeTranscoder::default()
            .transcode(&[0, 1, 0, 2], "audio/L16;rate=0")
            .await;
        assert!(matches!(result, Err(PipelineError::TranscodeFailed(_))));
    }

    #[tokio::test]
    async fn test_native_rejects_compressed_formats() {
        let result = NativeTranscoder::default().transcode(b"OggS....", "audio/ogg").await;
        assert!(matches!(result, Err(PipelineError::TranscodeFailed(_))));
    }

    #[tokio::test]
    async fn test_chain_routes_by_format() {
        let (chain, external) = chain();

        chain.transcode(&mono_wav(16_000, 1_600), "audio/wav").await.unwrap();
        assert!(external.calls.lock().unwrap().is_empty());

        chain.transcode(b"OggS....", "audio/ogg; codecs=opus").await.unwrap();
        assert_eq!(*external.calls.lock().unwrap(), vec!["audio/ogg; codecs=opus".to_string()]);
    }

    #[tokio::test]
    async fn test_chain_falls_back_when_native_decode_fails() {
        let (chain, external) = chain();
        chain.transcode(b"corrupt wav bytes", "audio/x-wav").await.unwrap();
        assert_eq!(external.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_fails() {
        let (chain, external) = chain();
        let result = chain.transcode(&[], "audio/ogg").await;
        assert!(matches!(result, Err(PipelineError::TranscodeFailed(_))));
        assert!(external.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_converter_binary_is_transcode_failure() {
        let ffmpeg = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary", Duration::from_secs(1));
        let result = ffmpeg.transcode(b"OggS....", "audio/ogg").await;
        assert!(matches!(result, Err(PipelineError::TranscodeFailed(_))));
    }
}
