//! # Audio Processing and Conversion
//!
//! Pure PCM transforms used by the transcoders. Nothing here touches the
//! network or the filesystem, so every function is deterministic: the same
//! input bytes always produce the same output bytes.
//!
//! ## Key Functions:
//! - **Decoding**: WAV (any PCM depth or IEEE float) and raw L16 into f32 frames
//! - **Downmixing**: average interleaved channels into mono
//! - **Resampling**: linear interpolation to the normalized rate
//! - **Encoding**: 16-bit WAV container for the recognizer

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Target format for speech recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFormat {
    /// Target sample rate (16000 for speech recognition)
    pub sample_rate: u32,

    /// Number of audio channels (1 for mono)
    pub channels: u16,

    /// Bit depth (16 for PCM)
    pub bit_depth: u16,
}

impl Default for NormalizedFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

/// Decoded audio before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub channels: u16,
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
}

/// Audio conversion utilities.
///
/// ## Purpose:
/// Holds the target format and turns any decodable input into that format.
/// Errors are plain strings; the transcoder wraps them in
/// `PipelineError::TranscodeFailed`.
#[derive(Debug, Clone, Default)]
pub struct AudioProcessor {
    format: NormalizedFormat,
}

impl AudioProcessor {
    pub fn format(&self) -> &NormalizedFormat {
        &self.format
    }

    /// Decode a WAV container.
    ///
    /// ## Supported sample formats:
    /// - 8-bit unsigned PCM
    /// - 16-bit and 24-bit signed PCM
    /// - 32-bit IEEE float
    pub fn decode_wav(&self, data: &[u8]) -> Result<DecodedAudio, String> {
        if data.is_empty() {
            return Err("Audio data is empty".to_string());
        }

        let mut cursor = Cursor::new(data);
        let (header, track) = wav::read(&mut cursor).map_err(|e| format!("Invalid WAV data: {}", e))?;

        if header.channel_count == 0 {
            return Err("WAV header declares zero channels".to_string());
        }
        if header.sampling_rate == 0 {
            return Err("WAV header declares a zero sample rate".to_string());
        }

        let samples: Vec<f32> = match track {
            wav::BitDepth::Eight(s) => s.iter().map(|&v| (v as f32 - 128.0) / 128.0).collect(),
            wav::BitDepth::Sixteen(s) => self.pcm_to_float(&s),
            wav::BitDepth::TwentyFour(s) => s.iter().map(|&v| v as f32 / 8_388_608.0).collect(),
            wav::BitDepth::ThirtyTwoFloat(s) => s,
            wav::BitDepth::Empty => return Err("WAV file contains no samples".to_string()),
        };

        Ok(DecodedAudio {
            sample_rate: header.sampling_rate,
            channels: header.channel_count,
            samples,
        })
    }

    /// Decode raw big-endian 16-bit PCM (`audio/L16`).
    ///
    /// ## Parameters:
    /// - **data**: sample bytes, no header
    /// - **sample_rate** / **channels**: taken from the content type parameters
    pub fn decode_l16(&self, data: &[u8], sample_rate: u32, channels: u16) -> Result<DecodedAudio, String> {
        if data.is_empty() {
            return Err("Audio data is empty".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Audio data length must be even for 16-bit samples".to_string());
        }
        if sample_rate == 0 {
            return Err("L16 content type declares a zero sample rate".to_string());
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<BigEndian>() {
            samples.push(sample as f32 / 32768.0);
        }

        Ok(DecodedAudio {
            sample_rate,
            channels: channels.max(1),
            samples,
        })
    }

    /// Read little-endian 16-bit samples, the raw output format requested
    /// from ffmpeg.
    pub fn read_s16le(&self, data: &[u8]) -> Result<Vec<i16>, String> {
        if data.is_empty() {
            return Err("Converter produced no audio".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Converter output length must be even for 16-bit samples".to_string());
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        Ok(samples)
    }

    /// Average interleaved frames down to one channel.
    pub fn downmix(&self, samples: &[f32], channels: u16) -> Vec<f32> {
        if channels <= 1 {
            return samples.to_vec();
        }
        samples
            .chunks(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect()
    }

    /// Linear-interpolation resampler.
    ///
    /// Speech recognition is tolerant of the mild aliasing this introduces,
    /// and the result is exactly reproducible for a given input.
    pub fn resample(&self, samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
        if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
            return samples.to_vec();
        }

        let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
        let step = from_rate as f64 / to_rate as f64;
        let last = samples.len() - 1;

        (0..out_len)
            .map(|i| {
                let position = i as f64 * step;
                let index = (position.floor() as usize).min(last);
                let next = (index + 1).min(last);
                let fraction = (position - index as f64) as f32;
                samples[index] + (samples[next] - samples[index]) * fraction
            })
            .collect()
    }

    /// Decoded audio → normalized 16-bit mono samples at the target rate.
    pub fn normalize(&self, decoded: &DecodedAudio) -> Vec<i16> {
        let mono = self.downmix(&decoded.samples, decoded.channels);
        let resampled = self.resample(&mono, decoded.sample_rate, self.format.sample_rate);
        self.float_to_pcm(&resampled)
    }

    /// Wrap normalized samples in a WAV container.
    pub fn encode_wav(&self, samples: &[i16]) -> Result<Vec<u8>, String> {
        if samples.is_empty() {
            return Err("No samples to encode".to_string());
        }

        let header = wav::Header::new(
            wav::WAV_FORMAT_PCM,
            self.format.channels,
            self.format.sample_rate,
            self.format.bit_depth,
        );
        let mut out = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out)
            .map_err(|e| format!("Failed to encode WAV: {}", e))?;
        Ok(out.into_inner())
    }

    /// Duration of normalized samples in milliseconds.
    pub fn duration_ms(&self, sample_count: usize) -> u64 {
        sample_count as u64 * 1000 / self.format.sample_rate as u64
    }

    /// Scales from 16-bit integer range [-32768, 32767] to float range [-1.0, 1.0]
    pub fn pcm_to_float(&self, samples: &[i16]) -> Vec<f32> {
        samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
    }

    pub fn float_to_pcm(&self, samples: &[f32]) -> Vec<i16> {
        samples
            .iter()
            .map(|&sample| {
                let scaled = sample * 32768.0;
                scaled.clamp(-32768.0, 32767.0) as i16
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_wav(rate: u32, frames: usize) -> Vec<u8> {
        let mut samples = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            let v = ((i as f32 * 0.05).sin() * 12000.0) as i16;
            samples.push(v);
            samples.push(v);
        }
        let header = wav::Header::new(wav::WAV_FORMAT_PCM, 2, rate, 16);
        let mut out = Cursor::new(Vec::new());
        wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_pcm_conversion() {
        let processor = AudioProcessor::default();

        let pcm_samples = vec![0i16, 16384, -16384, 32767, -32768];
        let float_samples = processor.pcm_to_float(&pcm_samples);
        let converted_back = processor.float_to_pcm(&float_samples);

        for (original, converted) in pcm_samples.iter().zip(converted_back.iter()) {
            let diff = (original - converted).abs();
            assert!(diff <= 1, "Conversion error too large: {} vs {}", original, converted);
        }
    }

    #[test]
    fn test_downmix_averages_frames() {
        let processor = AudioProcessor::default();
        let mono = processor.downmix(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn test_resample_changes_length_by_ratio() {
        let processor = AudioProcessor::default();
        let input = vec![0.1f32; 48_000];
        let output = processor.resample(&input, 48_000, 16_000);
        assert_eq!(output.len(), 16_000);
        assert!(output.iter().all(|&s| (s - 0.1).abs() < 1e-6));
    }

    #[test]
    fn test_wav_roundtrip_is_normalized_and_deterministic() {
        let processor = AudioProcessor::default();
        let input = stereo_wav(44_100, 4_410);

        let decoded = processor.decode_wav(&input).unwrap();
        assert_eq!(decoded.channels, 2);
        assert_eq!(decoded.sample_rate, 44_100);

        let normalized = processor.normalize(&decoded);
        assert_eq!(normalized.len(), 1_600);
        assert_eq!(processor.duration_ms(normalized.len()), 100);

        let first = processor.encode_wav(&normalized).unwrap();
        let second = processor.encode_wav(&processor.normalize(&processor.decode_wav(&input).unwrap())).unwrap();
        assert_eq!(first, second);

        let reread = processor.decode_wav(&first).unwrap();
        assert_eq!(reread.channels, 1);
        assert_eq!(reread.sample_rate, 16_000);
    }

    #[test]
    fn test_l16_is_big_endian() {
        let processor = AudioProcessor::default();
        let decoded = processor.decode_l16(&[0x40, 0x00, 0xC0, 0x00], 8_000, 1).unwrap();
        assert_eq!(decoded.samples, vec![0.5, -0.5]);
        assert!(processor.decode_l16(&[0x01], 8_000, 1).is_err());
    }

    #[test]
    fn test_zero_rates_never_divide() {
        let processor = AudioProcessor::default();
        assert!(processor.decode_l16(&[0x00, 0x01, 0x00, 0x02], 0, 1).is_err());
        assert_eq!(processor.resample(&[0.25, 0.5], 0, 16_000), vec![0.25, 0.5]);
        assert_eq!(processor.resample(&[0.25, 0.5], 8_000, 0), vec![0.25, 0.5]);
    }

    #[test]
    fn test_invalid_wav_is_rejected() {
        let processor = AudioProcessor::default();
        assert!(processor.decode_wav(b"definitely not a wav").is_err());
        assert!(processor.decode_wav(&[]).is_err());
    }
}
