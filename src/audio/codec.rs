//! PCM transport codec for the duplex audio link.
//!
//! The remote endpoint exchanges raw 16-bit little-endian PCM wrapped in
//! base64 text. Outbound capture frames are f32 samples packed down to i16;
//! inbound payloads are unpacked into planar f32 buffers for the playback
//! scheduler. Everything here is pure and side-effect free.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed transport payload: {0}")]
    MalformedPayload(#[from] base64::DecodeError),

    #[error("short PCM buffer: {len} bytes is not a multiple of {frame} ({channels}ch x 16-bit)")]
    ShortBuffer {
        len: usize,
        frame: usize,
        channels: usize,
    },
}

/// A decoded, planar audio buffer ready for playback scheduling.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of sample frames per channel.
    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        self.frame_count() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    /// Average all channels down to a single mono track.
    pub fn mixdown(&self) -> Vec<f32> {
        match self.channels.len() {
            0 => Vec::new(),
            1 => self.channels[0].clone(),
            n => (0..self.frame_count())
                .map(|i| self.channels.iter().map(|ch| ch[i]).sum::<f32>() / n as f32)
                .collect(),
        }
    }
}

/// One outbound audio frame: base64 PCM plus its mime descriptor.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub mime_type: String,
    pub data: String,
}

impl EncodedChunk {
    /// Encode f32 samples as a 16-bit PCM chunk tagged with its sample rate.
    pub fn pcm16(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            mime_type: format!("audio/pcm;rate={sample_rate}"),
            data: encode_samples_to_transport(samples),
        }
    }
}

/// Convert one float sample to i16 with the transport's asymmetric scaling:
/// the positive half scales by 32767, the negative half by 32768, so both
/// rails of the i16 range are reachable.
pub fn sample_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Decode a base64 transport payload into raw PCM bytes.
pub fn decode_transport(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(text)?)
}

/// Pack f32 samples into little-endian 16-bit PCM and base64-encode them.
pub fn encode_samples_to_transport(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    BASE64.encode(&bytes)
}

/// Reinterpret raw bytes as little-endian 16-bit PCM, de-interleave by
/// channel, and normalize to f32 by dividing by 32768.
pub fn decode_to_playback_buffer(
    bytes: &[u8],
    sample_rate: u32,
    channel_count: usize,
) -> Result<AudioBuffer, CodecError> {
    let frame = 2 * channel_count;
    if channel_count == 0 || bytes.len() % frame != 0 {
        return Err(CodecError::ShortBuffer {
            len: bytes.len(),
            frame,
            channels: channel_count,
        });
    }

    let frames = bytes.len() / frame;
    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in bytes.chunks_exact(2).enumerate() {
        let value = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count].push(value as f32 / 32768.0);
    }

    Ok(AudioBuffer::new(sample_rate, channels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asymmetric_scaling_reaches_both_rails() {
        assert_eq!(sample_to_i16(1.0), 32767);
        assert_eq!(sample_to_i16(-1.0), -32768);
        assert_eq!(sample_to_i16(0.0), 0);
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        assert_eq!(sample_to_i16(4.2), 32767);
        assert_eq!(sample_to_i16(-7.0), -32768);
    }

    #[test]
    fn round_trip_is_within_quantization_error() {
        let samples: Vec<f32> = vec![-1.0, -0.75, -0.001, 0.0, 0.001, 0.25, 0.5, 0.999, 1.0];
        let encoded = encode_samples_to_transport(&samples);
        let bytes = decode_transport(&encoded).unwrap();
        let buffer = decode_to_playback_buffer(&bytes, 16_000, 1).unwrap();

        assert_eq!(buffer.frame_count(), samples.len());
        for (original, decoded) in samples.iter().zip(buffer.channel(0)) {
            // The conversion truncates toward zero, so allow two steps.
            assert!(
                (original - decoded).abs() <= 2.0 / 32768.0,
                "{original} decoded as {decoded}"
            );
        }
    }

    #[test]
    fn round_trip_preserves_length_and_channels() {
        let samples = vec![0.1_f32; 480];
        let bytes = decode_transport(&encode_samples_to_transport(&samples)).unwrap();
        let buffer = decode_to_playback_buffer(&bytes, 24_000, 1).unwrap();
        assert_eq!(buffer.frame_count(), 480);
        assert_eq!(buffer.channel_count(), 1);
        assert_eq!(buffer.sample_rate(), 24_000);
    }

    #[test]
    fn decode_transport_rejects_invalid_base64() {
        assert!(matches!(
            decode_transport("not%%base64"),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        // 3 bytes is not a whole 16-bit sample.
        let err = decode_to_playback_buffer(&[0, 1, 2], 24_000, 1).unwrap_err();
        assert!(matches!(err, CodecError::ShortBuffer { len: 3, .. }));

        // 6 bytes is 3 samples, which does not divide into stereo frames.
        let err = decode_to_playback_buffer(&[0; 6], 24_000, 2).unwrap_err();
        assert!(matches!(err, CodecError::ShortBuffer { len: 6, .. }));
    }

    #[test]
    fn decode_rejects_zero_channels() {
        assert!(decode_to_playback_buffer(&[], 24_000, 0).is_err());
    }

    #[test]
    fn stereo_payload_deinterleaves() {
        // L = 0x0100 = 256, R = 0x0200 = 512, two frames.
        let bytes = [0x00, 0x01, 0x00, 0x02, 0x00, 0x01, 0x00, 0x02];
        let buffer = decode_to_playback_buffer(&bytes, 24_000, 2).unwrap();
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frame_count(), 2);
        assert!((buffer.channel(0)[0] - 256.0 / 32768.0).abs() < 1e-6);
        assert!((buffer.channel(1)[0] - 512.0 / 32768.0).abs() < 1e-6);
    }

    #[test]
    fn buffer_duration_follows_sample_rate() {
        let buffer = AudioBuffer::new(24_000, vec![vec![0.0; 12_000]]);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn mixdown_averages_channels() {
        let buffer = AudioBuffer::new(24_000, vec![vec![1.0, 0.0], vec![0.0, 0.0]]);
        let mono = buffer.mixdown();
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn encoded_chunk_carries_rate_in_mime() {
        let chunk = EncodedChunk::pcm16(&[0.0; 4], 16_000);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert!(!chunk.data.is_empty());
    }
}
