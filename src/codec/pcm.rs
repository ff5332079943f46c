//! Raw PCM payload support.
//!
//! The uncompressed fast path carries 16-bit signed little-endian
//! interleaved samples after the packet header. No framing beyond the
//! datagram: sample count is derived from the payload length.

use super::{AudioFormat, CodecError, VoiceDecoder, VoiceEncoder};

const SCALE_OUT: f32 = 32767.0;
const SCALE_IN: f32 = 1.0 / 32768.0;

/// Packs float frames into i16-LE payloads. Used by clients running with
/// `raw_pcm` enabled to skip the encoder entirely.
pub struct RawPcmEncoder {
    format: AudioFormat,
    frame_size: usize,
}

impl RawPcmEncoder {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            frame_size: format.frames_per_voice_frame(),
        }
    }
}

impl VoiceEncoder for RawPcmEncoder {
    fn encode(&mut self, pcm: &[f32], output: &mut [u8]) -> Result<usize, CodecError> {
        let bytes_needed = pcm.len() * 2;
        if output.len() < bytes_needed {
            return Err(CodecError::BufferTooSmall);
        }

        for (i, &sample) in pcm.iter().enumerate() {
            let clamped = sample.clamp(-1.0, 1.0);
            let value = (clamped * SCALE_OUT) as i16;
            output[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
        }

        Ok(bytes_needed)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Unpacks i16-LE payloads into float frames.
pub struct RawPcmDecoder {
    format: AudioFormat,
}

impl RawPcmDecoder {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl VoiceDecoder for RawPcmDecoder {
    fn decode(&mut self, data: &[u8], output: &mut [f32]) -> Result<usize, CodecError> {
        if data.len() < 2 {
            return Err(CodecError::InvalidInput);
        }

        let sample_count = data.len() / 2;
        if output.len() < sample_count {
            return Err(CodecError::BufferTooSmall);
        }

        for i in 0..sample_count {
            let value = i16::from_le_bytes([data[i * 2], data[i * 2 + 1]]);
            output[i] = value as f32 * SCALE_IN;
        }

        // Frames, not samples: a trailing odd byte is ignored.
        Ok(sample_count / self.format.channels as usize)
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_preserves_order() {
        let format = AudioFormat::new(16000, 1);
        let mut encoder = RawPcmEncoder::new(format);
        let mut decoder = RawPcmDecoder::new(format);

        let pcm: Vec<f32> = (0..320).map(|i| (i as f32 / 320.0) - 0.5).collect();
        let mut payload = vec![0u8; pcm.len() * 2];
        let bytes = encoder.encode(&pcm, &mut payload).unwrap();
        assert_eq!(bytes, 640);

        let mut out = vec![0.0f32; pcm.len()];
        let frames = decoder.decode(&payload, &mut out).unwrap();
        assert_eq!(frames, 320);

        for (a, b) in pcm.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1.0 / 32000.0);
        }
    }

    #[test]
    fn test_encode_clamps() {
        let format = AudioFormat::new(16000, 1);
        let mut encoder = RawPcmEncoder::new(format);
        let mut payload = [0u8; 4];
        encoder.encode(&[2.0, -2.0], &mut payload).unwrap();

        assert_eq!(i16::from_le_bytes([payload[0], payload[1]]), 32767);
        assert_eq!(i16::from_le_bytes([payload[2], payload[3]]), -32767);
    }

    #[test]
    fn test_decode_stereo_counts_frames() {
        let format = AudioFormat::new(48000, 2);
        let mut decoder = RawPcmDecoder::new(format);
        let data = [0u8; 40]; // 20 samples, 10 stereo frames
        let mut out = [0.0f32; 20];
        assert_eq!(decoder.decode(&data, &mut out).unwrap(), 10);
    }

    #[test]
    fn test_decode_short_input() {
        let format = AudioFormat::new(16000, 1);
        let mut decoder = RawPcmDecoder::new(format);
        let mut out = [0.0f32; 4];
        assert!(decoder.decode(&[0x01], &mut out).is_err());
    }
}
