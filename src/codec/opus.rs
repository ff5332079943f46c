//! Opus encoder/decoder wrappers.
//!
//! Tuned for the voice sidechannel: VoIP application mode, constant bitrate,
//! in-band FEC off (the transport already tolerates loss), one 20 ms frame
//! per packet.

use super::{AudioFormat, CodecError, VoiceDecoder, VoiceEncoder};

fn channels_of(format: AudioFormat) -> Result<opus::Channels, CodecError> {
    match format.channels {
        1 => Ok(opus::Channels::Mono),
        2 => Ok(opus::Channels::Stereo),
        _ => Err(CodecError::InvalidInput),
    }
}

/// Opus voice encoder: one fixed-size frame in, one bounded packet out.
pub struct OpusVoiceEncoder {
    encoder: opus::Encoder,
    format: AudioFormat,
    frame_size: usize,
    bitrate: u32,
}

impl OpusVoiceEncoder {
    /// Opus accepts 8/12/16/24/48 kHz; anything else fails here.
    pub fn new(format: AudioFormat, bitrate: u32) -> Result<Self, CodecError> {
        let channels = channels_of(format)?;

        let mut encoder =
            opus::Encoder::new(format.sample_rate, channels, opus::Application::Voip)
                .map_err(|e| CodecError::Library(format!("opus encoder create: {}", e)))?;

        encoder
            .set_bitrate(opus::Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::Library(format!("opus set_bitrate: {}", e)))?;
        // CBR keeps packet pacing uniform; DTX is off by default and stays off
        // so the host sees a steady 50 packets/s liveness signal.
        encoder
            .set_vbr(false)
            .map_err(|e| CodecError::Library(format!("opus set_vbr: {}", e)))?;
        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::Library(format!("opus set_inband_fec: {}", e)))?;

        Ok(Self {
            encoder,
            format,
            frame_size: format.frames_per_voice_frame(),
            bitrate,
        })
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }
}

impl VoiceEncoder for OpusVoiceEncoder {
    fn encode(&mut self, pcm: &[f32], output: &mut [u8]) -> Result<usize, CodecError> {
        if pcm.len() != self.format.samples_per_voice_frame() {
            return Err(CodecError::InvalidInput);
        }

        self.encoder
            .encode_float(pcm, output)
            .map_err(|e| CodecError::Library(format!("opus encode: {}", e)))
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

/// Opus voice decoder. Recreated whenever the stream rate changes.
pub struct OpusVoiceDecoder {
    decoder: opus::Decoder,
    format: AudioFormat,
}

impl OpusVoiceDecoder {
    pub fn new(format: AudioFormat) -> Result<Self, CodecError> {
        let channels = channels_of(format)?;

        let decoder = opus::Decoder::new(format.sample_rate, channels)
            .map_err(|e| CodecError::Library(format!("opus decoder create: {}", e)))?;

        Ok(Self { decoder, format })
    }
}

impl VoiceDecoder for OpusVoiceDecoder {
    fn decode(&mut self, data: &[u8], output: &mut [f32]) -> Result<usize, CodecError> {
        if data.is_empty() {
            return Err(CodecError::InvalidInput);
        }

        self.decoder
            .decode_float(data, output, false)
            .map_err(|e| CodecError::Library(format!("opus decode: {}", e)))
    }

    fn format(&self) -> AudioFormat {
        self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MAX_PAYLOAD;

    #[test]
    fn test_encode_decode_16k() {
        let format = AudioFormat::new(16000, 1);
        let mut encoder = OpusVoiceEncoder::new(format, 64000).unwrap();
        let mut decoder = OpusVoiceDecoder::new(format).unwrap();

        // 440 Hz tone, one 20 ms frame.
        let frame: Vec<f32> = (0..format.samples_per_voice_frame())
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / 16000.0).sin() * 0.5)
            .collect();

        let mut payload = [0u8; MAX_PAYLOAD];
        let bytes = encoder.encode(&frame, &mut payload).unwrap();
        assert!(bytes > 0 && bytes <= MAX_PAYLOAD);

        let mut pcm = vec![0.0f32; format.samples_per_voice_frame()];
        let frames = decoder.decode(&payload[..bytes], &mut pcm).unwrap();
        assert_eq!(frames, format.frames_per_voice_frame());
    }

    #[test]
    fn test_encode_rejects_wrong_frame_size() {
        let format = AudioFormat::new(48000, 1);
        let mut encoder = OpusVoiceEncoder::new(format, 64000).unwrap();
        let short = vec![0.0f32; 100];
        let mut payload = [0u8; MAX_PAYLOAD];
        assert!(encoder.encode(&short, &mut payload).is_err());
    }

    #[test]
    fn test_unsupported_rate_rejected() {
        assert!(OpusVoiceEncoder::new(AudioFormat::new(44100, 1), 64000).is_err());
        assert!(OpusVoiceDecoder::new(AudioFormat::new(44100, 1)).is_err());
    }

    #[test]
    fn test_decode_garbage_is_error_not_panic() {
        let format = AudioFormat::new(48000, 1);
        let mut decoder = OpusVoiceDecoder::new(format).unwrap();
        let mut pcm = vec![0.0f32; format.samples_per_voice_frame()];
        // Opus may decode arbitrary bytes or report an error; either way no
        // panic and no oversized write.
        let _ = decoder.decode(&[0xAB; 17], &mut pcm);
    }
}
