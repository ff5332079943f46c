//! Stream-rate to device-rate conversion.
//!
//! The decoder emits PCM at whatever rate the client captures at (a handheld
//! voice input may be fixed at 16 kHz) while the output device runs at its
//! own rate. Sinc interpolation at voice-grade parameters bridges the two.
//! When the rates already match the pipeline bypasses this module entirely.

use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

use super::CodecError;

/// Sample-rate converter for a fixed (input rate, output rate, chunk size).
///
/// Rebuilt by the owner whenever the stream rate, the per-packet frame count
/// or the output rate changes; the packet cadence makes the chunk size
/// constant in steady state.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    in_rate: u32,
    out_rate: u32,
    channels: usize,
    chunk_frames: usize,
    staging: Vec<Vec<f32>>,
    output: Vec<f32>,
}

impl StreamResampler {
    pub fn new(
        in_rate: u32,
        out_rate: u32,
        channels: u16,
        chunk_frames: usize,
    ) -> Result<Self, CodecError> {
        if in_rate == 0 || out_rate == 0 || channels == 0 || chunk_frames == 0 {
            return Err(CodecError::InvalidInput);
        }

        let params = SincInterpolationParameters {
            sinc_len: 128,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let ratio = out_rate as f64 / in_rate as f64;
        let channels = channels as usize;

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_frames, channels)
            .map_err(|e| CodecError::Library(format!("resampler create: {}", e)))?;

        Ok(Self {
            resampler,
            in_rate,
            out_rate,
            channels,
            chunk_frames,
            staging: vec![vec![0.0; chunk_frames]; channels],
            output: Vec::new(),
        })
    }

    /// Convert one chunk of interleaved PCM.
    ///
    /// `input` must hold exactly `chunk_frames × channels` samples; the
    /// owner rebuilds the resampler when the packet size changes. Returns the
    /// converted interleaved samples (length varies by ±1 frame around the
    /// rate ratio).
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32], CodecError> {
        if input.len() != self.chunk_frames * self.channels {
            return Err(CodecError::InvalidInput);
        }

        for ch in 0..self.channels {
            let lane = &mut self.staging[ch];
            for (frame, sample) in lane.iter_mut().enumerate() {
                *sample = input[frame * self.channels + ch];
            }
        }

        let converted = self
            .resampler
            .process(&self.staging, None)
            .map_err(|e| CodecError::Library(format!("resample: {}", e)))?;

        let out_frames = converted.first().map(|c| c.len()).unwrap_or(0);
        self.output.resize(out_frames * self.channels, 0.0);
        for ch in 0..self.channels {
            for frame in 0..out_frames {
                self.output[frame * self.channels + ch] = converted[ch][frame];
            }
        }

        Ok(&self.output)
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    pub fn out_rate(&self) -> u32 {
        self.out_rate
    }

    /// Frames expected per [`process`](Self::process) call.
    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }
}
