//! Frame aggregation between the capture grain and the encoder frame.
//!
//! The hardware grain rarely matches the 20 ms frame the voice codec wants
//! (256-frame grains against 320-frame codec frames at 16 kHz). Samples
//! accumulate here until a full codec frame exists; partial frames wait for
//! the next grain and are never padded with silence.

/// Accumulates interleaved samples and emits fixed-size frames.
pub struct FrameAggregator {
    buffer: Vec<f32>,
    frame_samples: usize,
}

impl FrameAggregator {
    /// `frame_samples` is the total interleaved sample count of one encoder
    /// frame (frames × channels).
    pub fn new(frame_samples: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(frame_samples * 2),
            frame_samples,
        }
    }

    /// Append one capture grain.
    pub fn push(&mut self, samples: &[f32]) {
        self.buffer.extend_from_slice(samples);
    }

    /// Whether at least one full frame is buffered.
    pub fn frame_ready(&self) -> bool {
        self.buffer.len() >= self.frame_samples
    }

    /// Move one frame into `out` (must hold `frame_samples` samples) and
    /// shift the remainder. Returns false if no full frame is buffered.
    pub fn pop_frame(&mut self, out: &mut [f32]) -> bool {
        if !self.frame_ready() || out.len() < self.frame_samples {
            return false;
        }

        out[..self.frame_samples].copy_from_slice(&self.buffer[..self.frame_samples]);
        self.buffer.drain(..self.frame_samples);
        true
    }

    /// Samples currently waiting for a full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Frame size this aggregator emits.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    /// Discard buffered samples (stream restart).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grain_smaller_than_frame() {
        // Vita-style: 256-sample grains into 320-sample frames.
        let mut agg = FrameAggregator::new(320);
        let mut frame = [0.0f32; 320];

        agg.push(&vec![1.0; 256]);
        assert!(!agg.frame_ready());
        assert!(!agg.pop_frame(&mut frame));

        agg.push(&vec![2.0; 256]);
        assert!(agg.frame_ready());
        assert!(agg.pop_frame(&mut frame));
        assert_eq!(agg.pending(), 192);

        // First 256 samples from the first grain, rest from the second.
        assert!(frame[..256].iter().all(|&s| s == 1.0));
        assert!(frame[256..].iter().all(|&s| s == 2.0));
    }

    #[test]
    fn test_conservation_property() {
        // For grains summing to k frames, exactly k frames come out, order
        // preserved, nothing padded.
        let frame_size = 320;
        let grain_sizes = [256usize, 256, 64, 320, 384, 192, 128];
        let total: usize = grain_sizes.iter().sum();
        assert_eq!(total % frame_size, 0);
        let k = total / frame_size;

        let mut agg = FrameAggregator::new(frame_size);
        let mut next_value = 0.0f32;
        let mut emitted = Vec::new();
        let mut frame = vec![0.0f32; frame_size];

        for &size in &grain_sizes {
            let grain: Vec<f32> = (0..size)
                .map(|_| {
                    let v = next_value;
                    next_value += 1.0;
                    v
                })
                .collect();
            agg.push(&grain);

            while agg.pop_frame(&mut frame) {
                emitted.extend_from_slice(&frame);
            }
        }

        assert_eq!(emitted.len(), k * frame_size);
        assert_eq!(agg.pending(), 0);
        for (i, &v) in emitted.iter().enumerate() {
            assert_eq!(v, i as f32);
        }
    }

    #[test]
    fn test_multiple_frames_from_one_grain() {
        let mut agg = FrameAggregator::new(100);
        agg.push(&vec![0.5; 250]);

        let mut frame = [0.0f32; 100];
        assert!(agg.pop_frame(&mut frame));
        assert!(agg.pop_frame(&mut frame));
        assert!(!agg.pop_frame(&mut frame));
        assert_eq!(agg.pending(), 50);
    }

    #[test]
    fn test_clear() {
        let mut agg = FrameAggregator::new(100);
        agg.push(&vec![0.1; 70]);
        agg.clear();
        assert_eq!(agg.pending(), 0);
    }
}
