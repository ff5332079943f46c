//! Jitter-absorbing ring buffer between the receive thread and the output
//! device callback.
//!
//! One mutex guards the whole ring; both sides hold it only for a bounded
//! sample copy, which is safe inside a device callback. Capacity is ~800 ms
//! at the device rate: generous on purpose, because the stream coexists with
//! a game-streaming session and bursty scheduling there must not turn into
//! audible underruns here. A full ring drops incoming samples and counts
//! them; an empty ring yields silence.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring depth as a fraction of one second at the device rate.
const RING_SECONDS: f32 = 0.8;

struct Inner {
    buffer: Vec<f32>,
    read: usize,
    write: usize,
}

impl Inner {
    /// Occupied samples. Invariant: `count = (write + cap - read) % cap`.
    fn count(&self) -> usize {
        let cap = self.buffer.len();
        (self.write + cap - self.read) % cap
    }
}

/// Mutex-guarded single-producer/single-consumer float ring with channel
/// up-mix on the write side and format conversion on the read side.
pub struct RingMixer {
    inner: Mutex<Inner>,
    /// Slots in the buffer; one is reserved to tell full from empty.
    capacity: usize,
    channels: usize,
    overflows: AtomicU64,
    underruns: AtomicU64,
}

impl RingMixer {
    /// `device_rate`/`device_channels` describe the output side the callback
    /// pulls for.
    pub fn new(device_rate: u32, device_channels: u16) -> Self {
        let channels = device_channels.max(1) as usize;
        let capacity = ((device_rate as f32 * RING_SECONDS) as usize).max(1) * channels;

        Self {
            inner: Mutex::new(Inner {
                buffer: vec![0.0; capacity],
                read: 0,
                write: 0,
            }),
            capacity,
            channels,
            overflows: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        }
    }

    /// Write interleaved samples with `src_channels` layout, up-mixing to
    /// the device layout. Returns the number of device-layout samples
    /// committed; the rest were dropped against a full buffer.
    pub fn write(&self, samples: &[f32], src_channels: u16) -> usize {
        let src_channels = src_channels.max(1) as usize;
        let frames = samples.len() / src_channels;

        let mut inner = self.inner.lock();
        let cap = self.capacity;
        let mut written = 0usize;
        let mut dropped = 0usize;

        'frames: for frame in 0..frames {
            let base = frame * src_channels;
            for ch in 0..self.channels {
                let next_write = (inner.write + 1) % cap;
                if next_write == inner.read {
                    // Full: everything from here on is dropped, reported,
                    // never blocked on.
                    dropped += (frames - frame) * self.channels - (ch);
                    break 'frames;
                }

                let value = mix_channel(&samples[base..base + src_channels], ch, self.channels);
                let write = inner.write;
                inner.buffer[write] = value;
                inner.write = next_write;
                written += 1;
            }
        }

        if dropped > 0 {
            self.overflows.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        written
    }

    /// Fill `out` with float samples, zero-filling past the buffered data.
    /// Always writes the whole slice.
    pub fn read_f32(&self, out: &mut [f32]) -> usize {
        let mut inner = self.inner.lock();
        let cap = self.capacity;
        let mut filled = 0usize;

        while filled < out.len() && inner.read != inner.write {
            out[filled] = inner.buffer[inner.read];
            inner.read = (inner.read + 1) % cap;
            filled += 1;
        }
        drop(inner);

        if filled < out.len() {
            out[filled..].fill(0.0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        filled
    }

    /// Fill `out` with i16 samples ([-1,1] clipped symmetrically), padding
    /// with silence past the buffered data.
    pub fn read_i16(&self, out: &mut [i16]) -> usize {
        let mut inner = self.inner.lock();
        let cap = self.capacity;
        let mut filled = 0usize;

        while filled < out.len() && inner.read != inner.write {
            let value = inner.buffer[inner.read].clamp(-1.0, 1.0);
            out[filled] = (value * 32767.0) as i16;
            inner.read = (inner.read + 1) % cap;
            filled += 1;
        }
        drop(inner);

        if filled < out.len() {
            out[filled..].fill(0);
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }
        filled
    }

    /// Drop all buffered samples (new session).
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.read = 0;
        inner.write = 0;
    }

    /// Samples currently buffered.
    pub fn occupied(&self) -> usize {
        self.inner.lock().count()
    }

    /// Usable capacity in samples (one slot reserved).
    pub fn capacity(&self) -> usize {
        self.capacity - 1
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Fill level 0.0–1.0, for status displays.
    pub fn fill_ratio(&self) -> f32 {
        self.occupied() as f32 / self.capacity() as f32
    }
}

/// One output-channel sample from one source frame: mono duplicates into the
/// front pair and leaves the rest silent; matching layouts pass through; a
/// wider source collapses to an average for a mono device.
fn mix_channel(frame: &[f32], out_ch: usize, out_channels: usize) -> f32 {
    match frame.len() {
        1 => {
            if out_ch < 2 {
                frame[0]
            } else {
                0.0
            }
        }
        n if out_channels == 1 => frame.iter().sum::<f32>() / n as f32,
        n => {
            if out_ch < n {
                frame[out_ch]
            } else {
                0.0
            }
        }
    }
}
