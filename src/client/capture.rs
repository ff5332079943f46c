//! Microphone capture.
//!
//! Platforms differ in what a capture read returns: a handheld voice input
//! hands out fixed 256-frame grains at 16 kHz, a desktop backend delivers
//! 480-frame fragments at 48 kHz. The `Capture` trait does not hide the
//! grain; each `read` blocks until one grain is available and returns it
//! whole so the aggregator can do the frame-size matching.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{debug, warn};

use crate::error::Error;
use crate::net::POLL_TIMEOUT;

/// Capture backend interface.
///
/// Implementations are used from a single worker thread; they do not need to
/// be `Send` because the device is opened on the thread that drains it.
pub trait Capture {
    /// The rate the hardware actually runs at. The rate requested at open
    /// time is only a hint.
    fn native_sample_rate(&self) -> u32;

    /// Channel count of the frames `read` returns.
    fn channels(&self) -> u16;

    /// Block until one grain is available and copy it into `buffer`
    /// (interleaved f32). Returns the number of frames read; 0 means no data
    /// arrived within the poll interval (or shutdown), not end of stream.
    fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Error>;

    /// Release the device.
    fn close(&mut self);
}

/// Builds a capture backend on the worker thread that will drain it.
pub type CaptureFactory = Box<dyn FnOnce() -> Result<Box<dyn Capture>, Error> + Send>;

/// Grains queued between the device callback and `read` before the callback
/// starts dropping.
const GRAIN_QUEUE_DEPTH: usize = 8;

/// Default-device capture backed by a cpal input stream.
///
/// cpal drives a callback from its own realtime thread; a bounded channel
/// turns that into the blocking-read model the pipeline wants. The callback
/// never blocks: if the worker falls behind, grains are dropped and counted.
pub struct DeviceCapture {
    stream: Option<cpal::Stream>,
    rx: Receiver<Vec<f32>>,
    pending: Vec<f32>,
    pending_pos: usize,
    sample_rate: u32,
    channels: u16,
    failed: Arc<AtomicBool>,
    overruns: Arc<AtomicU64>,
}

impl DeviceCapture {
    /// Open the default input device at its native configuration.
    ///
    /// `requested_rate` is a hint only; the caller must re-read the actual
    /// rate through [`Capture::native_sample_rate`].
    pub fn open(requested_rate: u32) -> Result<Self, Error> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| Error::FatalInit("no default input device".to_string()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| Error::FatalInit(format!("input config: {}", e)))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        if sample_rate != requested_rate {
            debug!(
                "capture: requested {} Hz, device native {} Hz",
                requested_rate, sample_rate
            );
        }

        let config = cpal::StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(GRAIN_QUEUE_DEPTH);
        let failed = Arc::new(AtomicBool::new(false));
        let overruns = Arc::new(AtomicU64::new(0));

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                Self::build_stream::<f32>(&device, &config, tx, failed.clone(), overruns.clone())?
            }
            cpal::SampleFormat::I16 => {
                Self::build_stream::<i16>(&device, &config, tx, failed.clone(), overruns.clone())?
            }
            cpal::SampleFormat::U16 => {
                Self::build_stream::<u16>(&device, &config, tx, failed.clone(), overruns.clone())?
            }
            other => {
                return Err(Error::FatalInit(format!(
                    "unsupported capture sample format {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| Error::FatalInit(format!("capture start: {}", e)))?;

        Ok(Self {
            stream: Some(stream),
            rx,
            pending: Vec::new(),
            pending_pos: 0,
            sample_rate,
            channels,
            failed,
            overruns,
        })
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        tx: SyncSender<Vec<f32>>,
        failed: Arc<AtomicBool>,
        overruns: Arc<AtomicU64>,
    ) -> Result<cpal::Stream, Error>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let err_failed = failed.clone();
        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let grain: Vec<f32> =
                        data.iter().map(|&s| f32::from_sample(s)).collect();
                    match tx.try_send(grain) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            overruns.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Disconnected(_)) => {}
                    }
                },
                move |e| {
                    warn!("capture stream error: {}", e);
                    err_failed.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| Error::FatalInit(format!("capture open: {}", e)))?;

        Ok(stream)
    }

    /// Grains dropped because the worker fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Capture for DeviceCapture {
    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Error> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(Error::SessionFault("capture device error".to_string()));
        }

        if self.pending_pos >= self.pending.len() {
            match self.rx.recv_timeout(POLL_TIMEOUT) {
                Ok(grain) => {
                    self.pending = grain;
                    self.pending_pos = 0;
                }
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::SessionFault("capture stream closed".to_string()))
                }
            }
        }

        let channels = self.channels as usize;
        let available = self.pending.len() - self.pending_pos;
        let samples = available.min(buffer.len() - buffer.len() % channels);
        buffer[..samples]
            .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + samples]);
        self.pending_pos += samples;

        Ok(samples / channels)
    }

    fn close(&mut self) {
        // Dropping the stream stops the callback and disconnects the channel.
        self.stream.take();
    }
}

impl Drop for DeviceCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Deterministic capture used by pipeline tests: replays a fixed schedule of
/// grains, then reports shutdown.
#[cfg(test)]
pub(crate) struct ScriptedCapture {
    grains: std::collections::VecDeque<Vec<f32>>,
    sample_rate: u32,
    channels: u16,
}

#[cfg(test)]
impl ScriptedCapture {
    pub(crate) fn new(sample_rate: u32, channels: u16, grains: Vec<Vec<f32>>) -> Self {
        Self {
            grains: grains.into(),
            sample_rate,
            channels,
        }
    }
}

#[cfg(test)]
impl Capture for ScriptedCapture {
    fn native_sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }

    fn read(&mut self, buffer: &mut [f32]) -> Result<usize, Error> {
        match self.grains.pop_front() {
            Some(grain) => {
                let samples = grain.len().min(buffer.len());
                buffer[..samples].copy_from_slice(&grain[..samples]);
                Ok(samples / self.channels as usize)
            }
            None => Err(Error::SessionFault("script exhausted".to_string())),
        }
    }

    fn close(&mut self) {}
}
