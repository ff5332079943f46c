//! Pull-mode audio output feeding the virtual capture endpoint.
//!
//! The render target is normally the input side of a virtual cable (so local
//! applications see the stream as a microphone); in debug mode it is the
//! default playback device. The device callback pulls from the
//! [`RingMixer`]; everything upstream only ever touches the ring.

use std::sync::Arc;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, info, warn};

use crate::error::Error;
use crate::host::ring::RingMixer;

/// Rates tried when the device refuses the stream rate, in order.
const FALLBACK_RATES: [u32; 4] = [96000, 48000, 44100, 16000];

/// Owns the output device stream and the ring that feeds it.
pub struct OutputRenderer {
    stream: Option<cpal::Stream>,
    ring: Arc<RingMixer>,
    device_name: String,
    actual_rate: u32,
    channels: u16,
}

impl OutputRenderer {
    /// Open the output endpoint and start pulling.
    ///
    /// `device_hint` is a case-sensitive name fragment; empty or
    /// `use_speakers` selects the system default playback device.
    /// `preferred_rate` is the stream rate; if the device refuses it the
    /// ladder {device default, 96 kHz, 48 kHz, 44.1 kHz, 16 kHz} is walked
    /// and the winning rate is reported via
    /// [`actual_sample_rate`](Self::actual_sample_rate) so the resampler can
    /// retarget.
    pub fn open(device_hint: &str, use_speakers: bool, preferred_rate: u32) -> Result<Self, Error> {
        let host = cpal::default_host();

        let device = if use_speakers || device_hint.is_empty() {
            host.default_output_device()
                .ok_or_else(|| Error::FatalInit("no default output device".to_string()))?
        } else {
            find_device(&host, device_hint)?
        };

        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = device
            .default_output_config()
            .map_err(|e| Error::FatalInit(format!("output config: {}", e)))?;

        let device_rate = supported.sample_rate().0;
        let sample_format = supported.sample_format();
        let mut channels = supported.channels().max(1);
        // Windows kernel-streaming drivers commonly reject single-channel
        // opens; a mono endpoint is widened and fed duplicated samples.
        if cfg!(windows) && channels == 1 {
            channels = 2;
        }

        info!(
            "output device: {} ({} Hz native, {} ch, {:?})",
            device_name, device_rate, channels, sample_format
        );

        let mut rates = Vec::with_capacity(2 + FALLBACK_RATES.len());
        for rate in std::iter::once(preferred_rate)
            .chain(std::iter::once(device_rate))
            .chain(FALLBACK_RATES)
        {
            if rate != 0 && !rates.contains(&rate) {
                rates.push(rate);
            }
        }

        let mut last_error = String::new();
        for &rate in &rates {
            let ring = Arc::new(RingMixer::new(rate, channels));
            match build_stream(&device, sample_format, rate, channels, ring.clone()) {
                Ok(stream) => {
                    if let Err(e) = stream.play() {
                        last_error = format!("start at {} Hz: {}", rate, e);
                        continue;
                    }
                    if rate != preferred_rate {
                        warn!("output opened at fallback rate {} Hz", rate);
                    }
                    return Ok(Self {
                        stream: Some(stream),
                        ring,
                        device_name,
                        actual_rate: rate,
                        channels,
                    });
                }
                Err(e) => {
                    debug!("output open at {} Hz failed: {}", rate, e);
                    last_error = format!("open at {} Hz: {}", rate, e);
                }
            }
        }

        Err(Error::FatalInit(format!(
            "output device {} rejected every rate ({})",
            device_name, last_error
        )))
    }

    /// The ring the host pipeline writes decoded audio into.
    pub fn ring(&self) -> Arc<RingMixer> {
        self.ring.clone()
    }

    /// Rate the device actually opened at.
    pub fn actual_sample_rate(&self) -> u32 {
        self.actual_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn close(&mut self) {
        self.stream.take();
    }
}

impl Drop for OutputRenderer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Pick an output device whose name contains `hint`.
///
/// A virtual cable is usually configured by its capture-side name; the
/// renderer must open the matching playback endpoint, so "CABLE Output"
/// also matches the cable's "CABLE Input" side.
fn find_device(host: &cpal::Host, hint: &str) -> Result<cpal::Device, Error> {
    let cable_alias = hint.contains("CABLE Output");

    let devices = host
        .output_devices()
        .map_err(|e| Error::FatalInit(format!("enumerate outputs: {}", e)))?;

    for device in devices {
        let name = match device.name() {
            Ok(n) => n,
            Err(_) => continue,
        };
        if name.contains(hint) || (cable_alias && name.contains("CABLE Input")) {
            info!("matched output device: {}", name);
            return Ok(device);
        }
    }

    warn!("no output device matches {:?}, using default", hint);
    host.default_output_device()
        .ok_or_else(|| Error::FatalInit("no default output device".to_string()))
}

fn build_stream(
    device: &cpal::Device,
    sample_format: cpal::SampleFormat,
    rate: u32,
    channels: u16,
    ring: Arc<RingMixer>,
) -> Result<cpal::Stream, Error> {
    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(rate),
        // Kernel-streaming paths want an explicit, roomy buffer; elsewhere
        // the device default is the stable choice.
        buffer_size: if cfg!(windows) {
            cpal::BufferSize::Fixed(1024)
        } else {
            cpal::BufferSize::Default
        },
    };

    let err_fn = |e| warn!("output stream error: {}", e);

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    ring.read_f32(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::FatalInit(e.to_string()))?,
        cpal::SampleFormat::I16 => device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    ring.read_i16(data);
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::FatalInit(e.to_string()))?,
        cpal::SampleFormat::U16 => {
            // Pull as i16 and rebias; avoids a second ring path. The scratch
            // buffer lives in the closure so the callback never allocates in
            // steady state.
            let mut signed: Vec<i16> = Vec::new();
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                        signed.resize(data.len(), 0);
                        ring.read_i16(&mut signed);
                        for (dst, &s) in data.iter_mut().zip(signed.iter()) {
                            *dst = (s as i32 + 32768) as u16;
                        }
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| Error::FatalInit(e.to_string()))?
        }
        other => {
            return Err(Error::FatalInit(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };

    Ok(stream)
}
