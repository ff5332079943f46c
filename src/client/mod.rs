//! Client side: capture → aggregate → encode → send, gated by liveness.

pub mod aggregator;
pub mod capture;
pub mod liveness;
pub mod sender;

pub use aggregator::FrameAggregator;
pub use capture::{Capture, CaptureFactory, DeviceCapture};
pub use liveness::{ClientLiveness, ConnectionStatus, LivenessHandle};
pub use sender::Transmitter;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::codec::opus::OpusVoiceEncoder;
use crate::codec::pcm::RawPcmEncoder;
use crate::codec::{AudioFormat, VoiceEncoder, MAX_PAYLOAD};
use crate::config::Config;
use crate::error::Error;
use crate::protocol::Handshake;

/// Sample rates the voice codec accepts.
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Hooks into the embedding application. All optional.
#[derive(Default)]
pub struct ClientCallbacks {
    /// Human-readable error reports from the worker thread.
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// Pipeline started/stopped.
    pub on_status: Option<Box<dyn Fn(bool) + Send + Sync>>,
}

impl ClientCallbacks {
    fn error(&self, message: &str) {
        warn!("client: {}", message);
        if let Some(cb) = &self.on_error {
            cb(message);
        }
    }

    fn status(&self, active: bool) {
        if let Some(cb) = &self.on_status {
            cb(active);
        }
    }
}

/// Worker counters, readable from any thread.
#[derive(Default)]
struct ClientStats {
    frames_captured: AtomicU64,
    packets_sent: AtomicU64,
    frames_gated: AtomicU64,
    encode_errors: AtomicU64,
    send_failures: AtomicU64,
}

/// Snapshot of the client counters.
#[derive(Debug, Default, Clone)]
pub struct ClientStatsSnapshot {
    pub frames_captured: u64,
    pub packets_sent: u64,
    /// Encoded frames skipped because the client was paused or disconnected.
    pub frames_gated: u64,
    pub encode_errors: u64,
    pub send_failures: u64,
}

/// The microphone client: one capture worker thread plus the liveness
/// monitor thread.
pub struct MicClient {
    config: Config,
    dest: SocketAddr,
    callbacks: Arc<ClientCallbacks>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    liveness: ClientLiveness,
    stats: Arc<ClientStats>,
    active: bool,
}

impl MicClient {
    /// Resolve the host address and bind the liveness socket. No audio
    /// resources are touched until [`start`](Self::start).
    pub fn new(config: Config, callbacks: ClientCallbacks) -> Result<Self, Error> {
        let ip: IpAddr = config
            .client
            .host_ip
            .parse()
            .map_err(|_| Error::FatalInit(format!("bad host address {:?}", config.client.host_ip)))?;
        let dest = SocketAddr::new(ip, config.client.port);

        let liveness = ClientLiveness::start(config.client.liveness_port)?;

        Ok(Self {
            config,
            dest,
            callbacks: Arc::new(callbacks),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            liveness,
            stats: Arc::new(ClientStats::default()),
            active: false,
        })
    }

    /// Start streaming from the default input device.
    pub fn start(&mut self) -> Result<(), Error> {
        let rate = self.config.audio.sample_rate;
        self.start_with_capture(Box::new(move || {
            DeviceCapture::open(rate).map(|c| Box::new(c) as Box<dyn Capture>)
        }))
    }

    /// Start streaming from a caller-provided capture backend.
    ///
    /// The factory runs on the worker thread because device capture objects
    /// are tied to the thread that drains them.
    pub fn start_with_capture(&mut self, factory: CaptureFactory) -> Result<(), Error> {
        if self.active {
            return Err(Error::FatalInit("client already running".to_string()));
        }

        self.running.store(true, Ordering::SeqCst);

        let (init_tx, init_rx) = mpsc::channel::<Result<(), Error>>();
        let config = self.config.clone();
        let dest = self.dest;
        let running = self.running.clone();
        let handle = self.liveness.handle();
        let stats = self.stats.clone();
        let callbacks = self.callbacks.clone();

        let worker = thread::spawn(move || {
            worker_loop(config, dest, factory, init_tx, running, handle, stats, callbacks);
        });

        match init_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(worker);
                self.active = true;
                self.callbacks.status(true);
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                let _ = worker.join();
                Err(Error::FatalInit("capture worker died during init".to_string()))
            }
        }
    }

    pub fn stop(&mut self) {
        if !self.active {
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.active = false;
        self.callbacks.status(false);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Connection/pause state as seen by the liveness monitor.
    pub fn liveness(&self) -> LivenessHandle {
        self.liveness.handle()
    }

    /// Local liveness port (where the host must send pings).
    pub fn liveness_port(&self) -> u16 {
        self.liveness.local_addr().port()
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            frames_captured: self.stats.frames_captured.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            frames_gated: self.stats.frames_gated.load(Ordering::Relaxed),
            encode_errors: self.stats.encode_errors.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MicClient {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    config: Config,
    dest: SocketAddr,
    factory: CaptureFactory,
    init_tx: mpsc::Sender<Result<(), Error>>,
    running: Arc<AtomicBool>,
    liveness: LivenessHandle,
    stats: Arc<ClientStats>,
    callbacks: Arc<ClientCallbacks>,
) {
    let mut capture = match factory() {
        Ok(c) => c,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    let native_rate = capture.native_sample_rate();
    let capture_channels = capture.channels().max(1);
    let stream_channels = config.audio.channels.clamp(1, 2);

    let mut raw = config.audio.raw_pcm;
    if !raw && !OPUS_RATES.contains(&native_rate) {
        callbacks.error(&format!(
            "capture rate {} Hz not encodable, falling back to raw PCM",
            native_rate
        ));
        raw = true;
    }

    let format = AudioFormat::new(native_rate, stream_channels);
    let mut encoder: Box<dyn VoiceEncoder> = if raw {
        Box::new(RawPcmEncoder::new(format))
    } else {
        match OpusVoiceEncoder::new(format, config.audio.bitrate) {
            Ok(enc) => Box::new(enc),
            Err(e) => {
                let _ = init_tx.send(Err(Error::FatalInit(format!("encoder: {}", e))));
                capture.close();
                return;
            }
        }
    };

    let mut transmitter = match Transmitter::new(dest) {
        Ok(t) => t,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            capture.close();
            return;
        }
    };

    let _ = init_tx.send(Ok(()));
    info!(
        "client streaming to {} ({} Hz, {} ch, {})",
        dest,
        native_rate,
        stream_channels,
        if raw { "raw pcm" } else { "opus" }
    );

    let handshake = Handshake {
        pair_status: u8::from(config.sunshine.paired),
        unique_id: config.client.unique_id_bytes(),
        device_name: config.client.device_name.clone(),
        display_width: 0,
        display_height: 0,
        flags: 0,
    };
    transmitter.send_handshake(&handshake);
    let mut handshake_generation = liveness.connect_generation();
    let mut last_announce = std::time::Instant::now();

    let mut aggregator = FrameAggregator::new(format.samples_per_voice_frame());
    let mut grain = vec![0.0f32; 4096 * capture_channels as usize];
    let mut converted: Vec<f32> = Vec::new();
    let mut frame = vec![0.0f32; format.samples_per_voice_frame()];
    let mut payload = [0u8; MAX_PAYLOAD];

    while running.load(Ordering::SeqCst) {
        let frames = match capture.read(&mut grain) {
            Ok(0) => continue,
            Ok(n) => n,
            Err(e) => {
                callbacks.error(&format!("audio capture failed: {}", e));
                break;
            }
        };
        stats.frames_captured.fetch_add(frames as u64, Ordering::Relaxed);

        let samples = frames * capture_channels as usize;
        let pcm = if capture_channels == stream_channels {
            &grain[..samples]
        } else {
            convert_channels(
                &grain[..samples],
                capture_channels as usize,
                stream_channels as usize,
                &mut converted,
            );
            &converted[..]
        };
        aggregator.push(pcm);

        // Re-announce after every reconnect, and keep announcing while the
        // host is silent: admission on the host side only ever starts from
        // a handshake.
        let generation = liveness.connect_generation();
        if generation != handshake_generation && liveness.is_connected() {
            transmitter.send_handshake(&handshake);
            handshake_generation = generation;
            last_announce = std::time::Instant::now();
        } else if !liveness.is_connected() && last_announce.elapsed().as_millis() > 2000 {
            transmitter.send_handshake(&handshake);
            last_announce = std::time::Instant::now();
        }

        while aggregator.pop_frame(&mut frame) {
            // Capture drains even while gated to keep the audio stack primed;
            // only the send is skipped.
            if !liveness.is_connected() || liveness.is_paused() {
                stats.frames_gated.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let bytes = match encoder.encode(&frame, &mut payload) {
                Ok(n) => n,
                Err(e) => {
                    stats.encode_errors.fetch_add(1, Ordering::Relaxed);
                    callbacks.error(&format!("encode failed: {}", e));
                    continue;
                }
            };

            if transmitter.send_audio(&payload[..bytes], native_rate, raw) {
                stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.send_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    capture.close();
}

/// Interleaved channel conversion between the capture layout and the stream
/// layout. Only mono and stereo exist on either side.
fn convert_channels(input: &[f32], in_ch: usize, out_ch: usize, out: &mut Vec<f32>) {
    let frames = input.len() / in_ch;
    out.clear();
    out.reserve(frames * out_ch);

    for frame in 0..frames {
        let base = frame * in_ch;
        // Collapse to mono first; widening duplicates it.
        let mono = if in_ch == 1 {
            input[base]
        } else {
            input[base..base + in_ch].iter().sum::<f32>() / in_ch as f32
        };

        if out_ch == 1 {
            out.push(mono);
        } else if in_ch >= 2 {
            out.push(input[base]);
            out.push(input[base + 1]);
        } else {
            out.push(mono);
            out.push(mono);
        }
    }
}
