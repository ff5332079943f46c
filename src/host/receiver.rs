//! Host receive pipeline: UDP ingest → admission → decode → resample →
//! ring write.
//!
//! One thread blocks on the audio socket and runs the whole chain inline;
//! there is no queue between receive and ring write. Packets are consumed in
//! arrival order with no reordering buffer; the voice codec degrades
//! gracefully on the occasional late packet.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::opus::OpusVoiceDecoder;
use crate::codec::pcm::RawPcmDecoder;
use crate::codec::resample::StreamResampler;
use crate::codec::{AudioFormat, VoiceDecoder};
use crate::config::Config;
use crate::error::Error;
use crate::host::admission::{AdmissionController, AdmissionOutcome, HostCallbacks};
use crate::host::heartbeat::{HeartbeatHandle, HeartbeatMonitor};
use crate::host::output::OutputRenderer;
use crate::host::ring::RingMixer;
use crate::host::stats::{HostStats, StatsSnapshot};
use crate::net::UdpEndpoint;
use crate::protocol::{
    peek_magic, AudioPacket, PacketHeader, PongPacket, AUDIO_MAGIC, HANDSHAKE_MAGIC,
    HANDSHAKE_MAGIC_ALT, HEADER_SIZE, PONG_MAGIC,
};

/// Kernel backlog above which ingress counts as lagging.
const LAG_BACKLOG_BYTES: usize = 2048;

/// No admitted audio for this long destroys the session.
const SESSION_TIMEOUT: Duration = Duration::from_secs(2);

/// Decode headroom: 120 ms at 48 kHz, the longest frame Opus can emit.
const MAX_DECODE_FRAMES: usize = 5760;

/// Decoder selected by the packet header (rate + raw flag).
enum ActiveDecoder {
    None,
    Opus(OpusVoiceDecoder),
    Raw(RawPcmDecoder),
}

impl ActiveDecoder {
    fn decode(&mut self, data: &[u8], output: &mut [f32]) -> Result<usize, String> {
        match self {
            ActiveDecoder::None => Err("no decoder".to_string()),
            ActiveDecoder::Opus(dec) => dec.decode(data, output).map_err(|e| e.to_string()),
            ActiveDecoder::Raw(dec) => dec.decode(data, output).map_err(|e| e.to_string()),
        }
    }
}

/// The decode → resample → ring-write chain for the admitted stream.
///
/// Owned by the receive thread; rebuilt pieces (decoder, resampler) follow
/// the packet headers, the ring follows the output device.
struct StreamPipeline {
    ring: Arc<RingMixer>,
    output_rate: u32,
    channels: u16,
    decoder: ActiveDecoder,
    /// (rate, raw) the current decoder was built for.
    decoder_key: Option<(u32, bool)>,
    resampler: Option<StreamResampler>,
    pcm: Vec<f32>,
}

impl StreamPipeline {
    fn new(ring: Arc<RingMixer>, output_rate: u32, channels: u16) -> Self {
        Self {
            ring,
            output_rate,
            channels,
            decoder: ActiveDecoder::None,
            decoder_key: None,
            resampler: None,
            pcm: vec![0.0; MAX_DECODE_FRAMES * channels.max(1) as usize],
        }
    }

    /// Drop decoder, resampler and buffered audio (new session).
    fn reset(&mut self) {
        self.decoder = ActiveDecoder::None;
        self.decoder_key = None;
        self.resampler = None;
        self.ring.clear();
    }

    /// Run one admitted audio packet through the chain. Returns false when
    /// the packet was dropped (decode failure or rebuild failure).
    fn handle_audio(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        stats: &HostStats,
        callbacks: &HostCallbacks,
    ) -> bool {
        if payload.is_empty() {
            // Header-only datagram: legal, carries nothing.
            return true;
        }

        let rate = header.sample_rate();
        let raw = header.is_raw();

        if self.decoder_key != Some((rate, raw)) {
            if let Some((old_rate, _)) = self.decoder_key {
                info!("stream rate change {} -> {} Hz", old_rate, rate);
            }
            if !self.rebuild_decoder(rate, raw, stats, callbacks) {
                return false;
            }
        }

        let frames = match self.decoder.decode(payload, &mut self.pcm) {
            Ok(f) => f,
            Err(e) => {
                stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                callbacks.error(&format!("decode failed: {}", e));
                return false;
            }
        };
        if frames == 0 {
            return true;
        }

        let samples = frames * self.channels as usize;
        if rate == self.output_rate {
            self.ring.write(&self.pcm[..samples], self.channels);
            return true;
        }

        // Resampler keyed on (input rate, chunk size); the chunk is constant
        // in steady state, so a rebuild only happens on stream changes.
        let needs_rebuild = match &self.resampler {
            Some(rs) => rs.in_rate() != rate || rs.chunk_frames() != frames,
            None => true,
        };
        if needs_rebuild {
            match StreamResampler::new(rate, self.output_rate, self.channels, frames) {
                Ok(rs) => self.resampler = Some(rs),
                Err(e) => {
                    stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                    callbacks.error(&format!("resampler rebuild: {}", e));
                    self.resampler = None;
                    return false;
                }
            }
        }

        let resampler = match self.resampler.as_mut() {
            Some(rs) => rs,
            None => return false,
        };
        match resampler.process(&self.pcm[..samples]) {
            Ok(converted) => {
                self.ring.write(converted, self.channels);
                true
            }
            Err(e) => {
                stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                callbacks.error(&format!("resample failed: {}", e));
                false
            }
        }
    }

    fn rebuild_decoder(
        &mut self,
        rate: u32,
        raw: bool,
        stats: &HostStats,
        callbacks: &HostCallbacks,
    ) -> bool {
        let format = AudioFormat::new(rate, self.channels);

        let decoder = if raw {
            if rate == 0 {
                Err("raw stream with zero rate".to_string())
            } else {
                Ok(ActiveDecoder::Raw(RawPcmDecoder::new(format)))
            }
        } else {
            OpusVoiceDecoder::new(format)
                .map(ActiveDecoder::Opus)
                .map_err(|e| e.to_string())
        };

        match decoder {
            Ok(dec) => {
                self.decoder = dec;
                self.decoder_key = Some((rate, raw));
                debug!(
                    "decoder ready: {} Hz, {} ch, {}",
                    rate,
                    self.channels,
                    if raw { "raw pcm" } else { "opus" }
                );
                true
            }
            Err(e) => {
                // Audio stays silent until a packet with a workable header
                // arrives.
                self.decoder = ActiveDecoder::None;
                self.decoder_key = None;
                stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                callbacks.error(&format!("decoder rebuild at {} Hz failed: {}", rate, e));
                false
            }
        }
    }
}

/// Sendable view of the host counters for status threads and UIs; the
/// receiver itself stays pinned to the thread that owns the device stream.
#[derive(Clone)]
pub struct HostStatsHandle {
    stats: Arc<HostStats>,
    ring: Arc<RingMixer>,
    heartbeat: HeartbeatHandle,
}

impl HostStatsHandle {
    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats
            .rtt_ms
            .store(self.heartbeat.rtt_ms(), Ordering::Relaxed);
        self.stats
            .snapshot(self.ring.overflow_count(), self.ring.underrun_count())
    }

    /// Ring fill 0.0–1.0.
    pub fn buffer_fill(&self) -> f32 {
        self.ring.fill_ratio()
    }
}

/// The host receiver: audio socket, admission state, decode pipeline,
/// heartbeat monitor and output renderer.
pub struct MicReceiver {
    running: Arc<AtomicBool>,
    recv_thread: Option<JoinHandle<()>>,
    heartbeat: HeartbeatMonitor,
    renderer: OutputRenderer,
    stats: Arc<HostStats>,
    ring: Arc<RingMixer>,
    paused: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl MicReceiver {
    /// Bind the audio port, open the output endpoint and start the receive
    /// and heartbeat threads. Any failure tears down everything already
    /// started and surfaces as `FatalInit`.
    pub fn start(config: &Config, callbacks: HostCallbacks) -> Result<Self, Error> {
        let bind_ip: IpAddr = config
            .server
            .bind_address
            .parse()
            .map_err(|_| Error::FatalInit(format!("bad bind address {:?}", config.server.bind_address)))?;
        let bind_addr = SocketAddr::new(bind_ip, config.server.port);

        let renderer = OutputRenderer::open(
            &config.audio.virtual_device_name,
            config.audio.use_speaker_mode,
            config.audio.sample_rate,
        )?;
        let ring = renderer.ring();

        let socket = UdpEndpoint::bind(bind_addr)
            .map_err(|e| Error::FatalInit(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = socket.local_addr();

        let heartbeat = HeartbeatMonitor::start()?;

        let stats = Arc::new(HostStats::default());
        stats
            .output_sample_rate
            .store(renderer.actual_sample_rate(), Ordering::Relaxed);

        let running = Arc::new(AtomicBool::new(true));
        let paused = Arc::new(AtomicBool::new(false));

        let pipeline = StreamPipeline::new(
            ring.clone(),
            renderer.actual_sample_rate(),
            config.audio.channels.clamp(1, 2),
        );
        let admission = AdmissionController::new(config.security.enable_whitelist);

        let thread_running = running.clone();
        let thread_stats = stats.clone();
        let thread_heartbeat = heartbeat.handle();
        let liveness_port = config.client.liveness_port;

        let recv_thread = thread::spawn(move || {
            receive_loop(
                socket,
                thread_running,
                thread_stats,
                pipeline,
                admission,
                callbacks,
                thread_heartbeat,
                liveness_port,
            );
        });

        info!("host listening on {}", local_addr);

        Ok(Self {
            running,
            recv_thread: Some(recv_thread),
            heartbeat,
            renderer,
            stats,
            ring,
            paused,
            local_addr,
        })
    }

    /// Pause the stream: the client is told to stop transmitting but the
    /// session and heartbeat stay up.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            self.stats.is_paused.store(true, Ordering::Relaxed);
            self.heartbeat.send_control(true);
            info!("paused");
        }
    }

    /// Resume the stream.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.stats.is_paused.store(false, Ordering::Relaxed);
            self.heartbeat.send_control(false);
            info!("resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Address the audio socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Rate the output device runs at.
    pub fn output_sample_rate(&self) -> u32 {
        self.renderer.actual_sample_rate()
    }

    /// Current counters, including ring and RTT state.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats_handle().snapshot()
    }

    /// Cloneable, thread-safe stats accessor.
    pub fn stats_handle(&self) -> HostStatsHandle {
        HostStatsHandle {
            stats: self.stats.clone(),
            ring: self.ring.clone(),
            heartbeat: self.heartbeat.handle(),
        }
    }

    /// Ring fill 0.0–1.0 for status displays.
    pub fn buffer_fill(&self) -> f32 {
        self.ring.fill_ratio()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.recv_thread.take() {
            let _ = thread.join();
        }
        self.heartbeat.stop();
        self.renderer.close();
    }
}

impl Drop for MicReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[allow(clippy::too_many_arguments)]
fn receive_loop(
    socket: UdpEndpoint,
    running: Arc<AtomicBool>,
    stats: Arc<HostStats>,
    mut pipeline: StreamPipeline,
    mut admission: AdmissionController,
    callbacks: HostCallbacks,
    heartbeat: HeartbeatHandle,
    liveness_port: u16,
) {
    let mut buf = [0u8; 4096];

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                // Anything shorter than an audio header is discarded before
                // any field is read.
                if len < HEADER_SIZE {
                    continue;
                }

                stats.packets_received.fetch_add(1, Ordering::Relaxed);
                stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

                match peek_magic(&buf[..len]) {
                    Some(AUDIO_MAGIC) => {
                        handle_audio(
                            &socket,
                            &buf[..len],
                            from,
                            &mut pipeline,
                            &mut admission,
                            &stats,
                            &callbacks,
                        );
                    }
                    Some(HANDSHAKE_MAGIC) | Some(HANDSHAKE_MAGIC_ALT) => {
                        match admission.handle_handshake(&buf[..len], from, &callbacks) {
                            AdmissionOutcome::Admitted => {
                                pipeline.reset();
                                heartbeat
                                    .set_target(Some(SocketAddr::new(from.ip(), liveness_port)));
                                if let Some(session) = admission.session() {
                                    stats.set_client_name(&session.device_name);
                                }
                                stats.set_last_sender(&from.ip().to_string());
                                stats.is_connected.store(true, Ordering::Relaxed);
                                callbacks.status(true);
                            }
                            AdmissionOutcome::Rejected => {
                                stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    Some(PONG_MAGIC) => {
                        // Reserved echo path; updates RTT if a client ever
                        // sends one.
                        match PongPacket::parse(&buf[..len]) {
                            Some(pong) => heartbeat.record_pong(pong.timestamp_us),
                            None => {
                                stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    _ => {
                        // Unknown magic: silently dropped, counted.
                        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    callbacks.error(&format!("receive error: {}", e));
                }
                break;
            }
        }

        // Session timeout runs every iteration, received or not.
        if let Some(age) = admission.audio_age_ms() {
            if age > SESSION_TIMEOUT.as_millis() as u64 {
                warn!("client audio starved for {} ms, session closed", age);
                admission.clear();
                heartbeat.set_target(None);
                pipeline.reset();
                stats.is_connected.store(false, Ordering::Relaxed);
                stats.is_receiving.store(false, Ordering::Relaxed);
                callbacks.status(false);
            }
        }
    }
}

fn handle_audio(
    socket: &UdpEndpoint,
    data: &[u8],
    from: SocketAddr,
    pipeline: &mut StreamPipeline,
    admission: &mut AdmissionController,
    stats: &HostStats,
    callbacks: &HostCallbacks,
) {
    // Audio from anyone but the validated sender is dropped, including the
    // validated address before its handshake.
    if !admission.is_admitted(from) {
        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let packet = match AudioPacket::parse(data) {
        Some(p) => p,
        None => {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    stats.is_receiving.store(true, Ordering::Relaxed);
    stats.set_last_sender(&from.ip().to_string());

    if crate::verbose() {
        debug!(
            "audio seq {} ({} B) from {}",
            packet.header.sequence,
            data.len(),
            from
        );
    }

    let previous_rate = admission.touch_audio(packet.header.sample_rate());
    if previous_rate != 0 && previous_rate != packet.header.sample_rate() {
        debug!(
            "rate hint change {} -> {} (seq {}, ts {} us)",
            previous_rate,
            packet.header.sample_rate(),
            packet.header.sequence,
            packet.header.timestamp_us
        );
    }

    // Backpressure: with a deep kernel backlog the pipeline is behind; shed
    // this packet before paying for a decode.
    if socket.backlog_bytes() > LAG_BACKLOG_BYTES {
        stats.packets_dropped_lag.fetch_add(1, Ordering::Relaxed);
        return;
    }

    pipeline.handle_audio(&packet.header, packet.payload, stats, callbacks);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::opus::OpusVoiceEncoder;
    use crate::codec::{VoiceEncoder, MAX_PAYLOAD};
    use crate::protocol::RAW_FLAG;

    fn raw_header(rate: u32, sequence: u32) -> PacketHeader {
        PacketHeader {
            magic: AUDIO_MAGIC,
            sequence,
            timestamp_us: 0,
            rate_and_flags: rate | RAW_FLAG,
        }
    }

    fn raw_payload(frames: usize) -> Vec<u8> {
        let mut payload = vec![0u8; frames * 2];
        for i in 0..frames {
            let v = ((i % 100) as i16) * 100;
            payload[i * 2..i * 2 + 2].copy_from_slice(&v.to_le_bytes());
        }
        payload
    }

    fn test_pipeline(output_rate: u32) -> StreamPipeline {
        let ring = Arc::new(RingMixer::new(output_rate, 1));
        StreamPipeline::new(ring, output_rate, 1)
    }

    #[test]
    fn test_raw_packet_reaches_ring_without_resampling() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();

        let payload = raw_payload(960);
        let ok = pipeline.handle_audio(&raw_header(48000, 0), &payload, &stats, &callbacks);
        assert!(ok);
        assert_eq!(pipeline.ring.occupied(), 960);
        assert!(pipeline.resampler.is_none());
    }

    #[test]
    fn test_rate_change_rebuilds_decoder_and_resampler() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();

        // 16 kHz packet: resampled 3x.
        assert!(pipeline.handle_audio(&raw_header(16000, 0), &raw_payload(320), &stats, &callbacks));
        let after_first = pipeline.ring.occupied();
        assert!((after_first as i64 - 960).abs() <= 1, "{}", after_first);
        assert!(pipeline.resampler.is_some());
        assert_eq!(pipeline.decoder_key, Some((16000, true)));

        // Rate flips to 48 kHz: decoder rebuilt, resampler bypassed.
        assert!(pipeline.handle_audio(&raw_header(48000, 1), &raw_payload(960), &stats, &callbacks));
        assert_eq!(pipeline.decoder_key, Some((48000, true)));
        assert_eq!(pipeline.ring.occupied(), after_first + 960);
        assert_eq!(stats.decode_errors.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_opus_payload_decodes_into_ring() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();

        let format = AudioFormat::new(48000, 1);
        let mut encoder = OpusVoiceEncoder::new(format, 64000).unwrap();
        let frame: Vec<f32> = (0..960)
            .map(|i| (i as f32 * 0.02).sin() * 0.4)
            .collect();
        let mut payload = [0u8; MAX_PAYLOAD];
        let bytes = encoder.encode(&frame, &mut payload).unwrap();

        let header = PacketHeader {
            magic: AUDIO_MAGIC,
            sequence: 0,
            timestamp_us: 0,
            rate_and_flags: 48000,
        };
        assert!(pipeline.handle_audio(&header, &payload[..bytes], &stats, &callbacks));
        assert_eq!(pipeline.ring.occupied(), 960);
    }

    #[test]
    fn test_zero_rate_is_reported_not_fatal() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();

        let ok = pipeline.handle_audio(&raw_header(0, 0), &raw_payload(320), &stats, &callbacks);
        assert!(!ok);
        assert_eq!(stats.decode_errors.load(Ordering::Relaxed), 1);
        assert_eq!(pipeline.ring.occupied(), 0);

        // A good packet right after recovers.
        assert!(pipeline.handle_audio(&raw_header(48000, 1), &raw_payload(960), &stats, &callbacks));
        assert_eq!(pipeline.ring.occupied(), 960);
    }

    #[test]
    fn test_empty_payload_ignored() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();
        assert!(pipeline.handle_audio(&raw_header(48000, 0), &[], &stats, &callbacks));
        assert_eq!(pipeline.ring.occupied(), 0);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut pipeline = test_pipeline(48000);
        let stats = HostStats::default();
        let callbacks = HostCallbacks::default();
        pipeline.handle_audio(&raw_header(16000, 0), &raw_payload(320), &stats, &callbacks);
        assert!(pipeline.ring.occupied() > 0);

        pipeline.reset();
        assert_eq!(pipeline.ring.occupied(), 0);
        assert!(pipeline.resampler.is_none());
        assert!(pipeline.decoder_key.is_none());
    }

    // Full-stack test over loopback; needs an output device, so a clean
    // FatalInit (headless CI) passes trivially.
    #[test]
    fn test_end_to_end_admission_and_audio() {
        use crate::protocol::{Handshake, HANDSHAKE_SIZE};

        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config.security.enable_whitelist = true;
        config.client.liveness_port = 0;

        let mut receiver = match MicReceiver::start(&config, HostCallbacks::default()) {
            Ok(r) => r,
            Err(Error::FatalInit(_)) => return,
            Err(other) => panic!("unexpected error: {}", other),
        };
        let dest = receiver.local_addr();
        let socket = UdpEndpoint::sender().unwrap();

        // Audio before the handshake is dropped.
        let mut datagram = vec![0u8; HEADER_SIZE];
        raw_header(48000, 0).encode(&mut datagram);
        datagram.extend_from_slice(&raw_payload(960));
        socket.send_to(&datagram, dest).unwrap();

        let hs = Handshake {
            pair_status: 1,
            unique_id: *b"0123456789ABCDEF",
            device_name: "vita".to_string(),
            display_width: 0,
            display_height: 0,
            flags: 0,
        };
        let mut hs_buf = [0u8; HANDSHAKE_SIZE];
        hs.encode(&mut hs_buf);
        socket.send_to(&hs_buf, dest).unwrap();

        // Wait for admission, then stream a few packets.
        let mut connected = false;
        for _ in 0..50 {
            if receiver.stats().is_connected {
                connected = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(connected);
        assert_eq!(receiver.stats().client_name, "vita");

        for seq in 1..5u32 {
            let mut datagram = vec![0u8; HEADER_SIZE];
            raw_header(48000, seq).encode(&mut datagram);
            datagram.extend_from_slice(&raw_payload(960));
            socket.send_to(&datagram, dest).unwrap();
            thread::sleep(Duration::from_millis(5));
        }

        let mut receiving = false;
        for _ in 0..50 {
            if receiver.stats().is_receiving {
                receiving = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(receiving);
        assert!(receiver.stats().packets_received >= 5);

        receiver.stop();
    }
}
