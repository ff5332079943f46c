//! Client-side liveness and flow control.
//!
//! The host pings every 2 s and flips transmission with STOP/STRT control
//! packets. A dedicated thread owns the liveness socket; the capture worker
//! only ever reads two atomics (connected, paused) to gate its sends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, info};

use crate::error::Error;
use crate::net::UdpEndpoint;
use crate::protocol::{peek_magic, ControlPacket, PingPacket, CTRL_START, CTRL_STOP, PING_MAGIC};

/// Milliseconds without a PING before the connection counts as lost.
pub const PING_TIMEOUT_MS: u64 = 3000;

/// Client connection status. `paused` is orthogonal: a paused client is
/// still connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// Events fed into the connection-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessEvent {
    /// A valid 12-byte PING arrived.
    Ping,
    /// A valid STOP control packet arrived.
    Stop,
    /// A valid START control packet arrived.
    Start,
    /// One poll iteration elapsed with nothing relevant received.
    Tick,
}

/// The connection-state machine, separated from the socket so the
/// transition table is testable with a synthetic clock.
///
/// States: {DISCONNECTED, CONNECTED}. Any valid PING connects; 3 s of PING
/// starvation disconnects. The paused bit follows STOP/STRT independently.
#[derive(Debug)]
pub struct LivenessState {
    status: ConnectionStatus,
    paused: bool,
    last_ping_ms: Option<u64>,
    /// Bumped on every DISCONNECTED→CONNECTED edge so the transmit side
    /// knows to re-handshake.
    connect_generation: u64,
}

impl LivenessState {
    pub fn new() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            paused: false,
            last_ping_ms: None,
            connect_generation: 0,
        }
    }

    pub fn apply(&mut self, event: LivenessEvent, now_ms: u64) {
        match event {
            LivenessEvent::Ping => {
                self.last_ping_ms = Some(now_ms);
                if self.status == ConnectionStatus::Disconnected {
                    self.connect_generation += 1;
                }
                self.status = ConnectionStatus::Connected;
            }
            LivenessEvent::Stop => self.paused = true,
            LivenessEvent::Start => self.paused = false,
            LivenessEvent::Tick => {}
        }

        // Starvation check runs on every event, ticks included.
        if let Some(last) = self.last_ping_ms {
            if now_ms.saturating_sub(last) > PING_TIMEOUT_MS {
                self.status = ConnectionStatus::Disconnected;
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn connect_generation(&self) -> u64 {
        self.connect_generation
    }

    pub fn last_ping_ms(&self) -> Option<u64> {
        self.last_ping_ms
    }
}

impl Default for LivenessState {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the liveness thread and its readers.
struct Shared {
    running: AtomicBool,
    connected: AtomicBool,
    paused: AtomicBool,
    /// Milliseconds since monitor start; u64::MAX = never.
    last_ping_ms: AtomicU64,
    connect_generation: AtomicU64,
    started: Instant,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn publish(&self, state: &LivenessState) {
        self.connected
            .store(state.status() == ConnectionStatus::Connected, Ordering::Relaxed);
        self.paused.store(state.paused(), Ordering::Relaxed);
        self.last_ping_ms
            .store(state.last_ping_ms().unwrap_or(u64::MAX), Ordering::Relaxed);
        self.connect_generation
            .store(state.connect_generation(), Ordering::Relaxed);
    }
}

/// Read-only view handed to the transmit path and the UI.
#[derive(Clone)]
pub struct LivenessHandle {
    shared: Arc<Shared>,
}

impl LivenessHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectionStatus {
        if self.is_connected() {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// Generation counter of DISCONNECTED→CONNECTED edges.
    pub fn connect_generation(&self) -> u64 {
        self.shared.connect_generation.load(Ordering::Relaxed)
    }

    /// Age of the last ping in milliseconds. Informational; `None` before
    /// the first ping.
    pub fn ping_age_ms(&self) -> Option<u64> {
        let last = self.shared.last_ping_ms.load(Ordering::Relaxed);
        if last == u64::MAX {
            return None;
        }
        Some(self.shared.now_ms().saturating_sub(last))
    }
}

/// Owns the liveness socket and thread.
pub struct ClientLiveness {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl ClientLiveness {
    /// Bind the liveness port (wildcard address) and start the monitor
    /// thread.
    pub fn start(port: u16) -> Result<Self, Error> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let socket = UdpEndpoint::bind(bind_addr)
            .map_err(|e| Error::FatalInit(format!("liveness bind {}: {}", bind_addr, e)))?;
        let local_addr = socket.local_addr();

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            last_ping_ms: AtomicU64::new(u64::MAX),
            connect_generation: AtomicU64::new(0),
            started: Instant::now(),
        });

        let thread_shared = shared.clone();
        let thread = thread::spawn(move || {
            Self::monitor_loop(socket, thread_shared);
        });

        info!("liveness monitor listening on {}", local_addr);

        Ok(Self {
            shared,
            thread: Some(thread),
            local_addr,
        })
    }

    fn monitor_loop(socket: UdpEndpoint, shared: Arc<Shared>) {
        let mut state = LivenessState::new();
        let mut buf = [0u8; 64];

        while shared.running.load(Ordering::Relaxed) {
            let event = match socket.recv_from(&mut buf) {
                Ok((len, _from)) => Self::classify(&buf[..len]),
                Err(_) => LivenessEvent::Tick,
            };

            let was = state.status();
            state.apply(event, shared.now_ms());
            shared.publish(&state);

            if was != state.status() {
                match state.status() {
                    ConnectionStatus::Connected => info!("host connected"),
                    ConnectionStatus::Disconnected => info!("host connection timed out"),
                }
            }
            if event == LivenessEvent::Stop {
                debug!("host paused transmission");
            } else if event == LivenessEvent::Start {
                debug!("host resumed transmission");
            }
        }
    }

    /// Map one datagram to a state-machine event. Anything malformed is a
    /// plain tick: unknown traffic must not refresh liveness.
    fn classify(data: &[u8]) -> LivenessEvent {
        match peek_magic(data) {
            Some(PING_MAGIC) if PingPacket::parse(data).is_some() => LivenessEvent::Ping,
            Some(CTRL_STOP) if ControlPacket::parse(data).is_some() => LivenessEvent::Stop,
            Some(CTRL_START) if ControlPacket::parse(data).is_some() => LivenessEvent::Start,
            _ => LivenessEvent::Tick,
        }
    }

    /// Handle for the send-gating atomics.
    pub fn handle(&self) -> LivenessHandle {
        LivenessHandle {
            shared: self.shared.clone(),
        }
    }

    /// Port the monitor is bound on (where the host must ping).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ClientLiveness {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PING_SIZE;

    #[test]
    fn test_initial_state() {
        let state = LivenessState::new();
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(!state.paused());
    }

    #[test]
    fn test_ping_connects_and_starvation_disconnects() {
        let mut state = LivenessState::new();

        state.apply(LivenessEvent::Ping, 1000);
        assert_eq!(state.status(), ConnectionStatus::Connected);

        // 2.9 s later: still connected.
        state.apply(LivenessEvent::Tick, 3900);
        assert_eq!(state.status(), ConnectionStatus::Connected);

        // 3.1 s later: disconnected.
        state.apply(LivenessEvent::Tick, 4100);
        assert_eq!(state.status(), ConnectionStatus::Disconnected);

        // A fresh ping reconnects on receipt.
        state.apply(LivenessEvent::Ping, 4200);
        assert_eq!(state.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn test_paused_is_orthogonal_to_status() {
        let mut state = LivenessState::new();
        state.apply(LivenessEvent::Ping, 0);
        state.apply(LivenessEvent::Stop, 100);
        assert!(state.paused());
        assert_eq!(state.status(), ConnectionStatus::Connected);

        // Pings keep arriving while paused; pause survives them.
        state.apply(LivenessEvent::Ping, 2000);
        assert!(state.paused());

        state.apply(LivenessEvent::Start, 2100);
        assert!(!state.paused());

        // Pause also survives a disconnect.
        state.apply(LivenessEvent::Stop, 2200);
        state.apply(LivenessEvent::Tick, 6000);
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(state.paused());
    }

    #[test]
    fn test_connect_generation_counts_edges() {
        let mut state = LivenessState::new();
        assert_eq!(state.connect_generation(), 0);

        state.apply(LivenessEvent::Ping, 0);
        assert_eq!(state.connect_generation(), 1);

        // Repeated pings while connected are not new edges.
        state.apply(LivenessEvent::Ping, 2000);
        assert_eq!(state.connect_generation(), 1);

        state.apply(LivenessEvent::Tick, 6000);
        assert_eq!(state.status(), ConnectionStatus::Disconnected);

        state.apply(LivenessEvent::Ping, 6100);
        assert_eq!(state.connect_generation(), 2);
    }

    #[test]
    fn test_classify_requires_exact_lengths() {
        let mut ping = [0u8; PING_SIZE];
        PingPacket { timestamp_us: 42 }.encode(&mut ping);
        assert_eq!(ClientLiveness::classify(&ping), LivenessEvent::Ping);
        // Truncated ping is not a liveness witness.
        assert_eq!(ClientLiveness::classify(&ping[..8]), LivenessEvent::Tick);

        let mut ctrl = [0u8; 8];
        ControlPacket::stop().encode(&mut ctrl);
        assert_eq!(ClientLiveness::classify(&ctrl), LivenessEvent::Stop);
        ControlPacket::start().encode(&mut ctrl);
        assert_eq!(ClientLiveness::classify(&ctrl), LivenessEvent::Start);

        assert_eq!(ClientLiveness::classify(b"junk"), LivenessEvent::Tick);
        assert_eq!(ClientLiveness::classify(&[]), LivenessEvent::Tick);
    }

    #[test]
    fn test_monitor_thread_reacts_to_packets() {
        let mut liveness = ClientLiveness::start(0).unwrap();
        let handle = liveness.handle();
        let sender = UdpEndpoint::sender().unwrap();
        let dest: SocketAddr = ([127, 0, 0, 1], liveness.local_addr().port()).into();

        assert!(!handle.is_connected());

        let mut ping = [0u8; PING_SIZE];
        PingPacket { timestamp_us: 1 }.encode(&mut ping);
        sender.send_to(&ping, dest).unwrap();

        // The monitor polls on a 100 ms timeout; give it a few cycles.
        let mut connected = false;
        for _ in 0..50 {
            if handle.is_connected() {
                connected = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(connected);
        assert_eq!(handle.connect_generation(), 1);

        let mut stop = [0u8; 8];
        ControlPacket::stop().encode(&mut stop);
        sender.send_to(&stop, dest).unwrap();

        let mut paused = false;
        for _ in 0..50 {
            if handle.is_paused() {
                paused = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(paused);
        assert!(handle.is_connected());

        liveness.stop();
    }
}
