//! Host-side heartbeat and flow control.
//!
//! A dedicated thread pings the validated client every 2 s so the client's
//! liveness monitor can tell a live host from a dead link. Pause/resume is
//! signalled with STOP/STRT control packets through the same socket. Pings
//! stop as soon as the receive side reports audio starvation; they resume
//! when a new handshake installs a target again.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::error::Error;
use crate::net::UdpEndpoint;
use crate::protocol::{ControlPacket, PingPacket, CONTROL_SIZE, PING_SIZE};

/// Ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(2);

fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

struct Shared {
    running: AtomicBool,
    target: Mutex<Option<SocketAddr>>,
    last_rtt_ms: AtomicU64,
}

/// Cloneable face of the monitor for the receive thread: target
/// installation, control signalling and RTT bookkeeping.
#[derive(Clone)]
pub struct HeartbeatHandle {
    shared: Arc<Shared>,
    socket: Arc<UdpEndpoint>,
}

impl HeartbeatHandle {
    /// Install or clear the ping destination (the client's liveness port).
    pub fn set_target(&self, target: Option<SocketAddr>) {
        *self.shared.target.lock() = target;
        if let Some(addr) = target {
            debug!("heartbeat target {}", addr);
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        *self.shared.target.lock()
    }

    /// Send STOP (pause) or START (resume) to the current target.
    pub fn send_control(&self, pause: bool) -> bool {
        let target = match *self.shared.target.lock() {
            Some(t) => t,
            None => return false,
        };

        let packet = if pause {
            ControlPacket::stop()
        } else {
            ControlPacket::start()
        };
        let mut buffer = [0u8; CONTROL_SIZE];
        packet.encode(&mut buffer);

        match self.socket.send_to(&buffer, target) {
            Ok(sent) if sent == CONTROL_SIZE => true,
            _ => {
                warn!(
                    "{} signal to {} failed",
                    if pause { "STOP" } else { "START" },
                    target
                );
                false
            }
        }
    }

    /// Record a (reserved) ping echo carrying the host timestamp it answers.
    pub fn record_pong(&self, echoed_timestamp_us: u64) {
        let now = wall_clock_us();
        let rtt_ms = now.saturating_sub(echoed_timestamp_us) / 1000;
        self.shared.last_rtt_ms.store(rtt_ms, Ordering::Relaxed);
    }

    /// Last measured RTT in milliseconds, 0 if never measured.
    pub fn rtt_ms(&self) -> u64 {
        self.shared.last_rtt_ms.load(Ordering::Relaxed)
    }
}

/// Periodic ping sender plus STOP/START signalling.
pub struct HeartbeatMonitor {
    handle: HeartbeatHandle,
    thread: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    pub fn start() -> Result<Self, Error> {
        let socket = UdpEndpoint::sender()
            .map_err(|e| Error::FatalInit(format!("heartbeat socket: {}", e)))?;
        let thread_socket = socket
            .try_clone()
            .map_err(|e| Error::FatalInit(format!("heartbeat socket clone: {}", e)))?;

        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            target: Mutex::new(None),
            last_rtt_ms: AtomicU64::new(0),
        });

        let thread_shared = shared.clone();
        let thread = thread::spawn(move || {
            Self::ping_loop(thread_socket, thread_shared);
        });

        Ok(Self {
            handle: HeartbeatHandle {
                shared,
                socket: Arc::new(socket),
            },
            thread: Some(thread),
        })
    }

    fn ping_loop(socket: UdpEndpoint, shared: Arc<Shared>) {
        let mut buffer = [0u8; PING_SIZE];

        while shared.running.load(Ordering::Relaxed) {
            if let Some(target) = *shared.target.lock() {
                let ping = PingPacket {
                    timestamp_us: wall_clock_us(),
                };
                ping.encode(&mut buffer);
                match socket.send_to(&buffer, target) {
                    Ok(_) => trace!("ping -> {}", target),
                    Err(e) => debug!("ping to {} failed: {}", target, e),
                }
            }

            // Sleep in poll-sized slices so stop() is never 2 s late.
            let mut remaining = PING_INTERVAL;
            while remaining > Duration::ZERO && shared.running.load(Ordering::Relaxed) {
                let slice = remaining.min(Duration::from_millis(100));
                thread::sleep(slice);
                remaining = remaining.saturating_sub(slice);
            }
        }
    }

    pub fn handle(&self) -> HeartbeatHandle {
        self.handle.clone()
    }

    pub fn set_target(&self, target: Option<SocketAddr>) {
        self.handle.set_target(target);
    }

    pub fn send_control(&self, pause: bool) -> bool {
        self.handle.send_control(pause)
    }

    pub fn rtt_ms(&self) -> u64 {
        self.handle.rtt_ms()
    }

    pub fn stop(&mut self) {
        self.handle.shared.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
