//! Host-side statistics.
//!
//! Counters are written from the receive thread and read by UI pollers;
//! monotonic atomics with relaxed ordering are enough (a torn read of a
//! diagnostic counter is acceptable).

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Live counters shared across the host threads.
#[derive(Default)]
pub struct HostStats {
    pub packets_received: AtomicU64,
    /// Malformed, unknown-magic, unauthorized.
    pub packets_dropped: AtomicU64,
    /// Dropped pre-decode because the socket backlog was too deep.
    pub packets_dropped_lag: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub is_connected: AtomicBool,
    pub is_receiving: AtomicBool,
    pub is_paused: AtomicBool,
    pub rtt_ms: AtomicU64,
    pub output_sample_rate: AtomicU32,
    pub last_sender_ip: Mutex<String>,
    pub client_name: Mutex<String>,
}

impl HostStats {
    pub fn set_last_sender(&self, ip: &str) {
        let mut guard = self.last_sender_ip.lock();
        if guard.as_str() != ip {
            guard.clear();
            guard.push_str(ip);
        }
    }

    pub fn set_client_name(&self, name: &str) {
        let mut guard = self.client_name.lock();
        guard.clear();
        guard.push_str(name);
    }

    pub fn snapshot(&self, ring_overflows: u64, ring_underruns: u64) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_dropped_lag: self.packets_dropped_lag.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            ring_overflows,
            ring_underruns,
            last_sender_ip: self.last_sender_ip.lock().clone(),
            client_name: self.client_name.lock().clone(),
            is_connected: self.is_connected.load(Ordering::Relaxed),
            is_receiving: self.is_receiving.load(Ordering::Relaxed),
            is_paused: self.is_paused.load(Ordering::Relaxed),
            rtt_ms: self.rtt_ms.load(Ordering::Relaxed),
            output_sample_rate: self.output_sample_rate.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view surfaced to UI collaborators.
#[derive(Debug, Default, Clone)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_dropped_lag: u64,
    pub bytes_received: u64,
    pub decode_errors: u64,
    pub ring_overflows: u64,
    pub ring_underruns: u64,
    pub last_sender_ip: String,
    pub client_name: String,
    /// A validated client exists and audio arrived within the last 2 s.
    pub is_connected: bool,
    /// Audio data is actively arriving.
    pub is_receiving: bool,
    pub is_paused: bool,
    /// Last RTT measured from a (reserved) ping echo; 0 if none seen.
    pub rtt_ms: u64,
    pub output_sample_rate: u32,
}
