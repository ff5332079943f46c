//! moonmic: one-way microphone streaming for game-streaming setups.
//!
//! A client device captures its microphone, encodes it with a low-latency
//! voice codec and streams it over UDP to the host machine, where the
//! decoded audio is rendered into a virtual capture endpoint so unmodified
//! applications see it as a system microphone. A thin control plane
//! (heartbeats, STOP/START flow control) rides the same protocol.
//!
//! - [`client::MicClient`]: capture → aggregate → encode → send
//! - [`host::MicReceiver`]: receive → validate → decode → resample → render
//! - [`protocol`]: the shared wire format
//!
//! Transport is plain UDP: no retransmission, no ordering, no encryption.
//! Voice tolerates loss; latency does not tolerate reliability machinery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod net;
pub mod protocol;

pub use client::MicClient;
pub use config::Config;
pub use error::{Error, Result};
pub use host::MicReceiver;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

lazy_static! {
    /// Process start reference used by the status displays.
    static ref PROCESS_START: Instant = Instant::now();
}

/// Time since the process (first) asked for it.
pub fn uptime() -> Duration {
    PROCESS_START.elapsed()
}

static VERBOSE: AtomicBool = AtomicBool::new(false);

/// Enable per-packet diagnostics in the demo binaries.
pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}
