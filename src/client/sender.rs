//! Paced UDP transmission toward the host.
//!
//! The transmitter has no scheduler of its own: the blocking capture read
//! paces the pipeline, and each encoded frame is framed and handed to a
//! non-blocking socket. A datagram the OS will not take immediately is
//! dropped; voice is loss-tolerant and a late frame is worthless.

use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace};

use crate::codec::MAX_PAYLOAD;
use crate::error::Error;
use crate::net::UdpEndpoint;
use crate::protocol::{AudioPacketBuilder, Handshake, HANDSHAKE_SIZE};

fn wall_clock_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Frames audio payloads and sends them to a fixed host address.
pub struct Transmitter {
    socket: UdpEndpoint,
    dest: SocketAddr,
    builder: AudioPacketBuilder,
    packets_sent: u64,
    send_failures: u64,
}

impl Transmitter {
    pub fn new(dest: SocketAddr) -> Result<Self, Error> {
        let socket = UdpEndpoint::sender()
            .map_err(|e| Error::FatalInit(format!("transmit socket: {}", e)))?;

        Ok(Self {
            socket,
            dest,
            builder: AudioPacketBuilder::new(MAX_PAYLOAD),
            packets_sent: 0,
            send_failures: 0,
        })
    }

    /// Frame and send one payload.
    ///
    /// Returns true only if the OS accepted the whole datagram in one call.
    /// `rate` is the payload sample rate; `raw` marks uncompressed PCM.
    pub fn send_audio(&mut self, payload: &[u8], rate: u32, raw: bool) -> bool {
        let timestamp = wall_clock_us();
        let datagram = match self.builder.build(payload, rate, raw, timestamp) {
            Some(d) => d,
            None => {
                self.send_failures += 1;
                return false;
            }
        };

        match self.socket.send_to(datagram, self.dest) {
            Ok(sent) if sent == datagram.len() => {
                self.packets_sent += 1;
                true
            }
            Ok(_) | Err(_) => {
                // EAGAIN or a short send: drop the frame and move on.
                self.send_failures += 1;
                trace!("audio send dropped (seq {})", self.builder.sequence());
                false
            }
        }
    }

    /// Announce the client to the host. Sent at session start and whenever
    /// the liveness monitor reports a reconnect.
    pub fn send_handshake(&mut self, handshake: &Handshake) -> bool {
        let mut buffer = [0u8; HANDSHAKE_SIZE];
        handshake.encode(&mut buffer);

        match self.socket.send_to(&buffer, self.dest) {
            Ok(sent) if sent == buffer.len() => {
                debug!("handshake sent to {}", self.dest);
                true
            }
            _ => false,
        }
    }

    /// Host address packets are sent to.
    pub fn dest(&self) -> SocketAddr {
        self.dest
    }

    /// Next audio sequence number.
    pub fn sequence(&self) -> u32 {
        self.builder.sequence()
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}
