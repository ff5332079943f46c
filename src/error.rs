//! Crate error type.
//!
//! Variants follow the severity ladder of the pipeline: construction
//! failures tear the whole pipeline down, session faults clear admission and
//! wait for a new handshake, everything below that is counted and the stream
//! keeps running. Errors never cross thread boundaries by unwinding; the
//! worker threads report through the error callback and counters instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Cannot open a capture device, bind a socket, or open the output
    /// device. Nothing is left running after this.
    #[error("initialization failed: {0}")]
    FatalInit(String),

    /// Decoder rebuild failed or the output device was lost mid-stream.
    #[error("session fault: {0}")]
    SessionFault(String),

    /// A single encode/decode/send failure. The frame is dropped and the
    /// pipeline continues.
    #[error("frame error: {0}")]
    TransientFrame(String),

    /// Malformed handshake, unauthorized client, or unknown magic.
    #[error("protocol reject: {0}")]
    ProtocolReject(String),

    /// Lagging ingress or ring overflow.
    #[error("backpressure: {0}")]
    Backpressure(String),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
