//! Host side: receive → validate → decode → resample → render.

pub mod admission;
pub mod heartbeat;
pub mod output;
pub mod receiver;
pub mod ring;
pub mod stats;

pub use admission::{AdmissionController, ClientSession, HostCallbacks};
pub use heartbeat::HeartbeatMonitor;
pub use output::OutputRenderer;
pub use receiver::MicReceiver;
pub use ring::RingMixer;
pub use stats::{HostStats, StatsSnapshot};
