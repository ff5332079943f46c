//! Handshake validation and session ownership.
//!
//! One validated sender owns the pipeline at a time. A handshake that passes
//! the admission policy adopts its sender address as the current client and
//! resets the decode path; a later handshake from a different address
//! preempts the old session. Audio from any other address is dropped.

use std::net::SocketAddr;
use std::time::Instant;

use log::{info, warn};

use crate::protocol::Handshake;

/// Hooks the host core calls out through. All optional; the admission policy
/// falls back to the whitelist rule when absent.
#[derive(Default)]
pub struct HostCallbacks {
    /// Human-readable error reports.
    pub on_error: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// A validated client appeared (true) or the session ended (false).
    pub on_status: Option<Box<dyn Fn(bool) + Send + Sync>>,
    /// The client asked for a display resolution. Returns whether the
    /// request was applied; the core only logs the answer.
    pub on_resolution_change: Option<Box<dyn Fn(u16, u16, bool) -> bool + Send + Sync>>,
    /// Admission decision for `(pair_status, unique_id, device_name)`.
    pub admission_policy: Option<Box<dyn Fn(u8, &str, &str) -> bool + Send + Sync>>,
}

impl HostCallbacks {
    pub(crate) fn error(&self, message: &str) {
        warn!("host: {}", message);
        if let Some(cb) = &self.on_error {
            cb(message);
        }
    }

    pub(crate) fn status(&self, connected: bool) {
        if let Some(cb) = &self.on_status {
            cb(connected);
        }
    }
}

/// The host's view of the admitted client.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub sender: SocketAddr,
    pub unique_id: String,
    pub device_name: String,
    /// Stream rate detected from audio packet headers; 0 until the first
    /// packet arrives.
    pub stream_rate: u32,
    pub last_packet: Instant,
    pub last_validated: Instant,
    pub validated: bool,
}

/// Result of processing a handshake datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Sender now owns the session; the caller must reset decoder,
    /// resampler and ring state.
    Admitted,
    /// Dropped; no session state changed.
    Rejected,
}

/// Validates handshakes and owns the [`ClientSession`].
pub struct AdmissionController {
    whitelist_enabled: bool,
    session: Option<ClientSession>,
    /// Last resolution forwarded to the collaborator, to suppress repeats
    /// unless FORCE_UPDATE asks for a replay.
    last_resolution: Option<(u16, u16)>,
}

impl AdmissionController {
    pub fn new(whitelist_enabled: bool) -> Self {
        Self {
            whitelist_enabled,
            session: None,
            last_resolution: None,
        }
    }

    /// Process raw handshake bytes from `sender`.
    pub fn handle_handshake(
        &mut self,
        data: &[u8],
        sender: SocketAddr,
        callbacks: &HostCallbacks,
    ) -> AdmissionOutcome {
        let handshake = match Handshake::parse(data) {
            Some(hs) => hs,
            None => return AdmissionOutcome::Rejected,
        };

        let unique_id = handshake.unique_id_string();
        let admitted = match &callbacks.admission_policy {
            Some(policy) => policy(handshake.pair_status, &unique_id, &handshake.device_name),
            None => !self.whitelist_enabled || handshake.pair_status == 1,
        };

        if !admitted {
            callbacks.error(&format!(
                "rejected handshake from {} ({:?}, pair_status {})",
                sender, handshake.device_name, handshake.pair_status
            ));
            return AdmissionOutcome::Rejected;
        }

        match &self.session {
            Some(old) if old.sender != sender => {
                info!(
                    "client {} preempts previous session from {}",
                    sender, old.sender
                );
            }
            None => info!("client {} validated ({:?})", sender, handshake.device_name),
            _ => {}
        }

        let now = Instant::now();
        self.session = Some(ClientSession {
            sender,
            unique_id,
            device_name: handshake.device_name.clone(),
            stream_rate: 0,
            last_packet: now,
            last_validated: now,
            validated: true,
        });

        self.forward_resolution(&handshake, callbacks);

        AdmissionOutcome::Admitted
    }

    /// Resolution requests ride on the handshake for the coexisting screen
    /// streamer. 0×0 means no request; unchanged values are suppressed
    /// unless the client set FORCE_UPDATE.
    fn forward_resolution(&mut self, handshake: &Handshake, callbacks: &HostCallbacks) {
        let (w, h) = (handshake.display_width, handshake.display_height);
        if w == 0 || h == 0 {
            return;
        }

        let force = handshake.force_update();
        if !force && self.last_resolution == Some((w, h)) {
            return;
        }

        if let Some(cb) = &callbacks.on_resolution_change {
            let applied = cb(w, h, force);
            info!(
                "resolution request {}x{} (force {}) -> {}",
                w,
                h,
                force,
                if applied { "applied" } else { "deferred" }
            );
        }
        self.last_resolution = Some((w, h));
    }

    /// Whether audio from `sender` may enter the pipeline.
    pub fn is_admitted(&self, sender: SocketAddr) -> bool {
        matches!(&self.session, Some(s) if s.validated && s.sender == sender)
    }

    /// Note an admitted audio packet. Returns the previously detected
    /// stream rate (0 on the first packet) so the caller can spot changes.
    pub fn touch_audio(&mut self, rate: u32) -> u32 {
        match &mut self.session {
            Some(session) => {
                let previous = session.stream_rate;
                session.stream_rate = rate;
                session.last_packet = Instant::now();
                previous
            }
            None => 0,
        }
    }

    pub fn session(&self) -> Option<&ClientSession> {
        self.session.as_ref()
    }

    /// Milliseconds since the last admitted audio packet, if a session
    /// exists.
    pub fn audio_age_ms(&self) -> Option<u64> {
        self.session
            .as_ref()
            .map(|s| s.last_packet.elapsed().as_millis() as u64)
    }

    /// Destroy the session (timeout or shutdown).
    pub fn clear(&mut self) {
        if let Some(session) = self.session.take() {
            info!("session from {} cleared", session.sender);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HANDSHAKE_SIZE, FLAG_FORCE_UPDATE};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn encode(hs: &Handshake) -> Vec<u8> {
        let mut buf = vec![0u8; HANDSHAKE_SIZE];
        hs.encode(&mut buf);
        buf
    }

    fn handshake(pair_status: u8) -> Handshake {
        Handshake {
            pair_status,
            unique_id: *b"0123456789ABCDEF",
            device_name: "vita".to_string(),
            display_width: 0,
            display_height: 0,
            flags: 0,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        ([192, 0, 2, 5], port).into()
    }

    #[test]
    fn test_happy_path_admission() {
        let mut ctrl = AdmissionController::new(true);
        let callbacks = HostCallbacks::default();

        let data = encode(&handshake(1));
        assert_eq!(
            ctrl.handle_handshake(&data, addr(54321), &callbacks),
            AdmissionOutcome::Admitted
        );

        let session = ctrl.session().unwrap();
        assert_eq!(session.sender, addr(54321));
        assert_eq!(session.device_name, "vita");
        assert_eq!(session.unique_id, "0123456789ABCDEF");
        assert!(session.validated);
        assert!(ctrl.is_admitted(addr(54321)));
        assert!(!ctrl.is_admitted(addr(54322)));
    }

    #[test]
    fn test_whitelist_rejects_unpaired() {
        let mut ctrl = AdmissionController::new(true);
        let callbacks = HostCallbacks::default();

        let data = encode(&handshake(0));
        assert_eq!(
            ctrl.handle_handshake(&data, addr(1), &callbacks),
            AdmissionOutcome::Rejected
        );
        assert!(ctrl.session().is_none());
    }

    #[test]
    fn test_whitelist_disabled_admits_unpaired() {
        let mut ctrl = AdmissionController::new(false);
        let callbacks = HostCallbacks::default();
        let data = encode(&handshake(0));
        assert_eq!(
            ctrl.handle_handshake(&data, addr(1), &callbacks),
            AdmissionOutcome::Admitted
        );
    }

    #[test]
    fn test_custom_policy_overrides_whitelist() {
        let mut ctrl = AdmissionController::new(true);
        let callbacks = HostCallbacks {
            admission_policy: Some(Box::new(|_, unique_id, _| unique_id.starts_with("0123"))),
            ..Default::default()
        };

        let data = encode(&handshake(0)); // unpaired, but policy allows
        assert_eq!(
            ctrl.handle_handshake(&data, addr(1), &callbacks),
            AdmissionOutcome::Admitted
        );
    }

    #[test]
    fn test_malformed_handshake_rejected() {
        let mut ctrl = AdmissionController::new(false);
        let callbacks = HostCallbacks::default();
        assert_eq!(
            ctrl.handle_handshake(&[0u8; 10], addr(1), &callbacks),
            AdmissionOutcome::Rejected
        );
    }

    #[test]
    fn test_new_sender_preempts() {
        let mut ctrl = AdmissionController::new(false);
        let callbacks = HostCallbacks::default();
        let data = encode(&handshake(1));

        ctrl.handle_handshake(&data, addr(1000), &callbacks);
        ctrl.touch_audio(16000);
        assert!(ctrl.is_admitted(addr(1000)));

        ctrl.handle_handshake(&data, addr(2000), &callbacks);
        assert!(!ctrl.is_admitted(addr(1000)));
        assert!(ctrl.is_admitted(addr(2000)));
        // Fresh session: detected rate starts over.
        assert_eq!(ctrl.session().unwrap().stream_rate, 0);
    }

    #[test]
    fn test_touch_audio_reports_previous_rate() {
        let mut ctrl = AdmissionController::new(false);
        let callbacks = HostCallbacks::default();
        ctrl.handle_handshake(&encode(&handshake(1)), addr(1), &callbacks);

        assert_eq!(ctrl.touch_audio(16000), 0);
        assert_eq!(ctrl.touch_audio(16000), 16000);
        assert_eq!(ctrl.touch_audio(48000), 16000);
    }

    #[test]
    fn test_resolution_not_called_for_zero() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_cb = calls.clone();
        let callbacks = HostCallbacks {
            on_resolution_change: Some(Box::new(move |w, h, force| {
                calls_cb.lock().push((w, h, force));
                true
            })),
            ..Default::default()
        };

        let mut ctrl = AdmissionController::new(false);
        ctrl.handle_handshake(&encode(&handshake(1)), addr(1), &callbacks);
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_resolution_dedup_and_force_update() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_cb = calls.clone();
        let callbacks = HostCallbacks {
            on_resolution_change: Some(Box::new(move |w, h, force| {
                calls_cb.lock().push((w, h, force));
                true
            })),
            ..Default::default()
        };

        let mut hs = handshake(1);
        hs.display_width = 1280;
        hs.display_height = 720;

        let mut ctrl = AdmissionController::new(false);
        ctrl.handle_handshake(&encode(&hs), addr(1), &callbacks);
        ctrl.handle_handshake(&encode(&hs), addr(1), &callbacks);
        // Same resolution twice: one callback.
        assert_eq!(calls.lock().len(), 1);

        hs.flags = FLAG_FORCE_UPDATE;
        ctrl.handle_handshake(&encode(&hs), addr(1), &callbacks);
        // FORCE_UPDATE replays even though nothing changed.
        assert_eq!(calls.lock().as_slice(), &[(1280, 720, false), (1280, 720, true)]);
    }

    #[test]
    fn test_clear_destroys_session() {
        let mut ctrl = AdmissionController::new(false);
        let callbacks = HostCallbacks::default();
        ctrl.handle_handshake(&encode(&handshake(1)), addr(1), &callbacks);
        ctrl.clear();
        assert!(ctrl.session().is_none());
        assert!(!ctrl.is_admitted(addr(1)));
    }
}
