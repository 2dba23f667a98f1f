//! Tunable knobs. Channel ids are wire format, not policy, so they stay as
//! `pulsepath_wire::Channel` constants rather than config fields — mirrors
//! `VoiceForwarderConfig` in the teacher's `voice_forwarder.rs`, which keeps
//! the fixed header layout out of its config struct the same way.

use std::time::Duration;

/// In-flight reliable packet count the send window admits before `send`
/// suspends. `WINDOW_SIZE * 2 <= MAX_SEQ` must hold so in-flight sequences
/// never alias past-window ones.
pub const WINDOW_SIZE: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// In-flight reliable packet budget. See [`WINDOW_SIZE`].
    pub window_size: usize,
    /// How long an unacked reliable packet waits before retransmission.
    pub retransmission_timeout: Duration,
    /// Retransmissions attempted before a slot is abandoned.
    pub max_retransmission_count: u8,
    /// How long the receiver waits on a hole before skipping past it.
    pub skip_timeout: Duration,
    /// Bound on `Sender::close`'s wait for the reliable window to drain.
    pub drain_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            window_size: WINDOW_SIZE,
            retransmission_timeout: Duration::from_millis(80),
            max_retransmission_count: 10,
            skip_timeout: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(2),
        }
    }
}
