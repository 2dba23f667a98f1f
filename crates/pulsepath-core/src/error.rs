//! Error taxonomy. See `SPEC_FULL.md` §7.
//!
//! spec.md §7 keeps malformed headers, wrong-peer datagrams, failed sends,
//! and retransmission exhaustion entirely inside the driver task: each is
//! logged at the point it's noticed (`tracing::warn!`/`debug!` in
//! `sender.rs`/`receiver.rs`) and never surfaces as an `Err` a caller has to
//! handle. Only conditions that actually cross back out to a caller get a
//! `TransportError` variant.
//!
//! spec.md §7 also names an `AlreadyStarted` condition for a second
//! `connect`/`listen` call. `Sender::connect`/`Receiver::listen` are
//! constructors, not methods on an existing handle, so there is no
//! instance a second call could collide with — each call simply produces
//! an independent `Sender`/`Receiver`. That makes the condition
//! structurally unreachable here, so no variant for it exists either.

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not started")]
    NotStarted,

    #[error("failed to bind local socket")]
    BindError(#[source] std::io::Error),
}
