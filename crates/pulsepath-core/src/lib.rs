//! Two-channel reliable/unreliable datagram transport over UDP.
//!
//! `pulsepath-core` drives the wire format from [`pulsepath_wire`] and the
//! accounting structs from [`pulsepath_metrics`] into a sender/receiver pair
//! with selective-repeat retransmission on the reliable channel and a
//! bounded skip timer so one missing packet can't block delivery forever.
//! See `SPEC_FULL.md` for the full contract.

mod config;
mod endpoint;
mod error;
mod receiver;
mod sender;
mod timer_wheel;

pub use config::{TransportConfig, WINDOW_SIZE};
pub use endpoint::{DatagramEndpoint, UdpEndpoint};
pub use error::{Result, TransportError};
pub use receiver::{DeliveredPacket, Delivery, Receiver};
pub use sender::Sender;

pub use pulsepath_metrics::{ReceivedChannelMetrics, ReceiverMetrics, SenderMetrics, SentChannelMetrics};
pub use pulsepath_wire::{Channel, Header, WireError, MAX_SEQ};
