//! Wire framing for the pulsepath datagram transport.
//!
//! Fixed 8-byte header, big-endian multi-byte fields, opaque payload. See
//! `SPEC_FULL.md` §4.1 / §6 for the bit-exact layout this module implements.

use std::sync::OnceLock;
use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};

/// Header size in bytes: channel(1) + seq(2) + retrans_count(1) + timestamp(4).
pub const HEADER_LEN: usize = 8;

/// Sequence numbers wrap modulo this value.
pub const MAX_SEQ: u32 = 65536;

/// The three logical sub-streams multiplexed over one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reliable,
    Unreliable,
    Ack,
}

impl Channel {
    pub const fn as_u8(self) -> u8 {
        match self {
            Channel::Reliable => 0,
            Channel::Unreliable => 1,
            Channel::Ack => 2,
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Reliable),
            1 => Ok(Channel::Unreliable),
            2 => Ok(Channel::Ack),
            other => Err(WireError::UnknownChannel(other)),
        }
    }
}

/// Errors raised while decoding a raw datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: {len} bytes, need at least {HEADER_LEN}")]
    TooShort { len: usize },
    #[error("unknown channel byte: {0}")]
    UnknownChannel(u8),
}

/// A decoded packet header plus a view of its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub channel: Channel,
    pub seq: u16,
    pub retrans_count: u8,
    pub timestamp: u32,
}

impl Header {
    /// Serialize a header + optional payload into wire bytes. Timestamp is
    /// stamped here, at pack time, from the process-local monotonic clock.
    pub fn pack(channel: Channel, seq: u16, retrans_count: u8, payload: &[u8]) -> Bytes {
        Self::pack_at(channel, seq, retrans_count, now_ms(), payload)
    }

    /// Like [`pack`], but with an explicit timestamp — used by tests that
    /// need deterministic headers, and internally so retransmissions and
    /// original sends share one code path.
    pub fn pack_at(channel: Channel, seq: u16, retrans_count: u8, timestamp: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(channel.as_u8());
        buf.put_u16(seq);
        buf.put_u8(retrans_count);
        buf.put_u32(timestamp);
        buf.extend_from_slice(payload);
        buf.freeze()
    }

    /// Decode a raw datagram into its header and payload slice.
    pub fn unpack(data: &[u8]) -> Result<(Header, &[u8]), WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::TooShort { len: data.len() });
        }
        let channel = Channel::try_from(data[0])?;
        let seq = u16::from_be_bytes([data[1], data[2]]);
        let retrans_count = data[3];
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        Ok((
            Header {
                channel,
                seq,
                retrans_count,
                timestamp,
            },
            &data[HEADER_LEN..],
        ))
    }
}

/// Monotonic milliseconds since an arbitrary process-local epoch, truncated
/// to 32 bits. Never goes backwards within a process.
pub fn now_ms() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u32
}

/// Transit-time estimate: `(arrival_ts - send_ts) mod 2^32`. Tolerates wrap
/// and unsynchronized clocks between endpoints; not an absolute latency.
pub fn latency(send_ts: u32, arrival_ts: u32) -> u32 {
    arrival_ts.wrapping_sub(send_ts)
}

/// Advance a sequence number by one, wrapping modulo [`MAX_SEQ`].
pub fn next_seq(seq: u16) -> u16 {
    (((seq as u32) + 1) % MAX_SEQ) as u16
}
