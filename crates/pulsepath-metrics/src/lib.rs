//! Per-channel counters handed back to the host application on shutdown.
//!
//! These are plain accumulator structs, not an export/scrape surface: the
//! host reads them once from `Sender::close`/`Receiver::stop`. See
//! `SPEC_FULL.md` §4.5 for why this intentionally does not pull in a metrics
//! exporter crate the way the teacher's own metrics crate does.

/// Sent-side counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SentChannelMetrics {
    pub sent_packets: u64,
}

/// Counters returned by [`crate::SenderMetrics`]... (see below) after close.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderMetrics {
    pub reliable: SentChannelMetrics,
    pub unreliable: SentChannelMetrics,
    /// Reliable-channel only: count of retransmitted (non-original) sends.
    pub retransmissions: u64,
}

/// Received-side counters for one channel, including RFC 3550 jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceivedChannelMetrics {
    pub received_packets: u64,
    pub received_bytes: u64,
    pub latency_sum_ms: u64,
    pub latency_min_ms: Option<u32>,
    pub latency_max_ms: Option<u32>,
    prev_transit_ms: Option<u32>,
    /// RFC 3550 §6.4.1 interarrival jitter estimate, in milliseconds.
    pub jitter_ms: f64,
}

impl ReceivedChannelMetrics {
    /// Fold in one arriving data packet's transit time and payload length.
    pub fn record_arrival(&mut self, transit_ms: u32, payload_len: usize) {
        self.received_packets += 1;
        self.received_bytes += payload_len as u64;
        self.latency_sum_ms += transit_ms as u64;
        self.latency_min_ms = Some(self.latency_min_ms.map_or(transit_ms, |m| m.min(transit_ms)));
        self.latency_max_ms = Some(self.latency_max_ms.map_or(transit_ms, |m| m.max(transit_ms)));

        if let Some(prev) = self.prev_transit_ms {
            let d = (transit_ms as i64 - prev as i64).abs() as f64;
            self.jitter_ms += (d - self.jitter_ms) / 16.0;
        }
        self.prev_transit_ms = Some(transit_ms);
    }

    pub fn latency_avg_ms(&self) -> Option<f64> {
        if self.received_packets == 0 {
            None
        } else {
            Some(self.latency_sum_ms as f64 / self.received_packets as f64)
        }
    }
}

/// Counters returned by `Receiver::stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReceiverMetrics {
    pub reliable: ReceivedChannelMetrics,
    pub unreliable: ReceivedChannelMetrics,
    /// Reliable-channel only: sequences abandoned by the skip timer.
    pub skipped_packets: u64,
}
