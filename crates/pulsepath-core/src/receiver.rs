//! Receiver Core. See `SPEC_FULL.md` §4.4.
//!
//! Same pure/async split as [`crate::sender`]: [`ReceiverState`] buffers and
//! reorders reliable packets and runs the skip timer with no I/O of its own;
//! [`Receiver`] owns the [`crate::endpoint::DatagramEndpoint`] and the
//! `tokio::select!` loop that drives it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pulsepath_metrics::ReceiverMetrics;
use pulsepath_wire::{latency, next_seq, Channel, Header, MAX_SEQ};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::endpoint::{DatagramEndpoint, UdpEndpoint};
use crate::error::{Result, TransportError};
use crate::timer_wheel::TimerWheel;

/// One packet handed to the application: the fields spec.md's `deliver_cb`
/// names, minus the `is_reliable` flag (that's the enclosing [`Delivery`]
/// variant instead).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPacket {
    pub seq: u16,
    pub retrans_count: u8,
    pub payload: Bytes,
    pub arrival_ts_ms: u32,
    pub latency_ms: u32,
}

/// One packet handed to the application, tagged with the channel it
/// arrived on. Reliable deliveries are strictly in order; unreliable ones
/// are not ordered relative to anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Reliable(DeliveredPacket),
    Unreliable(DeliveredPacket),
}

/// Result of processing one inbound reliable datagram. An ack is owed for
/// every valid reliable datagram regardless of whether it was new,
/// duplicate, or out of the acceptance window.
struct ReliableOutcome {
    ack_seq: u16,
    delivered: Vec<DeliveredPacket>,
}

enum SkipOutcome {
    Stale,
    Skipped { skipped_seq: u16, delivered: Vec<DeliveredPacket> },
}

/// Pure, synchronous reliable-reordering and skip-timer state machine.
pub(crate) struct ReceiverState {
    window_size: usize,
    skip_timeout: Duration,
    base_seq: u16,
    buffer: Vec<Option<DeliveredPacket>>,
    timers: TimerWheel<u16>,
    next_generation: u64,
    metrics: ReceiverMetrics,
}

impl ReceiverState {
    fn new(cfg: &TransportConfig) -> Self {
        Self {
            window_size: cfg.window_size,
            skip_timeout: cfg.skip_timeout,
            base_seq: 0,
            buffer: (0..cfg.window_size).map(|_| None).collect(),
            timers: TimerWheel::new(),
            next_generation: 0,
            metrics: ReceiverMetrics::default(),
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn forward_offset(&self, seq: u16) -> u32 {
        let max_seq = MAX_SEQ;
        (seq as u32 + max_seq - self.base_seq as u32) % max_seq
    }

    /// Drain every contiguous buffered slot starting at `base_seq`, arming a
    /// fresh skip timer for whatever hole remains.
    fn drain_contiguous(&mut self, now: Instant) -> Vec<DeliveredPacket> {
        let mut delivered = Vec::new();
        while let Some(packet) = self.buffer[self.base_seq as usize % self.window_size].take() {
            delivered.push(packet);
            self.base_seq = next_seq(self.base_seq);
        }
        self.rearm_skip_timer(now);
        delivered
    }

    /// A skip timer is only ever warranted while some out-of-order packet
    /// sits buffered ahead of the hole at `base_seq` — an idle receiver with
    /// nothing buffered has nothing to bound.
    fn has_buffered_ahead(&self) -> bool {
        self.buffer.iter().any(Option::is_some)
    }

    fn rearm_skip_timer(&mut self, now: Instant) {
        if self.has_buffered_ahead() {
            let generation = self.bump_generation();
            self.timers
                .schedule(now + self.skip_timeout, self.base_seq, generation);
        }
    }

    fn on_reliable(&mut self, seq: u16, retrans_count: u8, payload: Bytes, send_ts: u32, now: Instant) -> ReliableOutcome {
        let offset = self.forward_offset(seq);
        if offset >= self.window_size as u32 {
            // Out of the current acceptance window: either a duplicate of an
            // already-delivered sequence, or (shouldn't happen given the
            // sender's window invariant) something far ahead. Either way we
            // can't safely buffer it, and it isn't a new arrival worth
            // counting; just ack so the sender's view agrees.
            return ReliableOutcome {
                ack_seq: seq,
                delivered: Vec::new(),
            };
        }

        let idx = seq as usize % self.window_size;
        let was_hole = self.buffer[idx].is_none();
        if was_hole {
            let arrival_ts_ms = pulsepath_wire::now_ms();
            let latency_ms = latency(send_ts, arrival_ts_ms);
            self.metrics.reliable.record_arrival(latency_ms, payload.len());
            self.buffer[idx] = Some(DeliveredPacket {
                seq,
                retrans_count,
                payload,
                arrival_ts_ms,
                latency_ms,
            });
        }

        // Only draining from exactly `base_seq` can possibly advance it.
        // An out-of-order arrival that fills a new hole instead arms the
        // skip timer, so that hole can't block delivery forever; a
        // duplicate out-of-order arrival re-arms nothing.
        let delivered = if seq == self.base_seq {
            self.drain_contiguous(now)
        } else {
            if was_hole {
                self.rearm_skip_timer(now);
            }
            Vec::new()
        };

        ReliableOutcome { ack_seq: seq, delivered }
    }

    fn on_skip_timeout(&mut self, seq: u16, generation: u64, now: Instant) -> SkipOutcome {
        if seq != self.base_seq || generation != self.next_generation {
            return SkipOutcome::Stale;
        }
        debug!(seq, "skip timer fired, abandoning hole");
        self.metrics.skipped_packets += 1;
        let skipped_seq = self.base_seq;
        self.base_seq = next_seq(self.base_seq);
        let delivered = self.drain_contiguous(now);
        SkipOutcome::Skipped { skipped_seq, delivered }
    }

    fn on_unreliable(&mut self, seq: u16, retrans_count: u8, payload: Bytes, send_ts: u32) -> DeliveredPacket {
        let arrival_ts_ms = pulsepath_wire::now_ms();
        let latency_ms = latency(send_ts, arrival_ts_ms);
        self.metrics.unreliable.record_arrival(latency_ms, payload.len());
        DeliveredPacket {
            seq,
            retrans_count,
            payload,
            arrival_ts_ms,
            latency_ms,
        }
    }

    fn next_wakeup(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn metrics(&self) -> ReceiverMetrics {
        self.metrics
    }
}

enum Command {
    Stop(oneshot::Sender<ReceiverMetrics>),
}

/// Public handle to a listening receiver. Cheap to clone.
#[derive(Clone)]
pub struct Receiver {
    inner: Arc<Inner>,
}

struct Inner {
    cmd_tx: mpsc::Sender<Command>,
    local_addr: SocketAddr,
    /// Set once `stop` completes; makes a repeated `stop` an idempotent
    /// no-op instead of an error, per `base.py`'s start/stop lifecycle.
    stopped: std::sync::Mutex<Option<ReceiverMetrics>>,
}

impl Receiver {
    /// Bind `local_addr` and accept reliable/unreliable traffic only from
    /// `remote_addr`, delivering payloads on the returned channel.
    pub async fn listen(
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        cfg: TransportConfig,
    ) -> Result<(Self, mpsc::Receiver<Delivery>)> {
        let (endpoint, mut datagrams) = UdpEndpoint::bind(local_addr).await?;
        let bound_addr = endpoint.local_addr()?;
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(8);
        let (deliver_tx, deliver_rx) = mpsc::channel::<Delivery>(1024);

        tokio::spawn(async move {
            let mut state = ReceiverState::new(&cfg);

            loop {
                let wakeup = state.next_wakeup();
                let sleep = async {
                    match wakeup {
                        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                        None => std::future::pending::<()>().await,
                    }
                };

                tokio::select! {
                    biased;

                    _ = sleep => {
                        let now = Instant::now();
                        while let Some((seq, generation)) = state.timers.pop_due(now) {
                            if let SkipOutcome::Skipped { skipped_seq, delivered } = state.on_skip_timeout(seq, generation, now) {
                                // Lie to the sender: ack the sequence we gave up on so
                                // it releases the slot instead of retransmitting it.
                                let ack = Header::pack(Channel::Ack, skipped_seq, 0, &[]);
                                endpoint.send_to(&ack, remote_addr).await;
                                for payload in delivered {
                                    if deliver_tx.send(Delivery::Reliable(payload)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }

                    datagram = datagrams.recv() => {
                        let Some((bytes, src)) = datagram else { break };
                        if src != remote_addr {
                            warn!(%src, expected = %remote_addr, "datagram from unexpected peer");
                            continue;
                        }
                        let now = Instant::now();
                        match Header::unpack(&bytes) {
                            Ok((hdr, payload)) if hdr.channel == Channel::Reliable => {
                                let outcome = state.on_reliable(
                                    hdr.seq,
                                    hdr.retrans_count,
                                    Bytes::copy_from_slice(payload),
                                    hdr.timestamp,
                                    now,
                                );
                                let ack = Header::pack(Channel::Ack, outcome.ack_seq, 0, &[]);
                                endpoint.send_to(&ack, remote_addr).await;
                                for p in outcome.delivered {
                                    if deliver_tx.send(Delivery::Reliable(p)).await.is_err() {
                                        return;
                                    }
                                }
                            }
                            Ok((hdr, payload)) if hdr.channel == Channel::Unreliable => {
                                let packet = state.on_unreliable(
                                    hdr.seq,
                                    hdr.retrans_count,
                                    Bytes::copy_from_slice(payload),
                                    hdr.timestamp,
                                );
                                if deliver_tx.send(Delivery::Unreliable(packet)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(_) => {} // receivers don't process acks
                            Err(e) => warn!(error = %e, "malformed datagram"),
                        }
                    }

                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => break,
                            Some(Command::Stop(tx)) => {
                                let _ = tx.send(state.metrics());
                                break;
                            }
                        }
                    }
                }
            }

            endpoint.close().await;
        });

        Ok((
            Self {
                inner: Arc::new(Inner {
                    cmd_tx,
                    local_addr: bound_addr,
                    stopped: std::sync::Mutex::new(None),
                }),
            },
            deliver_rx,
        ))
    }

    /// The address actually bound, useful when `local_addr` was `:0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Stop the receive loop and return final metrics, bounded by `timeout`.
    /// Idempotent: a call after the first returns the same metrics rather
    /// than erroring.
    pub async fn stop(&self, timeout: Duration) -> Result<ReceiverMetrics> {
        if let Some(metrics) = *self.inner.stopped.lock().expect("not poisoned") {
            return Ok(metrics);
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Stop(tx)).await.is_err() {
            return Err(TransportError::NotStarted);
        }
        match tokio_timeout(timeout, rx).await {
            Ok(Ok(metrics)) => {
                *self.inner.stopped.lock().expect("not poisoned") = Some(metrics);
                Ok(metrics)
            }
            _ => Err(TransportError::NotStarted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TransportConfig {
        TransportConfig {
            window_size: 4,
            ..TransportConfig::default()
        }
    }

    fn payloads(delivered: &[DeliveredPacket]) -> Vec<&[u8]> {
        delivered.iter().map(|p| p.payload.as_ref()).collect()
    }

    #[test]
    fn in_order_arrivals_deliver_immediately() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();
        let out = state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);
        assert_eq!(out.ack_seq, 0);
        assert_eq!(payloads(&out.delivered), vec![b"a"]);
        assert_eq!(out.delivered[0].seq, 0);
        assert_eq!(state.base_seq, 1);
    }

    #[test]
    fn out_of_order_arrival_buffers_until_hole_fills() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();

        let out = state.on_reliable(1, 0, Bytes::from_static(b"b"), 0, now);
        assert_eq!(out.ack_seq, 1);
        assert!(out.delivered.is_empty());
        assert_eq!(state.base_seq, 0);

        let out = state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);
        assert_eq!(out.ack_seq, 0);
        assert_eq!(payloads(&out.delivered), vec![b"a" as &[u8], b"b"]);
        assert_eq!(state.base_seq, 2);
    }

    #[test]
    fn duplicate_in_window_is_acked_but_not_redelivered() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();
        state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);

        let out = state.on_reliable(0, 1, Bytes::from_static(b"a-retransmit"), 0, now);
        assert_eq!(out.ack_seq, 0);
        assert!(out.delivered.is_empty());
    }

    #[test]
    fn duplicate_behind_window_is_acked_only() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();
        state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);
        state.on_reliable(1, 0, Bytes::from_static(b"b"), 0, now);

        let out = state.on_reliable(0, 1, Bytes::from_static(b"stale-retransmit"), 0, now);
        assert_eq!(out.ack_seq, 0);
        assert!(out.delivered.is_empty());
    }

    #[test]
    fn skip_timeout_abandons_hole_and_releases_buffered_tail() {
        let mut state = ReceiverState::new(&cfg());
        let t0 = Instant::now();

        // seq 0 never arrives; 1 and 2 arrive out of order and buffer behind
        // the hole, arming the skip timer on the first out-of-order arrival.
        state.on_reliable(1, 0, Bytes::from_static(b"b"), 0, t0);
        state.on_reliable(2, 0, Bytes::from_static(b"c"), 0, t0);
        assert_eq!(state.base_seq, 0);

        let t1 = t0 + state.skip_timeout;
        let (seq, generation) = state.timers.pop_due(t1).unwrap();
        match state.on_skip_timeout(seq, generation, t1) {
            SkipOutcome::Skipped { skipped_seq, delivered } => {
                assert_eq!(skipped_seq, 0);
                assert_eq!(payloads(&delivered), vec![b"b" as &[u8], b"c"]);
            }
            SkipOutcome::Stale => panic!("expected a live skip"),
        }
        assert_eq!(state.base_seq, 3);
        assert_eq!(state.metrics().skipped_packets, 1);
    }

    #[test]
    fn skip_timer_is_stale_once_hole_fills_first() {
        let mut state = ReceiverState::new(&cfg());
        let t0 = Instant::now();

        // An out-of-order arrival arms the skip timer for the hole at 0.
        state.on_reliable(1, 0, Bytes::from_static(b"b"), 0, t0);
        let (seq, generation) = state.timers.pop_due(t0 + state.skip_timeout).unwrap();

        // Hole fills after the timer already fired-and-was-popped, but
        // before the driver got around to acting on it.
        state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, t0);
        match state.on_skip_timeout(seq, generation, t0 + state.skip_timeout) {
            SkipOutcome::Stale => {}
            SkipOutcome::Skipped { .. } => panic!("timer for a filled hole must be stale"),
        }
    }

    #[test]
    fn idle_receiver_arms_no_skip_timer() {
        let mut state = ReceiverState::new(&cfg());
        assert!(state.next_wakeup().is_none());

        // Nothing buffered ahead of the hole; rearming must stay a no-op,
        // or an idle receiver would eventually fabricate a skip for a
        // sequence its peer simply hasn't sent yet.
        state.rearm_skip_timer(Instant::now());
        assert!(state.next_wakeup().is_none());
    }

    #[test]
    fn in_order_arrivals_never_arm_a_skip_timer() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();
        state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);
        state.on_reliable(1, 0, Bytes::from_static(b"b"), 0, now);
        assert!(state.next_wakeup().is_none());
    }

    #[test]
    fn unreliable_delivers_without_ordering_state() {
        let mut state = ReceiverState::new(&cfg());
        let packet = state.on_unreliable(0, 0, Bytes::from_static(b"x"), 0);
        assert_eq!(packet.payload, Bytes::from_static(b"x"));
        assert_eq!(packet.seq, 0);
        assert_eq!(state.metrics().unreliable.received_packets, 1);
    }

    #[test]
    fn duplicate_does_not_inflate_metrics() {
        let mut state = ReceiverState::new(&cfg());
        let now = Instant::now();
        state.on_reliable(0, 0, Bytes::from_static(b"a"), 0, now);
        state.on_reliable(0, 1, Bytes::from_static(b"a-retransmit"), 0, now);
        assert_eq!(state.metrics().reliable.received_packets, 1);
    }

    #[test]
    fn out_of_window_arrival_does_not_inflate_metrics() {
        let mut state = ReceiverState::new(&cfg());
        let out = state.on_reliable(999, 0, Bytes::from_static(b"z"), 0, Instant::now());
        assert_eq!(out.ack_seq, 999);
        assert_eq!(state.metrics().reliable.received_packets, 0);
    }
}
