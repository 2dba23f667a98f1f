//! Sender Core. See `SPEC_FULL.md` §4.3.
//!
//! Split the way the teacher's `dispatcher.rs` splits `ControlDispatcher`
//! (public, cloneable handle) from `dispatcher_task` (the single task that
//! actually owns the mutable state): [`SenderState`] is pure and
//! synchronous (unit-tested directly, fed synthetic `Instant`s), and
//! [`Sender`] is the async handle plus the driver task that owns a
//! `SenderState` and talks to a [`DatagramEndpoint`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use pulsepath_metrics::SenderMetrics;
use pulsepath_wire::{next_seq, Channel, Header};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::endpoint::{DatagramEndpoint, UdpEndpoint};
use crate::error::{Result, TransportError};
use crate::timer_wheel::TimerWheel;

struct Slot {
    payload: Bytes,
    retrans_count: u8,
    generation: u64,
}

/// Outcome of processing an inbound ACK.
struct AckOutcome {
    /// Number of window permits the caller should return to the gate.
    permits_released: u32,
}

/// Outcome of a retransmission-timer firing.
enum TimeoutOutcome {
    /// The timer was stale (slot reused or already acked); do nothing.
    Stale,
    /// Resend these bytes and arm a new timer at the returned deadline.
    Resend { bytes: Bytes, deadline: Instant },
    /// Retry budget exhausted; slot abandoned, release these many permits.
    Abandoned { permits_released: u32 },
}

/// Pure, synchronous reliable/unreliable send-side state machine.
pub(crate) struct SenderState {
    window_size: usize,
    max_retransmission_count: u8,
    retransmission_timeout: Duration,
    next_reliable_seq: u16,
    next_unreliable_seq: u16,
    base_seq: u16,
    slots: Vec<Option<Slot>>,
    acked: Vec<bool>,
    timers: TimerWheel<u16>,
    next_generation: u64,
    metrics: SenderMetrics,
}

impl SenderState {
    fn new(cfg: &TransportConfig) -> Self {
        Self {
            window_size: cfg.window_size,
            max_retransmission_count: cfg.max_retransmission_count,
            retransmission_timeout: cfg.retransmission_timeout,
            next_reliable_seq: 0,
            next_unreliable_seq: 0,
            base_seq: 0,
            slots: (0..cfg.window_size).map(|_| None).collect(),
            acked: vec![false; cfg.window_size],
            timers: TimerWheel::new(),
            next_generation: 0,
            metrics: SenderMetrics::default(),
        }
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Unreliable send: never suspends, never buffered, never retransmitted.
    fn send_unreliable(&mut self, payload: &[u8]) -> Bytes {
        let seq = self.next_unreliable_seq;
        self.next_unreliable_seq = next_seq(self.next_unreliable_seq);
        self.metrics.unreliable.sent_packets += 1;
        Header::pack(Channel::Unreliable, seq, 0, payload)
    }

    /// Reliable send. Caller must already hold a window-gate permit.
    fn begin_reliable(&mut self, payload: Bytes, now: Instant) -> Bytes {
        let seq = self.next_reliable_seq;
        let idx = seq as usize % self.window_size;
        debug_assert!(!self.acked[idx] && self.slots[idx].is_none(), "slot {idx} not free");

        self.next_reliable_seq = next_seq(self.next_reliable_seq);
        let generation = self.bump_generation();
        let bytes = Header::pack(Channel::Reliable, seq, 0, &payload);

        self.slots[idx] = Some(Slot {
            payload,
            retrans_count: 0,
            generation,
        });
        self.timers
            .schedule(now + self.retransmission_timeout, seq, generation);
        self.metrics.reliable.sent_packets += 1;
        bytes
    }

    fn in_window(&self, seq: u16) -> bool {
        in_window_forward(seq, self.base_seq, self.window_size as u16)
    }

    /// Cumulative-advance driven by selective acks, as spec.md §4.3 describes.
    fn advance_base(&mut self) -> u32 {
        let mut released = 0;
        while self.acked[self.base_seq as usize % self.window_size] {
            self.acked[self.base_seq as usize % self.window_size] = false;
            self.base_seq = next_seq(self.base_seq);
            released += 1;
        }
        released
    }

    fn handle_ack(&mut self, seq: u16) -> AckOutcome {
        if !self.in_window(seq) {
            return AckOutcome { permits_released: 0 };
        }
        let idx = seq as usize % self.window_size;
        if self.acked[idx] {
            return AckOutcome { permits_released: 0 };
        }
        self.acked[idx] = true;
        self.slots[idx] = None;
        AckOutcome {
            permits_released: self.advance_base(),
        }
    }

    fn handle_timeout(&mut self, seq: u16, generation: u64, now: Instant) -> TimeoutOutcome {
        let idx = seq as usize % self.window_size;
        let still_live = matches!(&self.slots[idx], Some(slot) if slot.generation == generation);
        if !still_live {
            return TimeoutOutcome::Stale;
        }

        let retrans_count_so_far = self.slots[idx].as_ref().unwrap().retrans_count;
        if retrans_count_so_far == self.max_retransmission_count {
            self.acked[idx] = true;
            self.slots[idx] = None;
            return TimeoutOutcome::Abandoned {
                permits_released: self.advance_base(),
            };
        }

        let new_retrans_count = retrans_count_so_far + 1;
        let new_generation = self.bump_generation();
        let payload = self.slots[idx].as_ref().unwrap().payload.clone();
        let bytes = Header::pack(Channel::Reliable, seq, new_retrans_count, &payload);

        let slot = self.slots[idx].as_mut().unwrap();
        slot.retrans_count = new_retrans_count;
        slot.generation = new_generation;

        let deadline = now + self.retransmission_timeout;
        self.timers.schedule(deadline, seq, new_generation);
        self.metrics.retransmissions += 1;
        TimeoutOutcome::Resend { bytes, deadline }
    }

    fn next_wakeup(&mut self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn is_drained(&self) -> bool {
        self.base_seq == self.next_reliable_seq
    }

    fn metrics(&self) -> SenderMetrics {
        self.metrics
    }
}

/// `[base_seq, base_seq + window_size)` modulo `MAX_SEQ`.
fn in_window_forward(seq: u16, base: u16, window_size: u16) -> bool {
    let max_seq = pulsepath_wire::MAX_SEQ as u32;
    let offset = (seq as u32 + max_seq - base as u32) % max_seq;
    offset < window_size as u32
}

enum Command {
    SendUnreliable(Bytes),
    SendReliable(Bytes),
    Close(oneshot::Sender<SenderMetrics>),
}

/// Public handle to a connected reliable/unreliable sender. Cheap to clone.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<Inner>,
}

struct Inner {
    cmd_tx: mpsc::Sender<Command>,
    gate: Arc<Semaphore>,
    local_addr: SocketAddr,
    /// Set once `close` completes; makes a repeated `close` an idempotent
    /// no-op instead of an error, per `base.py`'s start/stop lifecycle.
    closed: std::sync::Mutex<Option<SenderMetrics>>,
}

impl Sender {
    /// Bind locally (if `local_addr` given) and latch `remote_addr` as the
    /// single peer this sender talks to.
    pub async fn connect(remote_addr: SocketAddr, local_addr: SocketAddr, cfg: TransportConfig) -> Result<Self> {
        let (endpoint, mut datagrams) = UdpEndpoint::bind(local_addr).await?;
        let bound_addr = endpoint.local_addr()?;
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
        let gate = Arc::new(Semaphore::new(cfg.window_size));

        tokio::spawn(async move {
            let mut state = SenderState::new(&cfg);
            let mut pending_close: Option<oneshot::Sender<SenderMetrics>> = None;

            loop {
                if let Some(tx) = pending_close.take() {
                    if state.is_drained() {
                        let _ = tx.send(state.metrics());
                        break;
                    }
                    pending_close = Some(tx);
                }

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
                            match state.handle_timeout(seq, generation, now) {
                                TimeoutOutcome::Stale => {}
                                TimeoutOutcome::Resend { bytes, .. } => {
                                    debug!(seq, "retransmitting reliable packet");
                                    endpoint.send_to(&bytes, remote_addr).await;
                                }
                                TimeoutOutcome::Abandoned { permits_released } => {
                                    warn!(seq, "retransmission budget exhausted, abandoning slot");
                                    if permits_released > 0 {
                                        gate.add_permits(permits_released as usize);
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
                        match Header::unpack(&bytes) {
                            Ok((hdr, _)) if hdr.channel == Channel::Ack => {
                                let outcome = state.handle_ack(hdr.seq);
                                if outcome.permits_released > 0 {
                                    gate.add_permits(outcome.permits_released as usize);
                                }
                            }
                            Ok(_) => {} // senders don't process data packets
                            Err(e) => warn!(error = %e, "malformed datagram"),
                        }
                    }

                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None => break,
                            Some(Command::SendUnreliable(payload)) => {
                                let bytes = state.send_unreliable(&payload);
                                endpoint.send_to(&bytes, remote_addr).await;
                            }
                            Some(Command::SendReliable(payload)) => {
                                let bytes = state.begin_reliable(payload, Instant::now());
                                endpoint.send_to(&bytes, remote_addr).await;
                            }
                            Some(Command::Close(tx)) => {
                                pending_close = Some(tx);
                            }
                        }
                    }
                }
            }

            endpoint.close().await;
        });

        Ok(Self {
            inner: Arc::new(Inner {
                cmd_tx,
                gate,
                local_addr: bound_addr,
                closed: std::sync::Mutex::new(None),
            }),
        })
    }

    /// The address actually bound, useful when `local_addr` was `:0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Enqueue `payload` for transmission. The reliable variant suspends
    /// while the send window is full; the unreliable variant never does.
    pub async fn send(&self, payload: Bytes, reliable: bool) -> Result<()> {
        if reliable {
            let permit = self
                .inner
                .gate
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed while sender is alive");
            permit.forget();
            self.inner
                .cmd_tx
                .send(Command::SendReliable(payload))
                .await
                .map_err(|_| TransportError::NotStarted)
        } else {
            self.inner
                .cmd_tx
                .send(Command::SendUnreliable(payload))
                .await
                .map_err(|_| TransportError::NotStarted)
        }
    }

    /// Wait (bounded by [`TransportConfig::drain_timeout`]) for the reliable
    /// window to drain, then release the endpoint and return final metrics.
    /// Idempotent: a call after the first returns the same metrics rather
    /// than erroring.
    pub async fn close(&self, drain_timeout: Duration) -> Result<SenderMetrics> {
        if let Some(metrics) = *self.inner.closed.lock().expect("not poisoned") {
            return Ok(metrics);
        }

        let (tx, rx) = oneshot::channel();
        if self.inner.cmd_tx.send(Command::Close(tx)).await.is_err() {
            return Err(TransportError::NotStarted);
        }
        match tokio_timeout(drain_timeout, rx).await {
            Ok(Ok(metrics)) => {
                *self.inner.closed.lock().expect("not poisoned") = Some(metrics);
                Ok(metrics)
            }
            _ => Err(TransportError::NotStarted),
        }
    }
}
