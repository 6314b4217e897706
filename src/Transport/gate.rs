use super::endpoint::Endpoint;
use super::notify::{Doorbell, NotificationBridge};
use crate::Core::error::{Result, TransportError};
use crate::Core::futex::futex_wait;
use crate::Ring::Buffer::RingView;
use crate::Ring::Structs::Buffer_Structs::Message;
use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Send path for one endpoint.
///
/// `Overflow` is never a failed send: the gate marks the ring stalled so the consumer
/// rings the space doorbell, and hands `Overflow` back for the caller to requeue
/// (or waits itself in [`FlowControlGate::send_blocking`]). Nothing is ever dropped.
///
/// A peer ring with corrupt offsets faults the gate's endpoint and the send fails
/// with `Faulted`; `MalformedFrame` never escapes a send.
pub struct FlowControlGate {
    endpoint: Arc<Endpoint>,
    stalls: AtomicU64,
    sent: AtomicU64,
}

impl FlowControlGate {
    pub fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            stalls: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Write one frame and ring the peer's data doorbell.
    pub fn send(&self, sequence: u64, kind: u32, segments: &[&[u8]]) -> Result<usize> {
        let ring = self.endpoint.ring()?;
        self.send_on(&ring, sequence, kind, segments)
    }

    pub fn send_message(&self, msg: &Message) -> Result<usize> {
        self.send(msg.sequence, msg.kind, &[&msg.payload])
    }

    fn send_on(&self, ring: &RingView, sequence: u64, kind: u32, segments: &[&[u8]]) -> Result<usize> {
        let written = match ring.write_vectored(sequence, kind, segments) {
            Err(TransportError::Overflow) => {
                self.stalls.fetch_add(1, Ordering::Relaxed);
                ring.mark_stalled();
                // The consumer may have freed space between the failed write and the
                // stall bit landing; without this retry nobody would ring us.
                ring.write_vectored(sequence, kind, segments)
            }
            other => other,
        };
        match written {
            Ok(framed) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                NotificationBridge::notify_peer(ring, Doorbell::Data);
                Ok(framed)
            }
            Err(TransportError::Overflow) => {
                tracing::trace!(
                    remote = %self.endpoint.remote(),
                    sequence,
                    free = ring.free_space(),
                    "ring full"
                );
                Err(TransportError::Overflow)
            }
            Err(e @ TransportError::MalformedFrame(_)) => {
                // The peer's ring is corrupt. Fault this endpoint, not whichever one
                // the caller happens to be draining.
                self.endpoint.fault(&e);
                Err(TransportError::Faulted)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`FlowControlGate::send`], but waits out `Overflow` until the peer frees
    /// space or `timeout` passes (`None` waits indefinitely).
    pub fn send_blocking(
        &self,
        sequence: u64,
        kind: u32,
        segments: &[&[u8]],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let backoff = Backoff::new();
        loop {
            let ring = self.endpoint.ring()?;
            // Sample before trying so a doorbell rung after the failed write still wakes us.
            let seen = ring.space_signal().load(Ordering::Acquire);
            match self.send_on(&ring, sequence, kind, segments) {
                Err(TransportError::Overflow) => {}
                other => return other,
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Overflow);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            if backoff.is_completed() {
                futex_wait(ring.space_signal(), seen, remaining);
            } else {
                backoff.snooze();
            }
        }
    }

    /// How many sends found the ring full.
    pub fn stall_count(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }

    /// Frames successfully written.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}
