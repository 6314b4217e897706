// Request correlation: sequence number -> in-flight request.

use crate::Core::error::{Result, TransportError};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::{Duration, Instant};

/// What to do when a request finishes.
///
/// Called exactly once per allocated request, with the reply result or `Cancelled`,
/// and never while the table lock is held.
pub trait Completion: Send {
    type Output;

    fn complete(self, result: Result<Self::Output>);
}

/// Boxed-closure completion.
pub struct Callback<T>(Box<dyn FnOnce(Result<T>) + Send>);

impl<T> Callback<T> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self(Box::new(f))
    }
}

impl<T> Completion for Callback<T> {
    type Output = T;

    fn complete(self, result: Result<T>) {
        (self.0)(result)
    }
}

impl<T> fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Callback(..)")
    }
}

/// An allocated request waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest<C> {
    pub sequence: u64,
    pub context: C,
    pub issued_at: Instant,
}

/// `allocate` found every id in use. Carries the context back to the caller.
#[derive(Debug)]
pub struct Exhausted<C>(pub C);

impl<C> From<Exhausted<C>> for TransportError {
    fn from(_: Exhausted<C>) -> Self {
        TransportError::ExhaustedIds
    }
}

/// Sequence layout: generation in the high half, slot in the low half.
#[inline]
fn split(sequence: u64) -> (u32, usize) {
    ((sequence >> 32) as u32, (sequence & 0xffff_ffff) as usize)
}

struct Slots<C> {
    entries: Vec<Option<PendingRequest<C>>>,
    generations: Vec<u32>,
    cursor: usize,
    pending: usize,
}

/// Bounded table of in-flight requests for one endpoint.
///
/// Ids are handed out cyclically from `id_space` slots, so a slot is not reused until
/// every other free one has been. Each allocation bumps the slot's generation, which
/// makes a late reply for an earlier occupant of the same slot unmatched instead of
/// misrouted.
pub struct CorrelationTable<C: Completion> {
    slots: Mutex<Slots<C>>,
    drained: Condvar,
}

impl<C: Completion> CorrelationTable<C> {
    pub fn new(id_space: u32) -> Self {
        let id_space = id_space.max(1) as usize;
        let mut entries = Vec::with_capacity(id_space);
        entries.resize_with(id_space, || None);
        Self {
            slots: Mutex::new(Slots {
                entries,
                generations: vec![0; id_space],
                cursor: 0,
                pending: 0,
            }),
            drained: Condvar::new(),
        }
    }

    pub fn id_space(&self) -> usize {
        self.slots.lock().entries.len()
    }

    /// Register `context` and return the sequence number to put on the request.
    pub fn allocate(&self, context: C) -> std::result::Result<u64, Exhausted<C>> {
        let mut slots = self.slots.lock();
        let len = slots.entries.len();
        if slots.pending == len {
            tracing::trace!(id_space = len, "request ids exhausted");
            return Err(Exhausted(context));
        }
        let start = slots.cursor;
        let Some(slot) = (0..len)
            .map(|step| (start + step) % len)
            .find(|&i| slots.entries[i].is_none())
        else {
            return Err(Exhausted(context));
        };

        let generation = slots.generations[slot].wrapping_add(1);
        slots.generations[slot] = generation;
        let sequence = (u64::from(generation) << 32) | slot as u64;
        slots.entries[slot] = Some(PendingRequest {
            sequence,
            context,
            issued_at: Instant::now(),
        });
        slots.cursor = (slot + 1) % len;
        slots.pending += 1;
        Ok(sequence)
    }

    /// Remove and return the request for `sequence`. Exactly one caller wins.
    pub fn take(&self, sequence: u64) -> Option<PendingRequest<C>> {
        let (generation, slot) = split(sequence);
        let mut slots = self.slots.lock();
        if slot >= slots.entries.len() || slots.generations[slot] != generation {
            return None;
        }
        let request = slots.entries[slot].take()?;
        slots.pending -= 1;
        if slots.pending == 0 {
            self.drained.notify_all();
        }
        Some(request)
    }

    /// Back out an allocation whose request was never sent. The completion is not run.
    pub fn release(&self, sequence: u64) -> Option<C> {
        self.take(sequence).map(|request| request.context)
    }

    /// Deliver a reply. An unknown sequence (duplicate, spurious or already cancelled)
    /// is reported as `UnmatchedReply` and otherwise ignored.
    pub fn complete(&self, sequence: u64, result: Result<C::Output>) -> Result<()> {
        match self.take(sequence) {
            Some(request) => {
                request.context.complete(result);
                Ok(())
            }
            None => {
                tracing::debug!(sequence, "reply for unknown request");
                Err(TransportError::UnmatchedReply(sequence))
            }
        }
    }

    /// Complete `sequence` with `Cancelled`. Returns false if a reply got there first.
    pub fn cancel(&self, sequence: u64) -> bool {
        match self.take(sequence) {
            Some(request) => {
                request.context.complete(Err(TransportError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight. Returns how many requests were cancelled.
    pub fn cancel_all(&self) -> usize {
        let cancelled: Vec<PendingRequest<C>> = {
            let mut slots = self.slots.lock();
            let taken: Vec<_> = slots.entries.iter_mut().filter_map(Option::take).collect();
            slots.pending = 0;
            self.drained.notify_all();
            taken
        };
        let count = cancelled.len();
        for request in cancelled {
            request.context.complete(Err(TransportError::Cancelled));
        }
        if count > 0 {
            tracing::info!(count, "cancelled in-flight requests");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.slots.lock().pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Wait until nothing is pending. Returns false if `timeout` passed first.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slots = self.slots.lock();
        while slots.pending > 0 {
            if self.drained.wait_until(&mut slots, deadline).timed_out() {
                return slots.pending == 0;
            }
        }
        true
    }

    /// Sequence and issue time of the longest-waiting request.
    pub fn oldest_pending(&self) -> Option<(u64, Instant)> {
        self.slots
            .lock()
            .entries
            .iter()
            .flatten()
            .min_by_key(|request| request.issued_at)
            .map(|request| (request.sequence, request.issued_at))
    }
}
