// Display damage coalescing: many damage reports, at most one message per period.

use super::gate::FlowControlGate;
use super::notify::{Wake, WakeQueue};
use crate::Core::error::Result;
use crate::Ring::Structs::Buffer_Structs::{DirtyRectMsg, KIND_DIRTY_RECT};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Half-open rectangle `[left, right) x [top, bottom)`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub const fn new(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    /// Smallest rectangle covering both. An empty side contributes nothing.
    pub fn union(self, other: Rect) -> Rect {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        Rect {
            left: self.left.min(other.left),
            top: self.top.min(other.top),
            right: self.right.max(other.right),
            bottom: self.bottom.max(other.bottom),
        }
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.is_empty()
            || (self.left <= other.left
                && self.top <= other.top
                && self.right >= other.right
                && self.bottom >= other.bottom)
    }

    pub fn area(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        u64::from(self.right - self.left) * u64::from(self.bottom - self.top)
    }
}

/// Damage accumulator for one display head.
#[derive(Debug)]
pub struct DirtyRegionAccumulator {
    head_id: u32,
    period: Duration,
    bounds: Rect,
    pending: bool,
    last_attempt: Option<Instant>,
    next_rect_id: u32,
}

impl DirtyRegionAccumulator {
    pub fn new(head_id: u32, period: Duration) -> Self {
        Self {
            head_id,
            period,
            bounds: Rect::EMPTY,
            pending: false,
            last_attempt: None,
            next_rect_id: 0,
        }
    }

    /// Grow the pending region to cover `rect`.
    pub fn damage(&mut self, rect: Rect) {
        if rect.is_empty() {
            return;
        }
        self.bounds = self.bounds.union(rect);
        self.pending = true;
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Time until a pending region may be sent; `None` if nothing is pending.
    pub fn due_in(&self, now: Instant) -> Option<Duration> {
        if !self.pending {
            return None;
        }
        Some(match self.last_attempt {
            Some(last) => (last + self.period).saturating_duration_since(now),
            None => Duration::ZERO,
        })
    }

    /// Send the pending region if the period has elapsed.
    ///
    /// A busy send (`Overflow` and friends) leaves the region pending for the next tick;
    /// any other send error is returned, also with the region kept, and the next
    /// attempt waits a full period.
    pub fn tick<F>(&mut self, now: Instant, send: F) -> Result<Option<DirtyRectMsg>>
    where
        F: FnOnce(&DirtyRectMsg) -> Result<()>,
    {
        if self.due_in(now) != Some(Duration::ZERO) {
            return Ok(None);
        }
        let msg = DirtyRectMsg {
            left: self.bounds.left,
            top: self.bounds.top,
            right: self.bounds.right,
            bottom: self.bounds.bottom,
            rect_id: self.next_rect_id,
            head_id: self.head_id,
        };
        match send(&msg) {
            Ok(()) => {
                self.bounds = Rect::EMPTY;
                self.pending = false;
                self.last_attempt = Some(now);
                self.next_rect_id = self.next_rect_id.wrapping_add(1);
                Ok(Some(msg))
            }
            Err(e) if e.is_busy() => {
                tracing::trace!(head = self.head_id, "dirty rect deferred: {e}");
                Ok(None)
            }
            Err(e) => {
                self.last_attempt = Some(now);
                Err(e)
            }
        }
    }
}

/// Background thread that ticks an accumulator and sends through a gate.
pub struct DirtyRegionTicker {
    accumulator: Arc<Mutex<DirtyRegionAccumulator>>,
    wake: Arc<WakeQueue>,
    thread: Option<JoinHandle<()>>,
}

impl DirtyRegionTicker {
    pub fn spawn(accumulator: DirtyRegionAccumulator, gate: Arc<FlowControlGate>) -> Self {
        let period = accumulator.period().max(Duration::from_millis(1));
        let accumulator = Arc::new(Mutex::new(accumulator));
        let wake = Arc::new(WakeQueue::new());

        let thread = {
            let accumulator = accumulator.clone();
            let wake = wake.clone();
            std::thread::spawn(move || loop {
                let wait = accumulator
                    .lock()
                    .due_in(Instant::now())
                    .unwrap_or(period)
                    .max(Duration::from_millis(1));
                if wake.wait(wait) == Wake::Closed {
                    break;
                }
                let sent = accumulator.lock().tick(Instant::now(), |msg| {
                    gate.send(u64::from(msg.rect_id), KIND_DIRTY_RECT, &[&msg.encode()])
                        .map(|_| ())
                });
                if let Err(e) = sent {
                    tracing::warn!(error = %e, "dirty rect send failed");
                }
            })
        };

        Self {
            accumulator,
            wake,
            thread: Some(thread),
        }
    }

    /// Report damage; the ticker sends it once the period allows.
    pub fn damage(&self, rect: Rect) {
        let mut accumulator = self.accumulator.lock();
        let was_pending = accumulator.is_pending();
        accumulator.damage(rect);
        if !was_pending && accumulator.is_pending() {
            self.wake.raise();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.accumulator.lock().is_pending()
    }

    pub fn stop(&mut self) {
        self.wake.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("dirty rect ticker panicked");
            }
        }
    }
}

impl Drop for DirtyRegionTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
