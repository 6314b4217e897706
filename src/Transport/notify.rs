// Doorbells between peers and wakeup tokens for the local dispatcher.
//
// The watcher thread stands in for interrupt context: it never touches a ring or a
// table, it only raises a token. All real work happens in the dispatcher.

use crate::Core::futex::{futex_wait, futex_wake};
use crate::Ring::Buffer::RingView;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Which of a ring's two doorbells.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Doorbell {
    /// Rung by the producer after publishing frames.
    Data,
    /// Rung by the consumer after freeing space for a stalled producer.
    Space,
}

impl Doorbell {
    pub fn word(self, ring: &RingView) -> &AtomicU32 {
        match self {
            Doorbell::Data => ring.data_signal(),
            Doorbell::Space => ring.space_signal(),
        }
    }
}

/// Why [`WakeQueue::wait`] returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wake {
    Token,
    Timeout,
    Closed,
}

#[derive(Default)]
struct WakeState {
    raised: bool,
    closed: bool,
}

/// Single-consumer, coalescing wakeup queue.
///
/// Any number of `raise` calls before the consumer gets to `take`/`wait` collapse into
/// one token.
#[derive(Default)]
pub struct WakeQueue {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if a token was already pending (coalesced) or the queue is closed.
    pub fn raise(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.raised {
            return false;
        }
        state.raised = true;
        self.cond.notify_one();
        true
    }

    /// Consume the pending token, if any, without blocking.
    pub fn take(&self) -> bool {
        std::mem::take(&mut self.state.lock().raised)
    }

    pub fn is_raised(&self) -> bool {
        self.state.lock().raised
    }

    /// Block until a token is raised, the queue is closed, or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Wake {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Wake::Closed;
            }
            if state.raised {
                state.raised = false;
                return Wake::Token;
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.closed {
                    return Wake::Closed;
                }
                if std::mem::take(&mut state.raised) {
                    return Wake::Token;
                }
                return Wake::Timeout;
            }
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Watches one doorbell of one ring and turns rings into callbacks.
pub struct NotificationBridge {
    ring: Arc<RingView>,
    doorbell: Doorbell,
    fallback: Duration,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl NotificationBridge {
    /// Ring the peer's doorbell.
    ///
    /// The word is bumped rather than set so a waiter that sampled it before the
    /// change cannot sleep through it; any number of bumps wake a waiter once.
    pub fn notify_peer(ring: &RingView, doorbell: Doorbell) {
        let word = doorbell.word(ring);
        word.fetch_add(1, Ordering::Release);
        futex_wake(word);
    }

    pub fn new(ring: Arc<RingView>, doorbell: Doorbell, fallback: Duration) -> Self {
        Self {
            ring,
            doorbell,
            fallback,
            stop: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    pub fn ring(&self) -> &Arc<RingView> {
        &self.ring
    }

    pub fn doorbell(&self) -> Doorbell {
        self.doorbell
    }

    /// Start delivering doorbells to `callback`.
    ///
    /// The callback runs once immediately (frames may predate registration), then once
    /// per observed doorbell change and once per `fallback` period of silence. It must
    /// not block; the intended callback raises a [`WakeQueue`] token.
    /// Re-registering replaces the previous callback.
    pub fn on_notified<F>(&mut self, mut callback: F)
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();
        self.stop.store(false, Ordering::Release);

        let ring = self.ring.clone();
        let doorbell = self.doorbell;
        let fallback = self.fallback;
        let stop = self.stop.clone();

        self.watcher = Some(std::thread::spawn(move || {
            let word = doorbell.word(&ring);
            let mut seen = word.load(Ordering::Acquire);
            callback();
            loop {
                futex_wait(word, seen, Some(fallback));
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let now = word.load(Ordering::Acquire);
                if now == seen {
                    tracing::trace!(?doorbell, "notification fallback");
                }
                seen = now;
                callback();
            }
        }));
    }

    /// Stop and join the watcher. The doorbell is bumped to get it out of its wait,
    /// which the peer sees as one spurious notification.
    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            self.stop.store(true, Ordering::Release);
            Self::notify_peer(&self.ring, self.doorbell);
            if watcher.join().is_err() {
                tracing::warn!(doorbell = ?self.doorbell, "notification watcher panicked");
            }
        }
    }
}

impl Drop for NotificationBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
