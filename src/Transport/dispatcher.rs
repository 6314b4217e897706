use super::endpoint::Endpoint;
use super::notify::{Doorbell, NotificationBridge, Wake, WakeQueue};
use crate::Core::error::{Result, TransportError};
use crate::Ring::Buffer::RingView;
use crate::Ring::Structs::Buffer_Structs::FrameHeader;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// The frame at the ring's read position, handed to a [`FrameHandler`].
///
/// Offsets are payload-relative. The dispatcher consumes the frame once the handler
/// returns, so nothing here advances the ring.
pub struct Frame<'a> {
    ring: &'a RingView,
    header: FrameHeader,
}

impl<'a> Frame<'a> {
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    pub fn sequence(&self) -> u64 {
        self.header.sequence
    }

    pub fn kind(&self) -> u32 {
        self.header.kind
    }

    pub fn payload_len(&self) -> usize {
        self.header.payload_len as usize
    }

    /// Copy payload bytes `[start, end_offset)` into `dst`, clipped to the payload and
    /// to `dst`. Returns the number of bytes copied.
    pub fn copy_out(&self, dst: &mut [u8], start: usize, end_offset: usize) -> Result<usize> {
        self.ring.copy_out_offset(dst, start, end_offset, false)?;
        let end = end_offset.min(self.payload_len());
        Ok(end.saturating_sub(start).min(dst.len()))
    }

    /// The whole payload.
    pub fn read_payload(&self) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; self.payload_len()];
        self.copy_out(&mut payload, 0, self.payload_len())?;
        Ok(payload)
    }
}

/// Consumer-side protocol logic for one endpoint.
pub trait FrameHandler: Send {
    /// Handle one frame. Errors other than `MalformedFrame` are logged and the frame
    /// is dropped; `MalformedFrame` faults the endpoint.
    fn on_frame(&mut self, frame: Frame<'_>) -> Result<()>;

    /// The endpoint was torn down after a protocol violation.
    fn on_fault(&mut self, _err: &TransportError) {}
}

impl<F> FrameHandler for F
where
    F: FnMut(Frame<'_>) -> Result<()> + Send,
{
    fn on_frame(&mut self, frame: Frame<'_>) -> Result<()> {
        self(frame)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Draining,
    Disabled,
}

/// What one [`Dispatcher::run_once`] did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Ring emptied.
    Empty { frames: usize },
    /// Budget ran out with frames left; the dispatcher re-queued itself.
    BudgetExhausted { frames: usize },
    /// Another drain was in progress; it will see the new work on its next read.
    AlreadyDraining,
    Disabled,
    /// No ring (released or faulted).
    Unbound,
    /// A malformed frame faulted the endpoint during this drain.
    Faulted { frames: usize },
}

/// Start/stop hook the quiesce controller drives without knowing the handler type.
pub trait DrainControl: Send + Sync {
    /// Stop draining; returns once any drain in progress has finished.
    fn disable(&self);
    fn enable(&self);
}

/// The single execution context allowed to drain an endpoint's ring.
pub struct Dispatcher<H: FrameHandler> {
    endpoint: Arc<Endpoint>,
    /// Doubles as the drain lock: whoever holds the handler is the one draining.
    handler: Mutex<H>,
    state: Mutex<DispatchState>,
    enabled: AtomicBool,
    wake: Arc<WakeQueue>,
    budget: usize,
}

impl<H: FrameHandler> Dispatcher<H> {
    pub fn new(endpoint: Arc<Endpoint>, handler: H, budget: usize) -> Self {
        Self {
            endpoint,
            handler: Mutex::new(handler),
            state: Mutex::new(DispatchState::Idle),
            enabled: AtomicBool::new(true),
            wake: Arc::new(WakeQueue::new()),
            budget: budget.max(1),
        }
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn state(&self) -> DispatchState {
        *self.state.lock()
    }

    pub fn wake_queue(&self) -> &Arc<WakeQueue> {
        &self.wake
    }

    /// Request a drain. Coalesces with any wakeup not yet serviced.
    pub fn wake(&self) {
        self.wake.raise();
    }

    /// Access the handler between drains.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        f(&mut self.handler.lock())
    }

    /// Drain up to `budget` frames.
    pub fn run_once(&self) -> DrainOutcome {
        if !self.enabled.load(Ordering::Acquire) {
            return DrainOutcome::Disabled;
        }
        let Some(mut handler) = self.handler.try_lock() else {
            self.wake.raise();
            return DrainOutcome::AlreadyDraining;
        };
        if !self.enabled.load(Ordering::Acquire) {
            return DrainOutcome::Disabled;
        }
        let ring = match self.endpoint.ring() {
            Ok(ring) => ring,
            Err(_) => return DrainOutcome::Unbound,
        };

        *self.state.lock() = DispatchState::Draining;
        let mut frames = 0;
        let outcome = loop {
            if frames == self.budget {
                self.wake.raise();
                break DrainOutcome::BudgetExhausted { frames };
            }
            let header = match ring.peek_header() {
                Ok(Some(header)) => header,
                Ok(None) => break DrainOutcome::Empty { frames },
                Err(e) => {
                    self.fault(&mut *handler, &e);
                    break DrainOutcome::Faulted { frames };
                }
            };

            let handled = handler.on_frame(Frame {
                ring: &ring,
                header,
            });
            match handled {
                Ok(()) => {}
                Err(e @ TransportError::MalformedFrame(_)) => {
                    self.fault(&mut *handler, &e);
                    break DrainOutcome::Faulted { frames };
                }
                Err(TransportError::UnmatchedReply(sequence)) => {
                    tracing::debug!(local = %self.endpoint.local(), sequence, "unmatched reply dropped");
                }
                Err(e) => {
                    tracing::warn!(
                        local = %self.endpoint.local(),
                        sequence = header.sequence,
                        kind = header.kind,
                        error = %e,
                        "frame handler failed; frame dropped"
                    );
                }
            }

            if let Err(e) = ring.consume(header.framed_len()) {
                self.fault(&mut *handler, &e);
                break DrainOutcome::Faulted { frames };
            }
            frames += 1;
        };

        if frames > 0 && ring.take_stalled() {
            NotificationBridge::notify_peer(&ring, Doorbell::Space);
        }
        *self.state.lock() = DispatchState::Idle;
        outcome
    }

    fn fault(&self, handler: &mut H, err: &TransportError) {
        self.endpoint.fault(err);
        handler.on_fault(err);
    }
}

impl<H: FrameHandler + 'static> Dispatcher<H> {
    /// Run the dispatcher on its own thread, fed by a doorbell watcher on the
    /// endpoint's current ring. The watcher follows the endpoint across rebinds.
    pub fn spawn(self: &Arc<Self>, fallback: Duration) -> DispatcherWorker {
        let dispatcher = self.clone();
        let wake = self.wake.clone();
        let thread = std::thread::spawn(move || {
            let mut bridge: Option<NotificationBridge> = None;
            loop {
                dispatcher.rearm(&mut bridge, fallback);
                if dispatcher.wake.wait(fallback) == Wake::Closed {
                    break;
                }
                dispatcher.run_once();
            }
            if let Some(mut bridge) = bridge.take() {
                bridge.stop();
            }
        });
        DispatcherWorker {
            wake,
            thread: Some(thread),
        }
    }

    fn rearm(&self, bridge: &mut Option<NotificationBridge>, fallback: Duration) {
        let current = self.endpoint.ring().ok();
        let stale = match (bridge.as_ref(), current.as_ref()) {
            (Some(b), Some(ring)) => !Arc::ptr_eq(b.ring(), ring),
            (None, None) => false,
            _ => true,
        };
        if !stale {
            return;
        }
        if let Some(mut old) = bridge.take() {
            old.stop();
        }
        if let Some(ring) = current {
            let mut fresh = NotificationBridge::new(ring, Doorbell::Data, fallback);
            let wake = self.wake.clone();
            fresh.on_notified(move || {
                wake.raise();
            });
            *bridge = Some(fresh);
        }
    }
}

impl<H: FrameHandler> DrainControl for Dispatcher<H> {
    fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
        // Wait out a drain in progress.
        drop(self.handler.lock());
        *self.state.lock() = DispatchState::Disabled;
    }

    fn enable(&self) {
        *self.state.lock() = DispatchState::Idle;
        self.enabled.store(true, Ordering::Release);
        self.wake.raise();
    }
}

/// Handle to a dispatcher thread; stops and joins it on drop.
pub struct DispatcherWorker {
    wake: Arc<WakeQueue>,
    thread: Option<JoinHandle<()>>,
}

impl DispatcherWorker {
    pub fn stop(&mut self) {
        self.wake.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("dispatcher thread panicked");
            }
        }
    }
}

impl Drop for DispatcherWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
