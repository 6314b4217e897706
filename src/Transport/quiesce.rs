use super::correlation::{Completion, CorrelationTable};
use super::dispatcher::DrainControl;
use super::endpoint::Endpoint;
use crate::Core::error::{Result, TransportError};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QuiesceState {
    Active,
    Draining,
    Suspended,
}

/// Proof that a request was admitted while the controller was `Active`.
///
/// Hold it across allocate-and-send; `suspend` cannot leave `Active` until every
/// admission is dropped, so no request slips in after draining starts.
pub struct Admission<'a> {
    _state: RwLockReadGuard<'a, QuiesceState>,
}

/// Suspend/resume for one endpoint pair: stop new requests, wait for in-flight ones,
/// then stop the dispatcher and release the rings.
pub struct QuiesceController<C: Completion> {
    state: RwLock<QuiesceState>,
    table: Arc<CorrelationTable<C>>,
    dispatcher: Arc<dyn DrainControl>,
    endpoints: Vec<Arc<Endpoint>>,
    log_interval: Duration,
    /// Serialises suspend/resume against each other.
    transition: Mutex<()>,
}

impl<C: Completion> QuiesceController<C> {
    pub fn new(
        table: Arc<CorrelationTable<C>>,
        dispatcher: Arc<dyn DrainControl>,
        endpoints: Vec<Arc<Endpoint>>,
        log_interval: Duration,
    ) -> Self {
        Self {
            state: RwLock::new(QuiesceState::Active),
            table,
            dispatcher,
            endpoints,
            log_interval,
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> QuiesceState {
        *self.state.read()
    }

    /// Admit one new request, or `Quiescing` ("device busy") unless `Active`.
    pub fn admit(&self) -> Result<Admission<'_>> {
        let state = self.state.read();
        if *state != QuiesceState::Active {
            tracing::trace!(state = ?*state, "request refused while quiescing");
            return Err(TransportError::Quiescing);
        }
        Ok(Admission { _state: state })
    }

    /// Drain and suspend. Blocks until every in-flight request has completed or been
    /// cancelled; while waiting it logs periodically and keeps waiting.
    pub fn suspend(&self) {
        let _transition = self.transition.lock();
        {
            let mut state = self.state.write();
            if *state != QuiesceState::Active {
                return;
            }
            *state = QuiesceState::Draining;
        }
        tracing::info!(pending = self.table.pending(), "suspending");

        while !self.table.wait_empty(self.log_interval) {
            let oldest = self
                .table
                .oldest_pending()
                .map(|(sequence, issued_at)| (sequence, issued_at.elapsed()));
            tracing::warn!(
                pending = self.table.pending(),
                ?oldest,
                "suspend still waiting for in-flight requests"
            );
        }

        self.dispatcher.disable();
        for endpoint in &self.endpoints {
            endpoint.release();
        }
        *self.state.write() = QuiesceState::Suspended;
        tracing::info!("suspended");
    }

    /// Rebind fresh rings and reopen for requests.
    ///
    /// If a rebind fails the controller stays `Suspended` and the error is returned.
    pub fn resume(&self) -> Result<()> {
        let _transition = self.transition.lock();
        if *self.state.read() != QuiesceState::Suspended {
            return Ok(());
        }
        for endpoint in &self.endpoints {
            endpoint.rebind()?;
        }
        self.dispatcher.enable();
        *self.state.write() = QuiesceState::Active;
        tracing::info!("resumed");
        Ok(())
    }

    /// Cancel everything in flight, which lets a blocked `suspend` finish.
    pub fn cancel_in_flight(&self) -> usize {
        self.table.cancel_all()
    }

    pub fn table(&self) -> &Arc<CorrelationTable<C>> {
        &self.table
    }
}
