// One communication flow: a (local, remote) pair and the ring frames travel through.

use super::builder::{Direction, EndpointConfig};
use crate::Core::error::{BindFailure, Result, TransportError};
use crate::Core::ports::Addr;
use crate::Core::registry::Registry;
use crate::Ring::Buffer::RingView;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A bound endpoint.
///
/// A `Receive` endpoint owns its ring: opening it binds a ring at `local`, dropping or
/// releasing it unbinds. A `Send` endpoint maps the ring its peer bound at `remote`.
///
/// The ring slot is empty after [`Endpoint::release`] (quiesce) or [`Endpoint::fault`]
/// (malformed frame). Either way the endpoint stays usable for [`Endpoint::rebind`],
/// which always establishes a fresh ring.
pub struct Endpoint {
    registry: Arc<Registry>,
    config: EndpointConfig,
    ring: RwLock<Option<Arc<RingView>>>,
    faulted: AtomicBool,
}

impl Endpoint {
    pub fn open(registry: Arc<Registry>, config: EndpointConfig) -> Result<Self> {
        let ring = Self::establish(&registry, &config)?;
        tracing::debug!(
            local = %config.local,
            remote = %config.remote,
            direction = ?config.direction,
            "endpoint open"
        );
        Ok(Self {
            registry,
            config,
            ring: RwLock::new(Some(ring)),
            faulted: AtomicBool::new(false),
        })
    }

    fn establish(registry: &Registry, config: &EndpointConfig) -> Result<Arc<RingView>> {
        if config.local.port == 0 || config.remote.port == 0 {
            return Err(BindFailure::InvalidPort(0).into());
        }
        match config.direction {
            Direction::Receive => {
                Ok(registry.bind(config.local, config.ring_len, config.max_payload)?)
            }
            Direction::Send => registry.lookup(config.remote),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn local(&self) -> Addr {
        self.config.local
    }

    pub fn remote(&self) -> Addr {
        self.config.remote
    }

    pub fn direction(&self) -> Direction {
        self.config.direction
    }

    /// The live ring. `Faulted` after a protocol violation, `NotBound` after a release.
    pub fn ring(&self) -> Result<Arc<RingView>> {
        if self.faulted.load(Ordering::Acquire) {
            return Err(TransportError::Faulted);
        }
        self.ring.read().clone().ok_or(TransportError::NotBound)
    }

    pub fn is_bound(&self) -> bool {
        self.ring.read().is_some()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// Drop the ring. Views already held by a sender or dispatcher stay valid until
    /// they are dropped. Returns whether a ring was bound.
    pub fn release(&self) -> bool {
        let Some(_ring) = self.ring.write().take() else {
            return false;
        };
        if self.config.direction == Direction::Receive {
            self.registry.unbind(self.config.local);
        }
        tracing::debug!(local = %self.config.local, "endpoint released");
        true
    }

    /// Establish a fresh ring, discarding whatever the previous one held.
    pub fn rebind(&self) -> Result<()> {
        let mut slot = self.ring.write();
        if slot.take().is_some() && self.config.direction == Direction::Receive {
            self.registry.unbind(self.config.local);
        }
        let ring = Self::establish(&self.registry, &self.config)?;
        *slot = Some(ring);
        self.faulted.store(false, Ordering::Release);
        tracing::debug!(local = %self.config.local, "endpoint rebound");
        Ok(())
    }

    /// Treat the binding as untrustworthy: log, drop the ring and refuse further use
    /// until [`Endpoint::rebind`].
    pub fn fault(&self, err: &TransportError) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::error!(
            local = %self.config.local,
            remote = %self.config.remote,
            error = %err,
            "ring protocol violation; binding torn down"
        );
        self.release();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_endpoint(self, f)
    }
}
