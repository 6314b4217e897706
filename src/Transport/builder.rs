use super::endpoint::Endpoint;
use crate::Core::error::Result;
use crate::Core::ports::{Addr, DomainId, PortClass};
use crate::Core::registry::Registry;
use crate::Ring::Structs::Buffer_Structs::FRAME_HEADER_LEN;
use std::sync::Arc;
use std::time::Duration;

/// Default ring length (data bytes).
pub const DEFAULT_RING_LEN: usize = 256 * 1024;

/// Which way frames flow through an endpoint's ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Frames are written into the ring owned by `remote`.
    Send,
    /// Frames from `remote` arrive in a ring this endpoint binds at `local`.
    Receive,
}

/// Logical endpoint configuration. This is what a snapshot persists; the ring
/// itself is always bound fresh.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub local: Addr,
    pub remote: Addr,
    pub direction: Direction,
    pub ring_len: usize,
    pub max_payload: usize,
}

impl EndpointConfig {
    /// Address of the ring this endpoint uses: its own for `Receive`, the peer's for `Send`.
    pub fn ring_owner(&self) -> Addr {
        match self.direction {
            Direction::Send => self.remote,
            Direction::Receive => self.local,
        }
    }

    /// Largest payload a frame may carry, once clamped so a frame fits an empty ring.
    pub fn effective_max_payload(&self) -> usize {
        self.max_payload
            .min(self.ring_len.saturating_sub(FRAME_HEADER_LEN))
    }
}

#[derive(Clone)]
pub struct EndpointBuilder {
    local: Addr,
    remote: Addr,
    direction: Direction,
    ring_len: usize,
    max_payload: Option<usize>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self {
            local: Addr::new(0, 0),
            remote: Addr::new(0, 0),
            direction: Direction::Receive,
            ring_len: DEFAULT_RING_LEN, // 256KB default
            max_payload: None,          // ring_len / 4
        }
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local(mut self, local: Addr) -> Self {
        self.local = local;
        self
    }

    pub fn with_remote(mut self, remote: Addr) -> Self {
        self.remote = remote;
        self
    }

    /// Local and remote on the `index`-th port of `class`, the usual device-channel shape.
    pub fn with_class_port(
        mut self,
        class: PortClass,
        index: u32,
        local_domain: DomainId,
        remote_domain: DomainId,
    ) -> Result<Self> {
        let port = class.port(index)?;
        self.local = Addr::new(local_domain, port);
        self.remote = Addr::new(remote_domain, port);
        Ok(self)
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_ring_len(mut self, ring_len: usize) -> Self {
        self.ring_len = ring_len;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = Some(max_payload);
        self
    }

    pub fn config(&self) -> EndpointConfig {
        EndpointConfig {
            local: self.local,
            remote: self.remote,
            direction: self.direction,
            ring_len: self.ring_len,
            max_payload: self.max_payload.unwrap_or(self.ring_len / 4),
        }
    }

    /// Bind (for `Receive`) or map (for `Send`) the endpoint's ring.
    pub fn build(self, registry: &Arc<Registry>) -> Result<Endpoint> {
        Endpoint::open(registry.clone(), self.config())
    }
}

/// Per-transport tunables shared by the dispatcher, correlation table, quiesce
/// controller and dirty-region ticker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Correlation namespace size: the most requests one endpoint can have in flight.
    pub id_space: u32,
    /// Frames drained per dispatcher invocation before it re-queues itself.
    pub drain_budget: usize,
    /// Coarse wakeup in case a doorbell was missed.
    pub notify_fallback: Duration,
    /// How often a blocked suspend reports what it is still waiting for.
    pub quiesce_log_interval: Duration,
    /// Minimum spacing between dirty-rectangle messages.
    pub dirty_period: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            id_space: 1024,
            drain_budget: 64,
            notify_fallback: Duration::from_secs(30),
            quiesce_log_interval: Duration::from_secs(5),
            dirty_period: Duration::from_millis(10),
        }
    }
}

impl TransportConfig {
    pub fn with_id_space(mut self, id_space: u32) -> Self {
        self.id_space = id_space;
        self
    }

    pub fn with_drain_budget(mut self, budget: usize) -> Self {
        self.drain_budget = budget;
        self
    }

    pub fn with_notify_fallback(mut self, fallback: Duration) -> Self {
        self.notify_fallback = fallback;
        self
    }

    pub fn with_quiesce_log_interval(mut self, interval: Duration) -> Self {
        self.quiesce_log_interval = interval;
        self
    }

    pub fn with_dirty_period(mut self, period: Duration) -> Self {
        self.dirty_period = period;
        self
    }
}
