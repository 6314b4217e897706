use crate::Core::error::{BindFailure, Result};
use crate::Core::ports::{Addr, PortClass};
use crate::Core::SharedMemory::{
    attach_shared_memory, create_shared_memory, unlink_shared_memory, HeapMemory,
    SharedMemoryBackend,
};
use crate::Ring::Buffer::layout::{
    region_len, valid_capacity, MAX_RING_LEN, MIN_RING_LEN, RING_HEADER_LEN,
};
use crate::Ring::Buffer::RingView;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
mod debug;
mod getters;

// Use parking_lot's Mutex for better performance
use parking_lot::Mutex;

/// Where ring memory comes from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    /// Process-private heap regions; peers must live in this process.
    Heap,
    /// Named /dev/shm regions; a peer process attaches by address.
    Shared,
}

/// Host-wide table of bound rings, keyed by the owning endpoint's address.
///
/// Constructed once at driver init and passed by reference to everything that binds
/// or looks up rings; dropping it releases every ring it still owns.
pub struct Registry {
    backing: Backing,
    bindings: Mutex<HashMap<Addr, Arc<RingView>>>,
    port_cursor: Mutex<HashMap<PortClass, u32>>,
    binds_total: AtomicU64,
}

/// /dev/shm name for the ring owned by `addr`.
pub fn ring_name(addr: Addr) -> String {
    format!("v4v-{:04x}-{:08x}", addr.domain, addr.port)
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry over in-process heap rings.
    pub fn new() -> Self {
        Self::with_backing(Backing::Heap)
    }

    pub fn with_backing(backing: Backing) -> Self {
        Self {
            backing,
            bindings: Mutex::new(HashMap::new()),
            port_cursor: Mutex::new(HashMap::new()),
            binds_total: AtomicU64::new(0),
        }
    }

    fn allocate(&self, owner: Addr, size: usize) -> std::io::Result<Box<dyn SharedMemoryBackend>> {
        match self.backing {
            Backing::Heap => Ok(Box::new(HeapMemory::new(size)?)),
            Backing::Shared => create_shared_memory(size, &ring_name(owner)),
        }
    }

    /// Bind a fresh ring owned by `owner`.
    ///
    /// Fails with `AlreadyBound` if `owner` already has a ring, `InvalidPort` for port 0,
    /// `InvalidRingLength` for a bad size and `OutOfMemory`/`Memory` if the region
    /// cannot be allocated.
    pub fn bind(
        &self,
        owner: Addr,
        ring_len: usize,
        max_payload: usize,
    ) -> std::result::Result<Arc<RingView>, BindFailure> {
        if owner.port == 0 {
            return Err(BindFailure::InvalidPort(owner.port));
        }
        if !valid_capacity(ring_len) {
            return Err(BindFailure::InvalidRingLength {
                len: ring_len,
                min: MIN_RING_LEN,
                max: MAX_RING_LEN,
            });
        }

        // Hold the table lock across allocation so two binders cannot race for one address.
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&owner) {
            return Err(BindFailure::AlreadyBound {
                domain: owner.domain,
                port: owner.port,
            });
        }

        let memory = self.allocate(owner, region_len(ring_len)).map_err(|e| {
            tracing::warn!(%owner, ring_len, error = %e, "ring allocation failed");
            BindFailure::from(e)
        })?;
        let ring = Arc::new(RingView::bind(memory, ring_len, max_payload)?);
        bindings.insert(owner, ring.clone());
        self.binds_total.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(%owner, ring_len, max_payload = ring.max_payload(), "ring bound");
        Ok(ring)
    }

    /// Map the ring owned by `addr` for sending.
    ///
    /// Rings bound through this registry are shared directly; with `Backing::Shared` a
    /// ring bound by another process is attached by name.
    pub fn lookup(&self, addr: Addr) -> Result<Arc<RingView>> {
        if let Some(ring) = self.bindings.lock().get(&addr) {
            return Ok(ring.clone());
        }
        if self.backing == Backing::Shared {
            if let Ok(memory) = attach_shared_memory(&ring_name(addr), RING_HEADER_LEN) {
                let ring = RingView::attach(memory)?;
                tracing::debug!(%addr, capacity = ring.capacity(), "attached foreign ring");
                return Ok(Arc::new(ring));
            }
        }
        Err(BindFailure::NoSuchBinding {
            domain: addr.domain,
            port: addr.port,
        }
        .into())
    }

    /// Release the ring owned by `addr`. Views already handed out stay mapped until dropped.
    pub fn unbind(&self, addr: Addr) -> bool {
        let removed = self.bindings.lock().remove(&addr).is_some();
        if removed {
            if self.backing == Backing::Shared {
                if let Err(e) = unlink_shared_memory(&ring_name(addr)) {
                    tracing::debug!(%addr, error = %e, "ring unlink failed");
                }
            }
            tracing::debug!(%addr, "ring unbound");
        }
        removed
    }

    /// Addresses of every ring bound here, in address order (device scan).
    pub fn bindings(&self) -> Vec<Addr> {
        let mut addrs: Vec<Addr> = self.bindings.lock().keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Next free port of `class` on `domain`, cycling through the class range.
    pub fn allocate_port(
        &self,
        class: PortClass,
        domain: u16,
    ) -> std::result::Result<u32, BindFailure> {
        let bindings = self.bindings.lock();
        let mut cursors = self.port_cursor.lock();
        let cursor = cursors.entry(class).or_insert(0);
        for step in 0..class.span() {
            let index = (*cursor + step) % class.span();
            let port = class.port(index)?;
            if !bindings.contains_key(&Addr::new(domain, port)) {
                *cursor = (index + 1) % class.span();
                return Ok(port);
            }
        }
        Err(BindFailure::InvalidPort(class.base()))
    }

    /// Release every ring. Returns how many were bound.
    pub fn shutdown(&self) -> usize {
        let addrs = self.bindings();
        for addr in &addrs {
            self.unbind(*addr);
        }
        addrs.len()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
