use super::*;

/// Read-only accessors used for monitoring and by the debug formatters.
impl Registry {
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Number of rings currently bound.
    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_bound(&self, addr: Addr) -> bool {
        self.bindings.lock().contains_key(&addr)
    }

    /// Successful binds over the registry's lifetime.
    ///
    /// Loaded with relaxed ordering; this is a monitoring counter only.
    pub fn binds_total(&self) -> u64 {
        self.binds_total.load(Ordering::Relaxed)
    }
}
