use crate::Core::registry::Registry;
use crate::Ring::Buffer::RingView;
use crate::Transport::Endpoint;
use std::fmt;

/// Debug function for Registry
///
/// Shows the backing kind, bound addresses and the lifetime bind counter.
/// Ring contents are not touched.
pub fn debug_registry(registry: &Registry, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Registry")
        .field("backing", &registry.backing())
        .field("bindings", &registry.bindings())
        .field("binds_total", &registry.binds_total())
        .finish()
}

/// Debug function for RingView
///
/// Reads the offsets once; a peer may be moving them while this prints.
pub fn debug_ring_view(ring: &RingView, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingView")
        .field("region", &format_args!("{:p}", ring.memory().as_ptr()))
        .field("capacity", &ring.capacity())
        .field("max_payload", &ring.max_payload())
        .field("producer", &ring.producer_offset())
        .field("consumer", &ring.consumer_offset())
        .field("stalled", &ring.is_stalled())
        .finish_non_exhaustive()
}

pub fn debug_endpoint(endpoint: &Endpoint, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Endpoint")
        .field("local", &endpoint.local())
        .field("remote", &endpoint.remote())
        .field("direction", &endpoint.direction())
        .field("bound", &endpoint.is_bound())
        .field("faulted", &endpoint.is_faulted())
        .finish()
}
