// This is the shared byte ring a pair of endpoints communicates over

use crate::Core::SharedMemory::SharedMemoryBackend;
use parking_lot::Mutex;
use std::ptr::NonNull;

/// A bounded, single-direction byte ring living in memory shared with a peer.
///
/// This struct is NOT stored in shared memory. It is a view that owns the backing
/// region (dropping it tears the mapping down) and exposes offset-checked access to
/// the header words and data bytes described in [`super::layout`].
///
/// ### Concurrency Design:
/// - **Producer**: writers are serialised by `write_lock`, held only for the copy and
///   the producer-offset publish. A frame's bytes are fully copied before the
///   producer offset is released, so a reader never sees a torn frame.
/// - **Consumer**: exactly one drain context (the endpoint's dispatcher) reads and
///   advances the consumer offset; it is not safe to race `consume`.
/// - Offsets are free-running `u32`s; `producer - consumer` (wrapping) is the fill
///   level and must never exceed `capacity`.
pub struct RingView {
    /// Backing region, kept alive for as long as the view exists.
    pub(crate) memory: Box<dyn SharedMemoryBackend>,

    /// Start of the region (header first).
    pub(crate) base: NonNull<u8>,

    /// Data capacity in bytes (power of two).
    pub(crate) capacity: u32,

    /// `capacity - 1`, wraps free-running offsets to data indices.
    pub(crate) mask: u32,

    /// Largest payload a frame on this ring may carry.
    pub(crate) max_payload: u32,

    /// Serialises producers that share this view.
    pub(crate) write_lock: Mutex<()>,
}

// The view only hands out atomics and byte copies over memory it owns.
unsafe impl Send for RingView {}
unsafe impl Sync for RingView {}
