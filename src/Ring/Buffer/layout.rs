// Byte layout of a ring region as both peers see it.
//
// [ header (RING_HEADER_LEN bytes) ][ data (capacity bytes) ]
//
// Header words are little-endian u32 at fixed offsets. The region is never cast to a
// native struct; `RingView` validates the region once and then reads these words
// through offset-checked accessors.

/// "V4VR"
pub const RING_MAGIC: u32 = 0x5634_5652;

/// Free-running producer offset (bytes ever written, mod 2^32).
pub const OFF_PRODUCER: usize = 0;
/// Free-running consumer offset (bytes ever consumed, mod 2^32).
pub const OFF_CONSUMER: usize = 4;
/// Data capacity in bytes (power of two).
pub const OFF_CAPACITY: usize = 8;
/// Flag bits, see `FLAG_*`.
pub const OFF_FLAGS: usize = 12;
/// Doorbell rung by the producer when data was written.
pub const OFF_DATA_SIGNAL: usize = 16;
/// Doorbell rung by the consumer when space was freed for a stalled producer.
pub const OFF_SPACE_SIGNAL: usize = 20;
pub const OFF_MAGIC: usize = 24;
/// Largest payload the binder accepts; attachers adopt it.
pub const OFF_MAX_PAYLOAD: usize = 28;

/// Header size; data starts here. One cache line.
pub const RING_HEADER_LEN: usize = 64;

/// The producer hit `Overflow` and wants a space doorbell once the consumer frees bytes.
pub const FLAG_STALLED: u32 = 1 << 0;

pub const MIN_RING_LEN: usize = 256;
pub const MAX_RING_LEN: usize = 16 * 1024 * 1024;

/// Bytes of backing memory needed for a ring of `capacity` data bytes.
pub const fn region_len(capacity: usize) -> usize {
    RING_HEADER_LEN + capacity
}

/// True if `capacity` is an acceptable ring length.
pub const fn valid_capacity(capacity: usize) -> bool {
    capacity.is_power_of_two() && capacity >= MIN_RING_LEN && capacity <= MAX_RING_LEN
}
