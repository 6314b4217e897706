use thiserror::Error;

/// Reasons an endpoint could not be bound to a ring.
///
/// Always surfaced synchronously to the caller creating the endpoint.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindFailure {
    #[error("out of memory binding a {0}-byte ring")]
    OutOfMemory(usize),

    #[error("port {port:#x} on domain {domain:#x} is already bound")]
    AlreadyBound { domain: u16, port: u32 },

    #[error("invalid port {0:#x}")]
    InvalidPort(u32),

    #[error("invalid ring length {len}: must be a power of two in [{min}, {max}]")]
    InvalidRingLength { len: usize, min: usize, max: usize },

    #[error("no ring bound at {domain:#x}:{port:#x}")]
    NoSuchBinding { domain: u16, port: u32 },

    #[error("shared memory: {0}")]
    Memory(String),
}

impl From<std::io::Error> for BindFailure {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::OutOfMemory {
            return BindFailure::OutOfMemory(0);
        }
        BindFailure::Memory(err.to_string())
    }
}

/// Ways a frame (or the ring offsets around it) can fail validation.
///
/// Any of these means the ring can no longer be trusted for that binding.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MalformedFrame {
    #[error("ring offsets out of range: {used} bytes in use in a {capacity}-byte ring")]
    OffsetsCorrupt { used: u32, capacity: u32 },

    #[error("truncated frame header: only {available} bytes buffered")]
    TruncatedHeader { available: u32 },

    #[error("payload length {len} exceeds protocol maximum {max}")]
    PayloadTooLarge { len: u32, max: u32 },

    #[error("payload length {len} exceeds the {available} bytes buffered")]
    PayloadTruncated { len: u32, available: u32 },

    #[error("ring header magic mismatch: {found:#010x}")]
    BadMagic { found: u32 },
}

/// Transport error taxonomy.
///
/// `Overflow`, `ExhaustedIds` and `Quiescing` are recoverable "busy, retry" conditions
/// (see [`TransportError::is_busy`]); everything else is either a hard failure or a
/// per-binding protocol violation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("ring full")]
    Overflow,

    #[error("request id space exhausted")]
    ExhaustedIds,

    #[error("endpoint is quiescing; new requests are not accepted")]
    Quiescing,

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    #[error("no pending request for sequence {0:#x}")]
    UnmatchedReply(u64),

    #[error("bind failed: {0}")]
    Bind(#[from] BindFailure),

    #[error("request cancelled")]
    Cancelled,

    #[error("payload of {len} bytes exceeds maximum of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("endpoint has no ring bound")]
    NotBound,

    #[error("endpoint faulted; a fresh bind is required")]
    Faulted,

    #[error("cannot consume {len} bytes, only {available} buffered")]
    InvalidConsume { len: usize, available: usize },
}

impl TransportError {
    /// True for conditions an upper layer should treat as "device temporarily busy,
    /// requeue me" rather than as a failed operation.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            TransportError::Overflow | TransportError::ExhaustedIds | TransportError::Quiescing
        )
    }
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_class() {
        assert!(TransportError::Overflow.is_busy());
        assert!(TransportError::ExhaustedIds.is_busy());
        assert!(TransportError::Quiescing.is_busy());
        assert!(!TransportError::Cancelled.is_busy());
        assert!(!TransportError::TooLarge { len: 10, max: 5 }.is_busy());
        assert!(!TransportError::from(MalformedFrame::TruncatedHeader { available: 3 }).is_busy());
    }

    #[test]
    fn io_errors_become_bind_failures() {
        let oom = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "nope");
        assert_eq!(BindFailure::from(oom), BindFailure::OutOfMemory(0));

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(matches!(BindFailure::from(other), BindFailure::Memory(msg) if msg.contains("missing")));
    }
}
