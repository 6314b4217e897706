// Wire structures carried in ring frames.

// no atomics here; plain integral types, little-endian on the wire, no padding

/// Size of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_LEN: usize = 16;

/// Size of [`XferHeader`] on the wire.
pub const XFER_HEADER_LEN: usize = 24;

/// Size of [`DirtyRectMsg`] on the wire.
pub const DIRTY_RECT_MSG_LEN: usize = 24;

/// Sense buffer size a storage initiator offers per command.
pub const SENSE_BUFFER_LEN: usize = 96;

/// Frame kinds used by the built-in protocols.
pub const KIND_STORAGE_REQUEST: u32 = 0x0001;
pub const KIND_STORAGE_REPLY: u32 = 0x0002;
pub const KIND_DIRTY_RECT: u32 = 0x0010;
pub const KIND_NET_PACKET: u32 = 0x0020;
pub const KIND_DIAGNOSTICS: u32 = 0x0030;

/// Header that precedes every payload in a ring.
///
/// Layout: `sequence:u64 | kind:u32 | payload_len:u32`, payload follows immediately.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub sequence: u64,
    pub kind: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        out[0..8].copy_from_slice(&self.sequence.to_le_bytes());
        out[8..12].copy_from_slice(&self.kind.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            sequence: u64::from_le_bytes(le_array(&raw[0..8])),
            kind: u32::from_le_bytes(le_array(&raw[8..12])),
            payload_len: u32::from_le_bytes(le_array(&raw[12..16])),
        }
    }

    /// Bytes this frame occupies in the ring.
    pub fn framed_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload_len as usize
    }
}

/// One decoded frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub sequence: u64,
    pub kind: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(sequence: u64, kind: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            sequence,
            kind,
            payload: payload.into(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn framed_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }
}

/// Command-transport header at the start of every storage request and reply payload.
///
/// Request payload: header, `cdb_size` bytes of CDB, `write_size` bytes of data.
/// Reply payload: header, then `sense_size` bytes of sense data or `read_size` bytes of data.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct XferHeader {
    pub cdb_size: u32,
    pub write_size: u32,
    pub pagelist_size: u32,
    pub read_size: u32,
    pub sense_size: u32,
    pub status: u32,
}

impl XferHeader {
    pub fn encode(&self) -> [u8; XFER_HEADER_LEN] {
        let mut out = [0u8; XFER_HEADER_LEN];
        let fields = [
            self.cdb_size,
            self.write_size,
            self.pagelist_size,
            self.read_size,
            self.sense_size,
            self.status,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn decode(raw: &[u8; XFER_HEADER_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes(le_array(&raw[i * 4..i * 4 + 4]));
        Self {
            cdb_size: word(0),
            write_size: word(1),
            pagelist_size: word(2),
            read_size: word(3),
            sense_size: word(4),
            status: word(5),
        }
    }
}

/// Damage notification for one display head. Fire-and-forget.
///
/// `right`/`bottom` are exclusive.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyRectMsg {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub rect_id: u32,
    pub head_id: u32,
}

impl DirtyRectMsg {
    pub fn encode(&self) -> [u8; DIRTY_RECT_MSG_LEN] {
        let mut out = [0u8; DIRTY_RECT_MSG_LEN];
        let fields = [
            self.left,
            self.top,
            self.right,
            self.bottom,
            self.rect_id,
            self.head_id,
        ];
        for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        out
    }

    pub fn decode(raw: &[u8; DIRTY_RECT_MSG_LEN]) -> Self {
        let word = |i: usize| u32::from_le_bytes(le_array(&raw[i * 4..i * 4 + 4]));
        Self {
            left: word(0),
            top: word(1),
            right: word(2),
            bottom: word(3),
            rect_id: word(4),
            head_id: word(5),
        }
    }
}

#[inline]
fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
