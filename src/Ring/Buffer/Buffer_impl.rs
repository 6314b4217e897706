use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};

use super::layout::{
    region_len, valid_capacity, FLAG_STALLED, MAX_RING_LEN, MIN_RING_LEN, OFF_CAPACITY,
    OFF_CONSUMER, OFF_DATA_SIGNAL, OFF_FLAGS, OFF_MAGIC, OFF_MAX_PAYLOAD, OFF_PRODUCER,
    OFF_SPACE_SIGNAL, RING_HEADER_LEN, RING_MAGIC,
};
use super::Buffer::RingView;
use crate::Core::error::{BindFailure, MalformedFrame, Result, TransportError};
use crate::Core::SharedMemory::SharedMemoryBackend;
use crate::Ring::Structs::Buffer_Structs::{FrameHeader, Message, FRAME_HEADER_LEN};

#[cfg(target_endian = "big")]
compile_error!("ring header words are little-endian; big-endian hosts are not supported");

impl RingView {
    /// Initialise a fresh ring over `memory` and take ownership of it.
    ///
    /// This is the "bind" side: it owns the ring lifecycle and writes the header.
    /// `max_payload` is clamped so one frame always fits an empty ring.
    pub fn bind(
        memory: Box<dyn SharedMemoryBackend>,
        capacity: usize,
        max_payload: usize,
    ) -> std::result::Result<Self, BindFailure> {
        if !valid_capacity(capacity) {
            return Err(BindFailure::InvalidRingLength {
                len: capacity,
                min: MIN_RING_LEN,
                max: MAX_RING_LEN,
            });
        }
        if memory.size() < region_len(capacity) {
            return Err(BindFailure::OutOfMemory(region_len(capacity)));
        }
        let view = Self::from_parts(memory, capacity as u32, max_payload)?;

        view.word(OFF_PRODUCER).store(0, Relaxed);
        view.word(OFF_CONSUMER).store(0, Relaxed);
        view.word(OFF_CAPACITY).store(capacity as u32, Relaxed);
        view.word(OFF_FLAGS).store(0, Relaxed);
        view.word(OFF_DATA_SIGNAL).store(0, Relaxed);
        view.word(OFF_SPACE_SIGNAL).store(0, Relaxed);
        view.word(OFF_MAX_PAYLOAD).store(view.max_payload, Relaxed);
        // Publishing the magic makes the header visible to attachers.
        view.word(OFF_MAGIC).store(RING_MAGIC, Release);
        Ok(view)
    }

    /// Map a ring a peer has already bound.
    ///
    /// The header is validated once here; afterwards every access is offset-checked
    /// against the capacity read now. The binder's payload ceiling is adopted.
    pub fn attach(memory: Box<dyn SharedMemoryBackend>) -> Result<Self> {
        if memory.size() < RING_HEADER_LEN || memory.as_ptr() as usize % 4 != 0 {
            return Err(BindFailure::OutOfMemory(RING_HEADER_LEN).into());
        }
        // SAFETY: size and alignment checked just above.
        let magic = unsafe { header_word(memory.as_ptr(), OFF_MAGIC) }.load(Acquire);
        if magic != RING_MAGIC {
            return Err(MalformedFrame::BadMagic { found: magic }.into());
        }
        let capacity = unsafe { header_word(memory.as_ptr(), OFF_CAPACITY) }.load(Relaxed) as usize;
        if !valid_capacity(capacity) {
            return Err(BindFailure::InvalidRingLength {
                len: capacity,
                min: MIN_RING_LEN,
                max: MAX_RING_LEN,
            }
            .into());
        }
        if memory.size() < region_len(capacity) {
            return Err(BindFailure::OutOfMemory(region_len(capacity)).into());
        }
        let max_payload =
            unsafe { header_word(memory.as_ptr(), OFF_MAX_PAYLOAD) }.load(Relaxed) as usize;
        Ok(Self::from_parts(memory, capacity as u32, max_payload)?)
    }

    fn from_parts(
        memory: Box<dyn SharedMemoryBackend>,
        capacity: u32,
        max_payload: usize,
    ) -> std::result::Result<Self, BindFailure> {
        let base = std::ptr::NonNull::new(memory.as_ptr())
            .ok_or_else(|| BindFailure::Memory("ring region has a null base".into()))?;
        if base.as_ptr() as usize % 4 != 0 {
            return Err(BindFailure::Memory("ring region is not 4-byte aligned".into()));
        }
        let max_payload = max_payload.min(capacity as usize - FRAME_HEADER_LEN) as u32;
        Ok(Self {
            memory,
            base,
            capacity,
            mask: capacity - 1,
            max_payload,
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    #[inline]
    fn word(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= RING_HEADER_LEN);
        // SAFETY: the region was checked to hold the whole header at bind/attach time
        // and `offset` is one of the fixed header offsets.
        unsafe { header_word(self.base.as_ptr(), offset) }
    }

    #[inline]
    fn data(&self) -> *mut u8 {
        // SAFETY: region_len(capacity) bytes are mapped.
        unsafe { self.base.as_ptr().add(RING_HEADER_LEN) }
    }

    /// Copy `src` into the data area starting at free-running offset `pos`, wrapping.
    ///
    /// # Safety
    /// `src.len() <= capacity` and the target bytes must be free space owned by the producer.
    unsafe fn copy_in(&self, pos: u32, src: &[u8]) {
        let idx = (pos & self.mask) as usize;
        let first = src.len().min(self.capacity as usize - idx);
        ptr::copy_nonoverlapping(src.as_ptr(), self.data().add(idx), first);
        if first < src.len() {
            ptr::copy_nonoverlapping(src.as_ptr().add(first), self.data(), src.len() - first);
        }
    }

    /// Copy bytes starting at free-running offset `pos` into `dst`, wrapping.
    ///
    /// # Safety
    /// `dst.len() <= capacity` and the source bytes must be published, unconsumed data.
    unsafe fn copy_from(&self, pos: u32, dst: &mut [u8]) {
        let idx = (pos & self.mask) as usize;
        let first = dst.len().min(self.capacity as usize - idx);
        ptr::copy_nonoverlapping(self.data().add(idx), dst.as_mut_ptr(), first);
        if first < dst.len() {
            ptr::copy_nonoverlapping(self.data(), dst.as_mut_ptr().add(first), dst.len() - first);
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload as usize
    }

    /// Bytes currently buffered (raw wrapping difference; may exceed capacity if the
    /// peer corrupted the offsets).
    pub fn used(&self) -> u32 {
        let producer = self.word(OFF_PRODUCER).load(Acquire);
        let consumer = self.word(OFF_CONSUMER).load(Acquire);
        producer.wrapping_sub(consumer)
    }

    pub fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.used()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn producer_offset(&self) -> u32 {
        self.word(OFF_PRODUCER).load(Acquire)
    }

    pub fn consumer_offset(&self) -> u32 {
        self.word(OFF_CONSUMER).load(Acquire)
    }

    /// Append one frame. All-or-nothing.
    pub fn write(&self, msg: &Message) -> Result<usize> {
        self.write_vectored(msg.sequence, msg.kind, &[&msg.payload])
    }

    /// Append one frame whose payload is the concatenation of `segments`.
    ///
    /// Returns the framed size on success. Fails with `Overflow` (ring state untouched)
    /// if the frame does not fit in the free space right now, and with `TooLarge` if it
    /// could never fit.
    pub fn write_vectored(&self, sequence: u64, kind: u32, segments: &[&[u8]]) -> Result<usize> {
        let payload_len: usize = segments.iter().map(|s| s.len()).sum();
        if payload_len > self.max_payload as usize {
            return Err(TransportError::TooLarge {
                len: payload_len,
                max: self.max_payload as usize,
            });
        }
        let framed = FRAME_HEADER_LEN + payload_len;

        let _guard = self.write_lock.lock();

        let producer = self.word(OFF_PRODUCER).load(Relaxed);
        let consumer = self.word(OFF_CONSUMER).load(Acquire);
        let used = producer.wrapping_sub(consumer);
        if used > self.capacity {
            return Err(MalformedFrame::OffsetsCorrupt {
                used,
                capacity: self.capacity,
            }
            .into());
        }
        if ((self.capacity - used) as usize) < framed {
            return Err(TransportError::Overflow);
        }

        let header = FrameHeader {
            sequence,
            kind,
            payload_len: payload_len as u32,
        };
        // SAFETY: `framed <= capacity - used`, so every byte written is free space.
        unsafe {
            self.copy_in(producer, &header.encode());
            let mut pos = producer.wrapping_add(FRAME_HEADER_LEN as u32);
            for segment in segments {
                self.copy_in(pos, segment);
                pos = pos.wrapping_add(segment.len() as u32);
            }
        }

        // Publish
        self.word(OFF_PRODUCER)
            .store(producer.wrapping_add(framed as u32), Release);
        Ok(framed)
    }

    /// Consumer offset and validated fill level.
    fn fill(&self) -> Result<(u32, u32)> {
        let consumer = self.word(OFF_CONSUMER).load(Relaxed);
        let producer = self.word(OFF_PRODUCER).load(Acquire);
        let used = producer.wrapping_sub(consumer);
        if used > self.capacity {
            return Err(MalformedFrame::OffsetsCorrupt {
                used,
                capacity: self.capacity,
            }
            .into());
        }
        Ok((consumer, used))
    }

    /// The frame at the read position, validated against what is buffered.
    fn head_frame(&self) -> Result<Option<(u32, FrameHeader)>> {
        let (consumer, used) = self.fill()?;
        if used == 0 {
            return Ok(None);
        }
        if (used as usize) < FRAME_HEADER_LEN {
            return Err(MalformedFrame::TruncatedHeader { available: used }.into());
        }

        let mut raw = [0u8; FRAME_HEADER_LEN];
        // SAFETY: FRAME_HEADER_LEN <= used bytes are published.
        unsafe { self.copy_from(consumer, &mut raw) };
        let header = FrameHeader::decode(&raw);

        if header.payload_len > self.max_payload {
            return Err(MalformedFrame::PayloadTooLarge {
                len: header.payload_len,
                max: self.max_payload,
            }
            .into());
        }
        if header.framed_len() > used as usize {
            return Err(MalformedFrame::PayloadTruncated {
                len: header.payload_len,
                available: used - FRAME_HEADER_LEN as u32,
            }
            .into());
        }
        Ok(Some((consumer, header)))
    }

    /// Header of the next frame without consuming it.
    pub fn peek_header(&self) -> Result<Option<FrameHeader>> {
        Ok(self.head_frame()?.map(|(_, header)| header))
    }

    /// Decode the next frame without consuming it.
    ///
    /// Call [`RingView::consume`] (or [`RingView::consume_frame`]) once done with it.
    pub fn read_next(&self) -> Result<Option<Message>> {
        let Some((consumer, header)) = self.head_frame()? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; header.payload_len as usize];
        // SAFETY: the whole frame was validated as published.
        unsafe { self.copy_from(consumer.wrapping_add(FRAME_HEADER_LEN as u32), &mut payload) };
        Ok(Some(Message {
            sequence: header.sequence,
            kind: header.kind,
            payload,
        }))
    }

    /// Copy payload bytes `[0, end_offset)` of the next frame into `dst`.
    ///
    /// See [`RingView::copy_out_offset`].
    pub fn copy_out(&self, dst: &mut [u8], end_offset: usize, consume: bool) -> Result<Option<usize>> {
        self.copy_out_offset(dst, 0, end_offset, consume)
    }

    /// Copy payload bytes `[start, end_offset)` of the next frame into `dst`.
    ///
    /// `end_offset` is a position within the frame's payload, not a byte count, so a
    /// large frame can be scattered into several destinations by successive calls with
    /// increasing `start`. The range is clipped to the payload and to `dst`. When
    /// `consume` is set the whole frame is dropped afterwards.
    ///
    /// Returns the frame's payload length, or `None` if the ring is empty.
    pub fn copy_out_offset(
        &self,
        dst: &mut [u8],
        start: usize,
        end_offset: usize,
        consume: bool,
    ) -> Result<Option<usize>> {
        let Some((consumer, header)) = self.head_frame()? else {
            return Ok(None);
        };
        let len = header.payload_len as usize;
        let end = end_offset.min(len);
        if start < end {
            let n = (end - start).min(dst.len());
            let from = consumer.wrapping_add((FRAME_HEADER_LEN + start) as u32);
            // SAFETY: [start, start + n) lies within the validated payload.
            unsafe { self.copy_from(from, &mut dst[..n]) };
        }
        if consume {
            self.word(OFF_CONSUMER)
                .store(consumer.wrapping_add(header.framed_len() as u32), Release);
        }
        Ok(Some(len))
    }

    /// Release `len` bytes at the read position back to the producer.
    pub fn consume(&self, len: usize) -> Result<()> {
        let (consumer, used) = self.fill()?;
        if len > used as usize {
            return Err(TransportError::InvalidConsume {
                len,
                available: used as usize,
            });
        }
        self.word(OFF_CONSUMER)
            .store(consumer.wrapping_add(len as u32), Release);
        Ok(())
    }

    /// Drop the next frame. Returns its framed size, or `None` if the ring is empty.
    pub fn consume_frame(&self) -> Result<Option<usize>> {
        let Some((consumer, header)) = self.head_frame()? else {
            return Ok(None);
        };
        let framed = header.framed_len();
        self.word(OFF_CONSUMER)
            .store(consumer.wrapping_add(framed as u32), Release);
        Ok(Some(framed))
    }

    /// Producer side: ask for a space doorbell once the consumer frees bytes.
    pub fn mark_stalled(&self) {
        self.word(OFF_FLAGS).fetch_or(FLAG_STALLED, AcqRel);
    }

    /// Consumer side: clear the stall bit, returning whether it was set.
    pub fn take_stalled(&self) -> bool {
        self.word(OFF_FLAGS).fetch_and(!FLAG_STALLED, AcqRel) & FLAG_STALLED != 0
    }

    pub fn is_stalled(&self) -> bool {
        self.word(OFF_FLAGS).load(Acquire) & FLAG_STALLED != 0
    }

    /// Doorbell word the producer bumps after writing.
    pub fn data_signal(&self) -> &AtomicU32 {
        self.word(OFF_DATA_SIGNAL)
    }

    /// Doorbell word the consumer bumps after freeing space for a stalled producer.
    pub fn space_signal(&self) -> &AtomicU32 {
        self.word(OFF_SPACE_SIGNAL)
    }

    /// The backing region.
    pub fn memory(&self) -> &dyn SharedMemoryBackend {
        &*self.memory
    }
}

/// # Safety
/// `base + offset .. base + offset + 4` must be mapped and 4-byte aligned.
#[inline]
unsafe fn header_word<'a>(base: *mut u8, offset: usize) -> &'a AtomicU32 {
    &*(base.add(offset) as *const AtomicU32)
}
