use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use v4v_ring::Core::error::{MalformedFrame, TransportError};
use v4v_ring::Core::HeapMemory;
use v4v_ring::Ring::Buffer::layout::{region_len, OFF_CONSUMER, OFF_PRODUCER, RING_HEADER_LEN};
use v4v_ring::Ring::Buffer::RingView;
use v4v_ring::Ring::Structs::Buffer_Structs::FRAME_HEADER_LEN;
use v4v_ring::Ring::Structs::Message;

fn ring(capacity: usize, max_payload: usize) -> RingView {
    let memory = HeapMemory::new(region_len(capacity)).unwrap();
    RingView::bind(Box::new(memory), capacity, max_payload).unwrap()
}

fn pattern(seed: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (seed as usize * 31 + i) as u8).collect()
}

#[test]
fn simple_write_read() {
    let rb = ring(1024, 256);
    let msg = Message::new(7, 1, vec![1, 2, 3, 4]);

    assert_eq!(rb.write(&msg).unwrap(), FRAME_HEADER_LEN + 4);
    assert_eq!(rb.used() as usize, FRAME_HEADER_LEN + 4);

    // Peek twice: nothing consumed until asked.
    assert_eq!(rb.read_next().unwrap(), Some(msg.clone()));
    assert_eq!(rb.read_next().unwrap(), Some(msg.clone()));

    rb.consume(msg.framed_len()).unwrap();
    assert!(rb.is_empty());
    assert_eq!(rb.read_next().unwrap(), None);
}

#[test]
fn wraparound_fuzz_preserves_order() {
    let capacity = 512;
    let rb = ring(capacity, 200);
    let mut expected: VecDeque<Message> = VecDeque::new();
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    let mut next_seq = 0u64;
    let mut written_bytes = 0usize;

    for _ in 0..20_000 {
        if rng.bool() {
            let len = rng.usize(0..=200);
            let msg = Message::new(next_seq, rng.u32(..), pattern(next_seq, len));
            match rb.write(&msg) {
                Ok(framed) => {
                    written_bytes += framed;
                    next_seq += 1;
                    expected.push_back(msg);
                }
                Err(TransportError::Overflow) => {
                    assert!(rb.free_space() < msg.framed_len());
                }
                Err(e) => panic!("unexpected write error: {e}"),
            }
        } else {
            match rb.read_next().unwrap() {
                Some(got) => {
                    let want = expected.pop_front().expect("ring produced an extra frame");
                    assert_eq!(got, want);
                    assert_eq!(rb.consume_frame().unwrap(), Some(want.framed_len()));
                }
                None => assert!(expected.is_empty()),
            }
        }
        assert!(rb.used() as usize <= capacity);
    }

    while let Some(got) = rb.read_next().unwrap() {
        assert_eq!(Some(got), expected.pop_front());
        rb.consume_frame().unwrap();
    }
    assert!(expected.is_empty());
    // Many laps around the buffer.
    assert!(written_bytes > capacity * 100);
}

#[test]
fn offsets_survive_u32_wrap() {
    let rb = ring(256, 64);
    // Start both free-running offsets just short of u32::MAX.
    let start = u32::MAX - 40;
    for off in [OFF_PRODUCER, OFF_CONSUMER] {
        let word = unsafe { &*(rb.memory().as_ptr().add(off) as *const AtomicU32) };
        word.store(start, Ordering::Release);
    }
    for i in 0..3 {
        rb.write(&Message::new(i, 2, pattern(i, 48))).unwrap();
    }
    assert!(rb.producer_offset() < start, "producer offset did not wrap");
    assert_eq!(rb.used(), 3 * 64);
    for i in 0..3 {
        assert_eq!(rb.read_next().unwrap().unwrap().payload, pattern(i, 48));
        rb.consume_frame().unwrap();
    }
    assert!(rb.is_empty());
}

#[test]
fn backpressure_is_idempotent() {
    let rb = ring(256, 200);
    let big = Message::new(1, 1, vec![1; 150]);
    rb.write(&big).unwrap();

    let second = Message::new(2, 1, vec![2; 150]);
    let producer = rb.producer_offset();
    let consumer = rb.consumer_offset();
    for _ in 0..10 {
        assert_eq!(rb.write(&second), Err(TransportError::Overflow));
        assert_eq!(rb.producer_offset(), producer);
        assert_eq!(rb.consumer_offset(), consumer);
    }

    rb.consume_frame().unwrap();
    rb.write(&second).unwrap();
    assert_eq!(rb.read_next().unwrap(), Some(second));
}

#[test]
fn never_fitting_payload_is_too_large() {
    let rb = ring(4096, 8192);
    assert_eq!(rb.max_payload(), 4096 - FRAME_HEADER_LEN);
    let err = rb.write(&Message::new(1, 1, vec![0; 8192])).unwrap_err();
    assert_eq!(
        err,
        TransportError::TooLarge {
            len: 8192,
            max: 4096 - FRAME_HEADER_LEN
        }
    );
    assert!(rb.is_empty());
}

#[test]
fn scenario_overflow_then_fits_after_drain() {
    let rb = ring(4096, 4096);
    let a = Message::new(1, 1, pattern(1, 64));
    let b = Message::new(2, 1, pattern(2, 4010));

    rb.write(&a).unwrap();
    let before = (rb.producer_offset(), rb.consumer_offset());
    assert_eq!(rb.write(&b), Err(TransportError::Overflow));
    assert_eq!((rb.producer_offset(), rb.consumer_offset()), before);
    assert_eq!(rb.read_next().unwrap(), Some(a.clone()));

    rb.consume(a.framed_len()).unwrap();
    rb.write(&b).unwrap();
    // B starts 80 bytes in and runs past the end of the buffer.
    assert_eq!(rb.read_next().unwrap(), Some(b.clone()));
    rb.consume_frame().unwrap();
    assert!(rb.is_empty());
    assert_eq!(
        rb.producer_offset(),
        (a.framed_len() + b.framed_len()) as u32
    );
}

#[test]
fn copy_out_scatters_by_end_offset() {
    let rb = ring(1024, 512);
    // Offset the write position so the frame wraps.
    for _ in 0..2 {
        rb.write(&Message::new(0, 0, vec![0; 450])).unwrap();
        rb.consume_frame().unwrap();
    }

    let payload = pattern(9, 300);
    rb.write(&Message::new(5, 3, payload.clone())).unwrap();

    let mut first = [0u8; 100];
    let mut second = [0u8; 150];
    let mut third = [0u8; 100];
    assert_eq!(rb.copy_out(&mut first, 100, false).unwrap(), Some(300));
    assert_eq!(
        rb.copy_out_offset(&mut second, 100, 250, false).unwrap(),
        Some(300)
    );
    // End offset beyond the payload is clipped.
    assert_eq!(
        rb.copy_out_offset(&mut third, 250, 10_000, true).unwrap(),
        Some(300)
    );

    assert_eq!(&first[..], &payload[..100]);
    assert_eq!(&second[..], &payload[100..250]);
    assert_eq!(&third[..50], &payload[250..]);
    assert!(rb.is_empty());
    assert_eq!(rb.copy_out(&mut first, 10, true).unwrap(), None);
}

#[test]
fn consume_beyond_buffered_is_rejected() {
    let rb = ring(256, 64);
    rb.write(&Message::new(1, 1, vec![1; 8])).unwrap();
    assert_eq!(
        rb.consume(100),
        Err(TransportError::InvalidConsume {
            len: 100,
            available: 24
        })
    );
    assert_eq!(rb.used(), 24);
}

#[test]
fn attach_adopts_header() {
    let capacity = 2048;
    let memory = HeapMemory::new(region_len(capacity)).unwrap();
    let base = v4v_ring::Core::SharedMemoryBackend::as_ptr(&memory);
    let bound = RingView::bind(Box::new(memory), capacity, 300).unwrap();
    bound.write(&Message::new(3, 4, vec![9; 10])).unwrap();

    // A second view over the same bytes, as a peer would map them.
    struct Alias(*mut u8, usize);
    impl std::fmt::Debug for Alias {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("Alias")
        }
    }
    unsafe impl Send for Alias {}
    unsafe impl Sync for Alias {}
    impl v4v_ring::Core::SharedMemoryBackend for Alias {
        fn as_ptr(&self) -> *mut u8 {
            self.0
        }
        fn size(&self) -> usize {
            self.1
        }
        fn raw_handle(&self) -> v4v_ring::Core::RawHandle {
            v4v_ring::Core::RawHandle::Heap
        }
    }

    let peer = RingView::attach(Box::new(Alias(base, region_len(capacity)))).unwrap();
    assert_eq!(peer.capacity(), capacity);
    assert_eq!(peer.max_payload(), 300);
    assert_eq!(peer.read_next().unwrap(), Some(Message::new(3, 4, vec![9; 10])));
    drop(peer);
    drop(bound);
}

#[test]
fn corrupt_producer_offset_is_malformed() {
    let rb = ring(256, 64);
    rb.write(&Message::new(1, 1, vec![1; 8])).unwrap();

    // A hostile peer moves the producer offset beyond the capacity.
    let producer = unsafe { &*(rb.memory().as_ptr().add(OFF_PRODUCER) as *const AtomicU32) };
    producer.store(10_000, Ordering::Release);
    assert!(matches!(
        rb.read_next(),
        Err(TransportError::MalformedFrame(
            MalformedFrame::OffsetsCorrupt { .. }
        ))
    ));
    assert!(matches!(
        rb.write(&Message::new(2, 1, vec![])),
        Err(TransportError::MalformedFrame(_))
    ));
}

#[test]
fn oversized_length_field_is_malformed() {
    let rb = ring(256, 64);
    rb.write(&Message::new(1, 1, vec![1; 8])).unwrap();
    // Rewrite payload_len in the frame header to something past max_payload.
    unsafe {
        let len_field = rb.memory().as_ptr().add(RING_HEADER_LEN + 12);
        std::ptr::copy_nonoverlapping(200u32.to_le_bytes().as_ptr(), len_field, 4);
    }
    assert_eq!(
        rb.peek_header().unwrap_err(),
        TransportError::MalformedFrame(MalformedFrame::PayloadTooLarge { len: 200, max: 64 })
    );
}

#[test]
fn concurrent_producers_never_tear_frames() {
    let rb = Arc::new(ring(4096, 256));
    let producers = 4;
    let per_producer = 2_000u64;

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let rb = rb.clone();
            thread::spawn(move || {
                for i in 0..per_producer {
                    let seq = (p as u64) << 32 | i;
                    let msg = Message::new(seq, p, pattern(seq, (i % 97) as usize));
                    while let Err(e) = rb.write(&msg) {
                        assert_eq!(e, TransportError::Overflow);
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let mut next = vec![0u64; producers as usize];
    let mut received = 0;
    while received < producers as u64 * per_producer {
        match rb.read_next().unwrap() {
            Some(msg) => {
                let p = msg.kind as usize;
                let i = msg.sequence & 0xffff_ffff;
                assert_eq!(i, next[p], "per-producer order broken");
                assert_eq!(msg.payload, pattern(msg.sequence, (i % 97) as usize));
                next[p] += 1;
                received += 1;
                rb.consume_frame().unwrap();
            }
            None => thread::yield_now(),
        }
    }
    for h in handles {
        h.join().unwrap();
    }
}
