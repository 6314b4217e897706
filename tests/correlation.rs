use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use v4v_ring::Core::error::TransportError;
use v4v_ring::Transport::{Callback, CorrelationTable};

#[test]
fn complete_and_cancel_race_exactly_once() {
    let table: Arc<CorrelationTable<Callback<u64>>> = Arc::new(CorrelationTable::new(64));
    let rounds = 2_000;
    let completions = Arc::new(AtomicUsize::new(0));
    let cancels_seen = Arc::new(AtomicUsize::new(0));

    for _ in 0..rounds {
        let hits = Arc::new(AtomicUsize::new(0));
        let seq = {
            let hits = hits.clone();
            let completions = completions.clone();
            let cancels_seen = cancels_seen.clone();
            table
                .allocate(Callback::new(move |result: Result<u64, TransportError>| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    match result {
                        Ok(_) => completions.fetch_add(1, Ordering::SeqCst),
                        Err(_) => cancels_seen.fetch_add(1, Ordering::SeqCst),
                    };
                }))
                .unwrap()
        };

        let barrier = Arc::new(Barrier::new(2));
        let replier = {
            let table = table.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                table.complete(seq, Ok(seq)).is_ok()
            })
        };
        barrier.wait();
        let cancelled = table.cancel(seq);
        let replied = replier.join().unwrap();

        assert!(cancelled ^ replied, "exactly one side must win");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
    assert_eq!(
        completions.load(Ordering::SeqCst) + cancels_seen.load(Ordering::SeqCst),
        rounds
    );
    assert!(table.is_empty());
}

#[test]
fn concurrent_issuers_never_share_a_sequence() {
    let table: Arc<CorrelationTable<Callback<()>>> = Arc::new(CorrelationTable::new(32));
    let issuers = 4;
    let per_issuer = 5_000;
    let delivered = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..issuers)
        .map(|_| {
            let table = table.clone();
            let delivered = delivered.clone();
            thread::spawn(move || {
                for _ in 0..per_issuer {
                    let delivered = delivered.clone();
                    let seq = loop {
                        let cb = {
                            let delivered = delivered.clone();
                            Callback::new(move |r: Result<(), TransportError>| {
                                assert!(r.is_ok());
                                delivered.fetch_add(1, Ordering::SeqCst);
                            })
                        };
                        match table.allocate(cb) {
                            Ok(seq) => break seq,
                            Err(_) => thread::yield_now(),
                        }
                    };
                    table.complete(seq, Ok(())).unwrap();
                    // A duplicate reply is dropped, never delivered twice.
                    assert_eq!(
                        table.complete(seq, Ok(())),
                        Err(TransportError::UnmatchedReply(seq))
                    );
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(delivered.load(Ordering::SeqCst), issuers * per_issuer);
}

#[test]
fn wait_empty_wakes_on_last_completion() {
    let table: Arc<CorrelationTable<Callback<()>>> = Arc::new(CorrelationTable::new(8));
    let seqs: Vec<u64> = (0..3)
        .map(|_| table.allocate(Callback::new(|_| {})).unwrap())
        .collect();
    assert!(!table.wait_empty(Duration::from_millis(10)));

    let completer = {
        let table = table.clone();
        thread::spawn(move || {
            for seq in seqs {
                thread::sleep(Duration::from_millis(5));
                table.complete(seq, Ok(())).unwrap();
            }
        })
    };
    assert!(table.wait_empty(Duration::from_secs(10)));
    completer.join().unwrap();
}
