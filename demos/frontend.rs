// Guest side of the diagnostics channel: maps the backend's ring from /dev/shm and
// sends hash-tagged messages, waiting out a full ring instead of dropping.
//
// cargo run --example frontend -- <num_messages> [--auto-exit]
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use v4v_ring::Core::error::TransportError;
use v4v_ring::Core::ports::{DIAGNOSTICS_PORT, DOMID_DM};
use v4v_ring::Core::{Addr, Backing, Registry};
use v4v_ring::Ring::Structs::Buffer_Structs::KIND_DIAGNOSTICS;
use v4v_ring::Transport::{Direction, EndpointBuilder, FlowControlGate};

const GUEST_DOMAIN: u16 = 1;

fn main() -> Result<(), TransportError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_messages: usize = args[1].parse().unwrap_or_else(|_| {
        eprintln!("Invalid number of messages: {}", args[1]);
        std::process::exit(1);
    });
    let auto_exit = args.get(2).is_some_and(|s| s == "--auto-exit");

    println!("Frontend: Precomputing {} hashes...", num_messages);
    let start_precompute = Instant::now();
    let messages: Vec<String> = (0..num_messages)
        .map(|i| format!("{}:{:x}", i, Sha256::digest(format!("message_{i}"))))
        .collect();
    println!(
        "Frontend: Precomputed {} hashes in {:.2?}",
        num_messages,
        start_precompute.elapsed()
    );

    let registry = Arc::new(Registry::with_backing(Backing::Shared));
    let endpoint = EndpointBuilder::new()
        .with_local(Addr::new(GUEST_DOMAIN, DIAGNOSTICS_PORT))
        .with_remote(Addr::new(DOMID_DM, DIAGNOSTICS_PORT))
        .with_direction(Direction::Send)
        .build(&registry)
        .inspect_err(|e| eprintln!("Frontend: no backend ring ({e}); start the backend first"))?;
    let gate = FlowControlGate::new(Arc::new(endpoint));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            eprintln!("Error setting Ctrl+C handler: {e}");
        }
    }

    let start_send = Instant::now();
    let mut sent = 0;
    for (i, message) in messages.iter().enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match gate.send_blocking(
            i as u64,
            KIND_DIAGNOSTICS,
            &[message.as_bytes()],
            Some(Duration::from_secs(5)),
        ) {
            Ok(_) => {
                sent += 1;
                if sent % 100 == 0 {
                    println!("Sent {} messages", sent);
                }
            }
            Err(TransportError::Overflow) => {
                eprintln!("Frontend: backend stopped draining at message {i}");
                break;
            }
            Err(e) => return Err(e),
        }
    }

    let send_time = start_send.elapsed();
    println!("Frontend: Sent {} messages in {:.2?}", sent, send_time);
    println!(
        "Frontend: Throughput: {:.2} messages/sec ({} stalls)",
        sent as f64 / send_time.as_secs_f64(),
        gate.stall_count()
    );

    if !auto_exit {
        println!("Press Ctrl+C to exit...");
        while running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
    println!("Frontend: Shutting down");
    Ok(())
}
