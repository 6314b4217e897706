// Device-model side of the diagnostics channel: binds the ring in /dev/shm and
// prints whatever a frontend sends until Ctrl+C or the expected count arrives.
//
// cargo run --example backend -- <expected_messages>
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use v4v_ring::Core::error::TransportError;
use v4v_ring::Core::ports::{
    DIAGNOSTICS_MAX_PAYLOAD, DIAGNOSTICS_PORT, DIAGNOSTICS_RING_LEN, DOMID_ANY, DOMID_DM,
};
use v4v_ring::Core::{Addr, Backing, Registry};
use v4v_ring::Transport::{Dispatcher, EndpointBuilder, Frame};

fn main() -> Result<(), TransportError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <expected_messages>", args[0]);
        std::process::exit(1);
    }
    let expected: usize = args[1].parse().unwrap_or_else(|_| {
        eprintln!("Invalid number of messages: {}", args[1]);
        std::process::exit(1);
    });

    let registry = Arc::new(Registry::with_backing(Backing::Shared));
    let endpoint = Arc::new(
        EndpointBuilder::new()
            .with_local(Addr::new(DOMID_DM, DIAGNOSTICS_PORT))
            .with_remote(Addr::new(DOMID_ANY, DIAGNOSTICS_PORT))
            .with_ring_len(DIAGNOSTICS_RING_LEN)
            .with_max_payload(DIAGNOSTICS_MAX_PAYLOAD)
            .build(&registry)?,
    );
    println!("Backend: ring bound at {}", endpoint.local());

    let received = Arc::new(AtomicUsize::new(0));
    let corrupt = Arc::new(AtomicUsize::new(0));
    let handler = {
        let received = received.clone();
        let corrupt = corrupt.clone();
        move |frame: Frame<'_>| -> Result<(), TransportError> {
            let payload = frame.read_payload()?;
            let text = String::from_utf8_lossy(&payload);
            // "<n>:<sha256 of message_n>"
            let valid = text
                .split_once(':')
                .filter(|(n, hash)| format!("{:x}", Sha256::digest(format!("message_{n}"))) == *hash);
            match valid {
                Some((_, hash)) => println!("{:<10} {}", frame.sequence(), hash),
                None => {
                    corrupt.fetch_add(1, Ordering::Relaxed);
                    eprintln!("Bad message {}: {}", frame.sequence(), text);
                }
            }
            received.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(endpoint.clone(), handler, 64));
    let mut worker = dispatcher.spawn(Duration::from_millis(500));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)) {
            eprintln!("Error setting Ctrl+C handler: {e}");
        }
    }

    println!("\n{:<10} {}", "Seq", "Hash");
    println!("{}", "=".repeat(80));
    let start = std::time::Instant::now();
    while running.load(Ordering::SeqCst) && received.load(Ordering::Relaxed) < expected {
        std::thread::sleep(Duration::from_millis(50));
    }
    worker.stop();

    let received = received.load(Ordering::Relaxed);
    println!(
        "Backend: received {} messages ({} corrupt) in {:.2?}",
        received,
        corrupt.load(Ordering::Relaxed),
        start.elapsed()
    );
    println!("Backend: Shutting down");
    Ok(())
}
