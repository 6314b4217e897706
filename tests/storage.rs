use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use v4v_ring::Core::error::{BindFailure, TransportError};
use v4v_ring::Core::ports::{DOMID_DM, STORAGE_PORT_BASE};
use v4v_ring::Core::{Addr, Registry};
use v4v_ring::Ring::Buffer::layout::OFF_PRODUCER;
use v4v_ring::Transport::storage::{
    send_reply, Command, HostStatus, QueueOutcome, StorageController, StorageInitiator,
    StorageRequest,
};
use v4v_ring::Transport::{
    Direction, Dispatcher, DispatcherWorker, Endpoint, EndpointBuilder, FlowControlGate, Frame,
    QuiesceState, TransportConfig,
};

const GUEST: u16 = 5;
const RING_LEN: usize = 16 * 1024;

/// How the fake device model answers a request.
type Responder = fn(&StorageRequest) -> (u32, Vec<u8>, Vec<u8>);

/// The device-model end of one storage host: request ring, reply gate, worker.
struct DeviceModel {
    requests: Arc<Mutex<Vec<StorageRequest>>>,
    reply_endpoint: Arc<Endpoint>,
    _worker: DispatcherWorker,
    _request_endpoint: Arc<Endpoint>,
}

fn bind_request_ring(registry: &Arc<Registry>, host: u32) -> Arc<Endpoint> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let port = STORAGE_PORT_BASE + host;
    Arc::new(
        EndpointBuilder::new()
            .with_local(Addr::new(DOMID_DM, port))
            .with_remote(Addr::new(GUEST, port))
            .with_ring_len(RING_LEN)
            .build(registry)
            .unwrap(),
    )
}

/// Call once the initiator has bound its reply ring.
fn start_device_model(
    registry: &Arc<Registry>,
    request_endpoint: Arc<Endpoint>,
    respond: Responder,
) -> DeviceModel {
    let port = request_endpoint.local().port;
    let reply_endpoint = Arc::new(
        EndpointBuilder::new()
            .with_local(Addr::new(DOMID_DM, port))
            .with_remote(Addr::new(GUEST, port))
            .with_direction(Direction::Send)
            .build(registry)
            .unwrap(),
    );
    let gate = FlowControlGate::new(reply_endpoint.clone());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let requests = requests.clone();
        move |frame: Frame<'_>| -> Result<(), TransportError> {
            let Some(request) = StorageRequest::read(&frame)? else {
                return Ok(());
            };
            let (status, sense, data) = respond(&request);
            send_reply(&gate, request.sequence, status, &sense, &data)?;
            requests.lock().push(request);
            Ok(())
        }
    };
    let dispatcher = Arc::new(Dispatcher::new(request_endpoint.clone(), handler, 16));
    DeviceModel {
        requests,
        reply_endpoint,
        _worker: dispatcher.spawn(Duration::from_millis(100)),
        _request_endpoint: request_endpoint,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

fn accepted(outcome: QueueOutcome) -> v4v_ring::Transport::storage::CommandHandle {
    match outcome {
        QueueOutcome::Accepted(handle) => handle,
        QueueOutcome::DeviceBusy(_) => panic!("device unexpectedly busy"),
    }
}

#[test]
fn read_scatters_into_command_segments() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 0);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 0, RING_LEN, &TransportConfig::default())
            .unwrap();
    let dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), pattern(1000)));

    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 512], vec![0; 512]]);
    let handle = accepted(initiator.queue_command(cmd).unwrap());
    let result = handle.wait(Duration::from_secs(5)).unwrap().unwrap();

    assert_eq!(result.host_status, HostStatus::Ok);
    assert_eq!(result.status, 0);
    assert_eq!(result.transferred, 1000);
    let expected = pattern(1000);
    assert_eq!(result.data_in[0], expected[..512]);
    assert_eq!(result.data_in[1][..488], expected[512..]);
    assert!(result.data_in[1][488..].iter().all(|&b| b == 0));
    assert_eq!(initiator.pending(), 0);

    let seen = dm.requests.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].cdb, vec![0x28u8; 10]);
    assert_eq!(seen[0].header.read_size, 1024);
    assert_eq!(seen[0].sequence, handle.sequence());
}

#[test]
fn write_data_reaches_the_device_model() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 1);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 1, RING_LEN, &TransportConfig::default())
            .unwrap();
    let dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), Vec::new()));

    let cmd = Command::new([0x2au8; 10]).with_data_out(pattern(2048));
    let result = accepted(initiator.queue_command(cmd).unwrap())
        .wait(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(result.host_status, HostStatus::Ok);
    assert_eq!(result.transferred, 0);

    let seen = dm.requests.lock();
    assert_eq!(seen[0].data_out, pattern(2048));
    assert_eq!(seen[0].header.write_size, 2048);
}

#[test]
fn sense_data_is_terminal() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 0);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 0, RING_LEN, &TransportConfig::default())
            .unwrap();
    let _dm = start_device_model(&registry, request_ring, |_| {
        (2, vec![0x70, 0, 0x05, 0, 0, 0, 0, 10], pattern(256))
    });

    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 256]]);
    let result = accepted(initiator.queue_command(cmd).unwrap())
        .wait(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(result.host_status, HostStatus::Error);
    assert_eq!(result.status, 2);
    assert_eq!(result.sense[..3], [0x70, 0, 0x05]);
    assert_eq!(result.transferred, 0);
    assert!(result.data_in[0].iter().all(|&b| b == 0));
}

#[test]
fn oversized_read_reply_is_a_host_error() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 0);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 0, RING_LEN, &TransportConfig::default())
            .unwrap();
    let _dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), pattern(600)));

    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 512]]);
    let result = accepted(initiator.queue_command(cmd).unwrap())
        .wait(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(result.host_status, HostStatus::Error);
    assert_eq!(result.transferred, 0);
}

#[test]
fn busy_conditions_hand_the_command_back() {
    let registry = Arc::new(Registry::new());
    let _request_ring = bind_request_ring(&registry, 2);
    let config = TransportConfig::default()
        .with_id_space(2)
        .with_quiesce_log_interval(Duration::from_millis(10));
    let initiator = Arc::new(StorageInitiator::open(&registry, GUEST, 2, RING_LEN, &config).unwrap());

    // Nobody answers: the id space fills up.
    let first = accepted(initiator.queue_command(Command::new([0u8; 6])).unwrap());
    let _second = accepted(initiator.queue_command(Command::new([0u8; 6])).unwrap());
    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![9; 64]]);
    match initiator.queue_command(cmd.clone()).unwrap() {
        QueueOutcome::DeviceBusy(back) => assert_eq!(back, cmd),
        QueueOutcome::Accepted(_) => panic!("id space should be exhausted"),
    }

    // Suspend waits for the two in flight; cancelling them lets it finish.
    let suspender = {
        let initiator = initiator.clone();
        thread::spawn(move || initiator.suspend())
    };
    while initiator.state() != QuiesceState::Draining {
        thread::yield_now();
    }
    assert!(initiator.queue_command(cmd.clone()).unwrap().is_busy());
    assert_eq!(initiator.cancel_in_flight(), 2);
    suspender.join().unwrap();
    assert_eq!(
        first.wait(Duration::from_secs(1)),
        Some(Err(TransportError::Cancelled))
    );
    assert_eq!(initiator.state(), QuiesceState::Suspended);
    assert!(initiator.queue_command(cmd.clone()).unwrap().is_busy());

    initiator.resume().unwrap();
    assert_eq!(initiator.state(), QuiesceState::Active);
    assert!(!initiator.queue_command(cmd).unwrap().is_busy());
}

#[test]
fn cancelled_command_ignores_a_late_reply() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 3);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 3, RING_LEN, &TransportConfig::default())
            .unwrap();

    let handle = accepted(initiator.queue_command(Command::new([0u8; 6])).unwrap());
    assert!(initiator.cancel(&handle));
    assert_eq!(
        handle.wait(Duration::from_secs(1)),
        Some(Err(TransportError::Cancelled))
    );

    // The device model answers afterwards; the reply is dropped as unmatched.
    let dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), Vec::new()));
    while dm.requests.lock().is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    initiator.poll();
    assert_eq!(initiator.pending(), 0);
    assert!(dm.reply_endpoint.is_bound());
}

#[test]
fn resume_gives_the_device_model_a_fresh_reply_ring() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 0);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 0, RING_LEN, &TransportConfig::default())
            .unwrap();
    let dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), pattern(16)));

    initiator.suspend();
    assert!(!registry.is_bound(Addr::new(GUEST, STORAGE_PORT_BASE)));
    initiator.resume().unwrap();
    // The device model re-maps the guest's new reply ring.
    dm.reply_endpoint.rebind().unwrap();

    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 16]]);
    let result = accepted(initiator.queue_command(cmd).unwrap())
        .wait(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(result.data_in[0], pattern(16));
}

#[test]
fn faulted_host_refuses_commands_until_rebound() {
    let registry = Arc::new(Registry::new());
    let request_ring = bind_request_ring(&registry, 1);
    let initiator =
        StorageInitiator::open(&registry, GUEST, 1, RING_LEN, &TransportConfig::default())
            .unwrap();
    let dm = start_device_model(&registry, request_ring, |_| (0, Vec::new(), pattern(32)));

    // An impossible producer offset in the guest's reply ring.
    let reply_ring = registry
        .lookup(Addr::new(GUEST, STORAGE_PORT_BASE + 1))
        .unwrap();
    let producer =
        unsafe { &*(reply_ring.memory().as_ptr().add(OFF_PRODUCER) as *const AtomicU32) };
    producer.store(1_000_000, Ordering::Release);
    initiator.poll();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !initiator.is_faulted() {
        assert!(Instant::now() < deadline, "reply ring never faulted");
        thread::sleep(Duration::from_millis(1));
    }
    drop(reply_ring);

    let cmd = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 32]]);
    assert_eq!(
        initiator.queue_command(cmd.clone()).err(),
        Some(TransportError::Faulted)
    );
    assert_eq!(initiator.pending(), 0);
    assert!(dm.requests.lock().is_empty());

    initiator.rebind().unwrap();
    assert!(!initiator.is_faulted());
    assert_eq!(initiator.state(), QuiesceState::Active);
    dm.reply_endpoint.rebind().unwrap();

    let result = accepted(initiator.queue_command(cmd).unwrap())
        .wait(Duration::from_secs(5))
        .unwrap()
        .unwrap();
    assert_eq!(result.host_status, HostStatus::Ok);
    assert_eq!(result.data_in[0], pattern(32));
    assert_eq!(initiator.pending(), 0);
}

#[test]
fn controller_probe_scan_and_remove() {
    let registry = Arc::new(Registry::new());
    let _host0 = bind_request_ring(&registry, 0);
    let _host2 = bind_request_ring(&registry, 2);
    let controller = StorageController::new(registry.clone(), GUEST, TransportConfig::default())
        .with_ring_len(RING_LEN);

    assert_eq!(controller.probe(0b101).unwrap(), vec![0, 2]);
    assert_eq!(controller.hosts(), vec![0, 2]);
    assert_eq!(controller.scan(), vec![0, 2]);

    // No device model behind host 1.
    assert!(matches!(
        controller.add_host(1),
        Err(TransportError::Bind(BindFailure::NoSuchBinding { .. }))
    ));
    assert!(matches!(
        controller.add_host(2),
        Err(TransportError::Bind(BindFailure::AlreadyBound { .. }))
    ));

    controller.suspend_all();
    assert_eq!(controller.host(0).unwrap().state(), QuiesceState::Suspended);
    assert!(controller.scan().is_empty());
    controller.resume_all().unwrap();
    assert_eq!(controller.scan(), vec![0, 2]);

    assert!(controller.remove(0));
    assert!(!controller.remove(0));
    assert_eq!(controller.hosts(), vec![2]);
    assert_eq!(controller.scan(), vec![2]);
}
