// Block/SCSI-style command transport over a pair of rings.
//
// The initiator (guest side) binds a reply ring at (domain, STORAGE_PORT_BASE + host)
// and sends requests into the device model's ring at (DOMID_DM, same port). Every
// request and reply payload starts with an `XferHeader`.

use super::builder::{Direction, EndpointBuilder, TransportConfig};
use super::correlation::{Completion, CorrelationTable, Exhausted};
use super::dispatcher::{Dispatcher, DispatcherWorker, Frame, FrameHandler};
use super::gate::FlowControlGate;
use super::quiesce::{QuiesceController, QuiesceState};
use crate::Core::error::{BindFailure, Result, TransportError};
use crate::Core::ports::{DomainId, PortClass, DOMID_DM};
use crate::Core::registry::Registry;
use crate::Ring::Structs::Buffer_Structs::{
    XferHeader, KIND_STORAGE_REPLY, KIND_STORAGE_REQUEST, SENSE_BUFFER_LEN, XFER_HEADER_LEN,
};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host adapters a controller will probe.
pub const MAX_HOSTS: u32 = 4;

/// Default ring length for storage channels.
pub const STORAGE_RING_LEN: usize = 256 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DataDirection {
    None,
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// One command as the upper layer hands it over.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub cdb: Vec<u8>,
    /// Data written to the device.
    pub data_out: Vec<u8>,
    /// Destination segments for data read from the device, filled in place.
    /// Their total length bounds the read.
    pub data_in: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(cdb: impl Into<Vec<u8>>) -> Self {
        Self {
            cdb: cdb.into(),
            ..Self::default()
        }
    }

    pub fn with_data_out(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data_out = data.into();
        self
    }

    pub fn with_data_in(mut self, segments: Vec<Vec<u8>>) -> Self {
        self.data_in = segments;
        self
    }

    pub fn read_capacity(&self) -> usize {
        self.data_in.iter().map(Vec::len).sum()
    }

    pub fn direction(&self) -> DataDirection {
        match (!self.data_out.is_empty(), self.read_capacity() > 0) {
            (false, false) => DataDirection::None,
            (true, false) => DataDirection::ToDevice,
            (false, true) => DataDirection::FromDevice,
            (true, true) => DataDirection::Bidirectional,
        }
    }
}

/// Transport-level outcome, separate from the device's own `status`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HostStatus {
    Ok,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandResult {
    pub host_status: HostStatus,
    /// Device status from the reply header.
    pub status: u32,
    pub sense: Vec<u8>,
    /// The command's destination segments, holding `transferred` bytes in order.
    pub data_in: Vec<Vec<u8>>,
    pub transferred: usize,
}

#[derive(Default)]
struct ResultSlot {
    result: Mutex<Option<Result<CommandResult>>>,
    ready: Condvar,
}

/// Correlation context for one queued command.
pub struct InFlightCommand {
    data_in: Vec<Vec<u8>>,
    slot: Arc<ResultSlot>,
}

impl InFlightCommand {
    fn read_capacity(&self) -> usize {
        self.data_in.iter().map(Vec::len).sum()
    }
}

impl Completion for InFlightCommand {
    type Output = CommandResult;

    fn complete(self, result: Result<CommandResult>) {
        *self.slot.result.lock() = Some(result);
        self.slot.ready.notify_all();
    }
}

/// Caller's side of a queued command.
pub struct CommandHandle {
    sequence: u64,
    slot: Arc<ResultSlot>,
}

impl CommandHandle {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_complete(&self) -> bool {
        self.slot.result.lock().is_some()
    }

    /// Block until the command completes or `timeout` passes.
    ///
    /// A timeout leaves the command in flight; cancel it through the initiator if
    /// it should not be waited for any more.
    pub fn wait(&self, timeout: Duration) -> Option<Result<CommandResult>> {
        let deadline = Instant::now() + timeout;
        let mut result = self.slot.result.lock();
        while result.is_none() {
            if self.slot.ready.wait_until(&mut result, deadline).timed_out() {
                break;
            }
        }
        result.take()
    }
}

/// What `queue_command` did with a command.
pub enum QueueOutcome {
    Accepted(CommandHandle),
    /// Ring full, ids exhausted or suspending: the command is handed back untouched
    /// for the upper layer to requeue.
    DeviceBusy(Command),
}

impl QueueOutcome {
    pub fn is_busy(&self) -> bool {
        matches!(self, QueueOutcome::DeviceBusy(_))
    }
}

/// Dispatcher handler for the initiator's reply ring.
pub struct StorageReplyHandler {
    table: Arc<CorrelationTable<InFlightCommand>>,
}

impl StorageReplyHandler {
    pub fn new(table: Arc<CorrelationTable<InFlightCommand>>) -> Self {
        Self { table }
    }

    /// Fill `request` from the reply body. Sense data is terminal: no read data is
    /// copied for a reply that carries sense.
    fn collect(
        frame: &Frame<'_>,
        xfer: &XferHeader,
        request: &mut InFlightCommand,
    ) -> Result<CommandResult> {
        let body = frame.payload_len() - XFER_HEADER_LEN;
        let mut result = CommandResult {
            host_status: HostStatus::Ok,
            status: xfer.status,
            sense: Vec::new(),
            data_in: Vec::new(),
            transferred: 0,
        };

        if xfer.sense_size > 0 {
            result.host_status = HostStatus::Error;
            let sense_len = xfer.sense_size as usize;
            if sense_len <= SENSE_BUFFER_LEN && sense_len <= body {
                let mut sense = vec![0u8; sense_len];
                frame.copy_out(&mut sense, XFER_HEADER_LEN, XFER_HEADER_LEN + sense_len)?;
                result.sense = sense;
            } else {
                tracing::warn!(
                    sequence = frame.sequence(),
                    sense_len,
                    "sense data does not fit the sense buffer"
                );
            }
        } else if xfer.read_size > 0 {
            let read = xfer.read_size as usize;
            if read > request.read_capacity() {
                tracing::warn!(
                    sequence = frame.sequence(),
                    read,
                    capacity = request.read_capacity(),
                    "reply read size exceeds the command's buffer"
                );
                result.host_status = HostStatus::Error;
            } else if read > body {
                tracing::warn!(
                    sequence = frame.sequence(),
                    read,
                    body,
                    "reply shorter than its read size"
                );
                result.host_status = HostStatus::Error;
            } else {
                let end = XFER_HEADER_LEN + read;
                let mut offset = XFER_HEADER_LEN;
                for segment in request.data_in.iter_mut() {
                    if offset == end {
                        break;
                    }
                    offset += frame.copy_out(segment, offset, end)?;
                }
                result.transferred = read;
            }
        }
        Ok(result)
    }
}

impl FrameHandler for StorageReplyHandler {
    fn on_frame(&mut self, frame: Frame<'_>) -> Result<()> {
        if frame.kind() != KIND_STORAGE_REPLY {
            tracing::warn!(kind = frame.kind(), "unexpected frame on storage reply ring");
            return Ok(());
        }
        if frame.payload_len() < XFER_HEADER_LEN {
            tracing::warn!(
                sequence = frame.sequence(),
                len = frame.payload_len(),
                "short storage reply dropped"
            );
            return Ok(());
        }
        let mut raw = [0u8; XFER_HEADER_LEN];
        frame.copy_out(&mut raw, 0, XFER_HEADER_LEN)?;
        let xfer = XferHeader::decode(&raw);

        let Some(pending) = self.table.take(frame.sequence()) else {
            return Err(TransportError::UnmatchedReply(frame.sequence()));
        };
        let mut request = pending.context;
        match Self::collect(&frame, &xfer, &mut request) {
            Ok(mut result) => {
                result.data_in = std::mem::take(&mut request.data_in);
                request.complete(Ok(result));
                Ok(())
            }
            Err(e) => {
                request.complete(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn on_fault(&mut self, err: &TransportError) {
        // Nothing more will arrive on this ring until it is rebound.
        let cancelled = self.table.cancel_all();
        tracing::error!(error = %err, cancelled, "storage reply ring faulted");
    }
}

/// A request as the device model receives it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRequest {
    pub sequence: u64,
    pub header: XferHeader,
    pub cdb: Vec<u8>,
    pub data_out: Vec<u8>,
}

impl StorageRequest {
    /// Decode a request frame. `None` (logged) if the frame is not a well-formed request.
    pub fn read(frame: &Frame<'_>) -> Result<Option<Self>> {
        if frame.kind() != KIND_STORAGE_REQUEST || frame.payload_len() < XFER_HEADER_LEN {
            tracing::warn!(
                kind = frame.kind(),
                len = frame.payload_len(),
                "not a storage request"
            );
            return Ok(None);
        }
        let mut raw = [0u8; XFER_HEADER_LEN];
        frame.copy_out(&mut raw, 0, XFER_HEADER_LEN)?;
        let header = XferHeader::decode(&raw);

        let cdb_end = XFER_HEADER_LEN + header.cdb_size as usize;
        let data_end = cdb_end + header.write_size as usize;
        if data_end > frame.payload_len() {
            tracing::warn!(
                sequence = frame.sequence(),
                cdb = header.cdb_size,
                write = header.write_size,
                len = frame.payload_len(),
                "storage request sizes exceed its payload"
            );
            return Ok(None);
        }
        let mut cdb = vec![0u8; header.cdb_size as usize];
        frame.copy_out(&mut cdb, XFER_HEADER_LEN, cdb_end)?;
        let mut data_out = vec![0u8; header.write_size as usize];
        frame.copy_out(&mut data_out, cdb_end, data_end)?;
        Ok(Some(Self {
            sequence: frame.sequence(),
            header,
            cdb,
            data_out,
        }))
    }
}

/// Device-model side: answer request `sequence`. Sense data, if any, makes the reply
/// an error and `data_in` is then not carried.
pub fn send_reply(
    gate: &FlowControlGate,
    sequence: u64,
    status: u32,
    sense: &[u8],
    data_in: &[u8],
) -> Result<usize> {
    let data_in = if sense.is_empty() { data_in } else { &[] };
    let header = XferHeader {
        read_size: data_in.len() as u32,
        sense_size: sense.len() as u32,
        status,
        ..XferHeader::default()
    };
    gate.send(sequence, KIND_STORAGE_REPLY, &[&header.encode(), sense, data_in])
}

/// One storage host adapter: request gate, reply dispatcher, correlation and quiesce.
pub struct StorageInitiator {
    host_id: u32,
    gate: FlowControlGate,
    table: Arc<CorrelationTable<InFlightCommand>>,
    dispatcher: Arc<Dispatcher<StorageReplyHandler>>,
    quiesce: QuiesceController<InFlightCommand>,
    worker: Mutex<Option<DispatcherWorker>>,
}

impl StorageInitiator {
    /// Attach host `host_id` of `domain`. The device model must already have bound its
    /// request ring for this host.
    pub fn open(
        registry: &Arc<Registry>,
        domain: DomainId,
        host_id: u32,
        ring_len: usize,
        config: &TransportConfig,
    ) -> Result<Self> {
        let channel = EndpointBuilder::new()
            .with_class_port(PortClass::Storage, host_id, domain, DOMID_DM)?
            .with_ring_len(ring_len);
        let outbound = Arc::new(
            channel
                .clone()
                .with_direction(Direction::Send)
                .build(registry)?,
        );
        let inbound = Arc::new(channel.build(registry)?);
        let local = inbound.local();

        let table = Arc::new(CorrelationTable::new(config.id_space));
        let dispatcher = Arc::new(Dispatcher::new(
            inbound.clone(),
            StorageReplyHandler::new(table.clone()),
            config.drain_budget,
        ));
        let quiesce = QuiesceController::new(
            table.clone(),
            dispatcher.clone(),
            vec![inbound, outbound.clone()],
            config.quiesce_log_interval,
        );
        let worker = dispatcher.spawn(config.notify_fallback);

        tracing::info!(host = host_id, %local, "storage host attached");
        Ok(Self {
            host_id,
            gate: FlowControlGate::new(outbound),
            table,
            dispatcher,
            quiesce,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn host_id(&self) -> u32 {
        self.host_id
    }

    /// Queue `cmd` to the device model.
    ///
    /// Busy conditions come back as `DeviceBusy` with the command; only hard failures
    /// (command too large for the ring, endpoint faulted) are errors. A faulted host
    /// refuses commands until [`StorageInitiator::rebind`].
    pub fn queue_command(&self, mut cmd: Command) -> Result<QueueOutcome> {
        let _admission = match self.quiesce.admit() {
            Ok(admission) => admission,
            Err(e) if e.is_busy() => return Ok(QueueOutcome::DeviceBusy(cmd)),
            Err(e) => return Err(e),
        };

        let header = XferHeader {
            cdb_size: cmd.cdb.len() as u32,
            write_size: cmd.data_out.len() as u32,
            pagelist_size: 0,
            read_size: cmd.read_capacity() as u32,
            sense_size: SENSE_BUFFER_LEN as u32,
            status: 0,
        };
        let slot = Arc::new(ResultSlot::default());
        let request = InFlightCommand {
            data_in: std::mem::take(&mut cmd.data_in),
            slot: slot.clone(),
        };
        let sequence = match self.table.allocate(request) {
            Ok(sequence) => sequence,
            Err(Exhausted(request)) => {
                cmd.data_in = request.data_in;
                return Ok(QueueOutcome::DeviceBusy(cmd));
            }
        };
        // Checked after allocating: a fault landing later cancels this sequence along
        // with everything else in the table.
        if self.is_faulted() {
            self.table.release(sequence);
            return Err(TransportError::Faulted);
        }

        let sent = self.gate.send(
            sequence,
            KIND_STORAGE_REQUEST,
            &[&header.encode(), &cmd.cdb, &cmd.data_out],
        );
        match sent {
            Ok(_) => Ok(QueueOutcome::Accepted(CommandHandle { sequence, slot })),
            Err(e) => {
                if let Some(request) = self.table.release(sequence) {
                    cmd.data_in = request.data_in;
                }
                if e.is_busy() {
                    Ok(QueueOutcome::DeviceBusy(cmd))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Give up on a command; its handle sees `Cancelled` unless the reply won.
    pub fn cancel(&self, handle: &CommandHandle) -> bool {
        self.table.cancel(handle.sequence())
    }

    pub fn pending(&self) -> usize {
        self.table.pending()
    }

    pub fn state(&self) -> QuiesceState {
        self.quiesce.state()
    }

    /// Either ring of this host was torn down after a protocol violation.
    pub fn is_faulted(&self) -> bool {
        self.dispatcher.endpoint().is_faulted() || self.gate.endpoint().is_faulted()
    }

    /// Bind fresh rings for whichever side faulted. Commands in flight at the fault
    /// were already cancelled. The device model must rebind its reply sender to reach
    /// a fresh reply ring.
    pub fn rebind(&self) -> Result<()> {
        let _admission = self.quiesce.admit()?;
        for endpoint in [self.dispatcher.endpoint(), self.gate.endpoint()] {
            if endpoint.is_faulted() {
                endpoint.rebind()?;
            }
        }
        tracing::info!(host = self.host_id, "storage host rebound");
        // Let the worker pick up the fresh ring without waiting for its fallback.
        self.dispatcher.wake();
        Ok(())
    }

    pub fn suspend(&self) {
        tracing::info!(host = self.host_id, "suspending storage host");
        self.quiesce.suspend();
    }

    pub fn resume(&self) -> Result<()> {
        tracing::info!(host = self.host_id, "resuming storage host");
        self.quiesce.resume()
    }

    pub fn cancel_in_flight(&self) -> usize {
        self.quiesce.cancel_in_flight()
    }

    /// Drain the reply ring on the calling thread.
    pub fn poll(&self) {
        self.dispatcher.run_once();
    }
}

impl Drop for StorageInitiator {
    fn drop(&mut self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.stop();
        }
    }
}

/// All storage hosts of one domain.
pub struct StorageController {
    registry: Arc<Registry>,
    domain: DomainId,
    ring_len: usize,
    config: TransportConfig,
    hosts: Mutex<BTreeMap<u32, Arc<StorageInitiator>>>,
}

impl StorageController {
    pub fn new(registry: Arc<Registry>, domain: DomainId, config: TransportConfig) -> Self {
        Self {
            registry,
            domain,
            ring_len: STORAGE_RING_LEN,
            config,
            hosts: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_ring_len(mut self, ring_len: usize) -> Self {
        self.ring_len = ring_len;
        self
    }

    /// Attach every host whose bit is set in `bitmap`. Returns the host ids attached.
    pub fn probe(&self, bitmap: u32) -> Result<Vec<u32>> {
        if bitmap >> MAX_HOSTS != 0 {
            tracing::warn!(bitmap, max = MAX_HOSTS, "ignoring hosts beyond the supported count");
        }
        let mut attached = Vec::new();
        for host_id in (0..MAX_HOSTS).filter(|id| bitmap & (1 << id) != 0) {
            self.add_host(host_id)?;
            attached.push(host_id);
        }
        Ok(attached)
    }

    pub fn add_host(&self, host_id: u32) -> Result<Arc<StorageInitiator>> {
        let mut hosts = self.hosts.lock();
        if hosts.contains_key(&host_id) {
            return Err(BindFailure::AlreadyBound {
                domain: self.domain,
                port: PortClass::Storage.port(host_id)?,
            }
            .into());
        }
        let initiator = Arc::new(StorageInitiator::open(
            &self.registry,
            self.domain,
            host_id,
            self.ring_len,
            &self.config,
        )?);
        hosts.insert(host_id, initiator.clone());
        Ok(initiator)
    }

    pub fn host(&self, host_id: u32) -> Option<Arc<StorageInitiator>> {
        self.hosts.lock().get(&host_id).cloned()
    }

    pub fn hosts(&self) -> Vec<u32> {
        self.hosts.lock().keys().copied().collect()
    }

    pub fn suspend(&self, host_id: u32) -> bool {
        let Some(host) = self.host(host_id) else {
            return false;
        };
        host.suspend();
        true
    }

    pub fn resume(&self, host_id: u32) -> Result<bool> {
        let Some(host) = self.host(host_id) else {
            return Ok(false);
        };
        host.resume()?;
        Ok(true)
    }

    pub fn suspend_all(&self) {
        let hosts: Vec<_> = self.hosts.lock().values().cloned().collect();
        for host in hosts {
            host.suspend();
        }
    }

    pub fn resume_all(&self) -> Result<()> {
        let hosts: Vec<_> = self.hosts.lock().values().cloned().collect();
        for host in hosts {
            host.resume()?;
        }
        Ok(())
    }

    /// Detach a host. In-flight commands are drained first.
    pub fn remove(&self, host_id: u32) -> bool {
        let Some(host) = self.hosts.lock().remove(&host_id) else {
            return false;
        };
        host.suspend();
        tracing::info!(host = host_id, "storage host removed");
        true
    }

    /// Host ids with a reply ring bound for this domain, found via the registry.
    pub fn scan(&self) -> Vec<u32> {
        let base = PortClass::Storage.base();
        self.registry
            .bindings()
            .into_iter()
            .filter(|addr| {
                addr.domain == self.domain && PortClass::of(addr.port) == Some(PortClass::Storage)
            })
            .map(|addr| addr.port - base)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_buffers() {
        assert_eq!(Command::new([0u8; 6]).direction(), DataDirection::None);
        assert_eq!(
            Command::new([0u8; 6]).with_data_out(vec![1, 2]).direction(),
            DataDirection::ToDevice
        );
        let read = Command::new([0x28u8; 10]).with_data_in(vec![vec![0; 512], vec![0; 512]]);
        assert_eq!(read.direction(), DataDirection::FromDevice);
        assert_eq!(read.read_capacity(), 1024);
    }
}
