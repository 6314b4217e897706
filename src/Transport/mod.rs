mod builder;
mod correlation;
mod dirty;
mod dispatcher;
mod endpoint;
mod gate;
mod notify;
mod quiesce;
pub mod storage;

pub use builder::{Direction, EndpointBuilder, EndpointConfig, TransportConfig, DEFAULT_RING_LEN};
pub use correlation::{Callback, Completion, CorrelationTable, Exhausted, PendingRequest};
pub use dirty::{DirtyRegionAccumulator, DirtyRegionTicker, Rect};
pub use dispatcher::{
    DispatchState, Dispatcher, DispatcherWorker, DrainControl, DrainOutcome, Frame, FrameHandler,
};
pub use endpoint::Endpoint;
pub use gate::FlowControlGate;
pub use notify::{Doorbell, NotificationBridge, Wake, WakeQueue};
pub use quiesce::{Admission, QuiesceController, QuiesceState};

use crate::Core::error::Result;

/// How an upper layer should treat a send attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueStatus {
    Queued,
    /// Temporarily unable to accept; requeue and retry later.
    DeviceBusy,
}

/// Fold busy errors (`Overflow`, `ExhaustedIds`, `Quiescing`) into `DeviceBusy`;
/// anything else stays an error.
pub fn queue_status<T>(result: Result<T>) -> Result<QueueStatus> {
    match result {
        Ok(_) => Ok(QueueStatus::Queued),
        Err(e) if e.is_busy() => Ok(QueueStatus::DeviceBusy),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Core::error::TransportError;

    #[test]
    fn busy_errors_become_device_busy() {
        assert_eq!(queue_status(Ok(16usize)), Ok(QueueStatus::Queued));
        assert_eq!(
            queue_status::<()>(Err(TransportError::Overflow)),
            Ok(QueueStatus::DeviceBusy)
        );
        assert_eq!(
            queue_status::<()>(Err(TransportError::Quiescing)),
            Ok(QueueStatus::DeviceBusy)
        );
        assert_eq!(
            queue_status::<()>(Err(TransportError::Faulted)),
            Err(TransportError::Faulted)
        );
    }
}
