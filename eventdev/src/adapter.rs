// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Receive adapters: turn external input into new events.

use crate::event::{Event, FlowId, QueueId, SchedType};
use core::fmt::Display;
use std::sync::Arc;

/// Index of an input source (an ethernet port in a packet pipeline).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct SourceId(pub u16);

impl SourceId {
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a new event was not accepted. The payload is handed back.
#[derive(Debug)]
pub enum InjectError<P> {
    /// Too many events in flight; retry later.
    Backpressure(P),
    /// The device is not accepting new events.
    Closed(P),
}

impl<P> InjectError<P> {
    #[must_use]
    pub fn into_payload(self) -> P {
        match self {
            InjectError::Backpressure(p) | InjectError::Closed(p) => p,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, InjectError::Closed(_))
    }
}

/// Device side of an [`Injector`].
pub trait NewEventSink<P>: Send + Sync {
    fn inject(&self, event: Event<P>, threshold: u32) -> Result<(), InjectError<P>>;
}

/// Producer of new events into one queue of a device.
pub struct Injector<P> {
    queue: QueueId,
    sched_type: SchedType,
    threshold: u32,
    sink: Arc<dyn NewEventSink<P>>,
}

impl<P> Clone for Injector<P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue,
            sched_type: self.sched_type,
            threshold: self.threshold,
            sink: self.sink.clone(),
        }
    }
}

impl<P> core::fmt::Debug for Injector<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Injector")
            .field("queue", &self.queue)
            .field("sched_type", &self.sched_type)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl<P> Injector<P> {
    /// An injector of atomic events; see [`Injector::with_sched_type`].
    #[must_use]
    pub fn new(queue: QueueId, threshold: u32, sink: Arc<dyn NewEventSink<P>>) -> Self {
        Self {
            queue,
            sched_type: SchedType::Atomic,
            threshold,
            sink,
        }
    }

    /// Scheduling type of the events injected, the one of the first stage.
    #[must_use]
    pub fn with_sched_type(mut self, sched_type: SchedType) -> Self {
        self.sched_type = sched_type;
        self
    }

    #[must_use]
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    #[must_use]
    pub fn sched_type(&self) -> SchedType {
        self.sched_type
    }

    /// Inject a new event for `flow` at the first stage.
    pub fn inject(&self, flow: FlowId, payload: P) -> Result<(), InjectError<P>> {
        self.sink.inject(
            Event::new(flow, self.queue, self.sched_type, payload),
            self.threshold,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown source {0}")]
    UnknownSource(SourceId),
    #[error("source {0} is already bound")]
    AlreadyBound(SourceId),
    #[error("adapter has no bound source")]
    NothingBound,
    #[error("adapter already started")]
    AlreadyStarted,
    #[error("adapter thread failed: {0}")]
    Thread(String),
}

/// Receive adapter: bound to sources, injects one new event per received item.
///
/// Every injected event carries flow id and scheduling type chosen by the adapter;
/// the adapter retries on backpressure and stops on [`RxAdapter::stop`].
pub trait RxAdapter<P>: Send {
    fn bind(
        &mut self,
        queue: QueueId,
        source: SourceId,
        injector: Injector<P>,
    ) -> Result<(), AdapterError>;

    fn start(&mut self) -> Result<(), AdapterError>;

    /// Stop injecting and wait for the adapter threads (if any) to wind down.
    fn stop(&mut self) -> Result<(), AdapterError>;
}
