// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The event device interface.

use crate::adapter::Injector;
use crate::config::{DevConfig, PortConf, QueueConf};
use crate::event::{PortId, QueueId};
use crate::info::DevInfo;
use crate::port::EventPort;
use crate::service::Service;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of an event device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
pub enum DevState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    Closed,
}

/// Errors reported by an event device.
#[derive(Debug, thiserror::Error)]
pub enum DevError {
    #[error("operation requires device state {expected}, device is {actual}")]
    InvalidState { expected: DevState, actual: DevState },
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("{what}: requested {requested}, device supports at most {max}")]
    ExceedsLimit {
        what: &'static str,
        requested: u32,
        max: u32,
    },
    #[error("queue {queue} out of range ({configured} configured)")]
    QueueOutOfRange { queue: QueueId, configured: u8 },
    #[error("port {port} out of range ({configured} configured)")]
    PortOutOfRange { port: PortId, configured: u8 },
    #[error("queue {0} has not been set up")]
    QueueNotSetUp(QueueId),
    #[error("port {0} has not been set up")]
    PortNotSetUp(PortId),
    #[error("port {0} has already been handed out")]
    PortTaken(PortId),
    #[error("single-link queue {queue} is already linked to port {linked}")]
    SingleLinkTaken { queue: QueueId, linked: PortId },
    #[error("queue kind {0} is not supported by this device")]
    UnsupportedQueueKind(crate::config::QueueKind),
}

/// Device counters (extended statistics).
#[derive(Debug, Default)]
pub struct DevStats {
    /// New events admitted into the device.
    pub new_events: AtomicU64,
    /// New events refused by admission control.
    pub refused: AtomicU64,
    /// Events forwarded by ports.
    pub forwarded: AtomicU64,
    /// Events scheduled to ports.
    pub scheduled: AtomicU64,
    /// Events whose scheduling context ended without a forward (consumed).
    pub released: AtomicU64,
    /// Events dropped by the device itself (bad destination queue).
    pub dropped: AtomicU64,
}

/// Plain copy of [`DevStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DevStatsSnapshot {
    pub new_events: u64,
    pub refused: u64,
    pub forwarded: u64,
    pub scheduled: u64,
    pub released: u64,
    pub dropped: u64,
}

impl DevStats {
    #[must_use]
    pub fn snapshot(&self) -> DevStatsSnapshot {
        DevStatsSnapshot {
            new_events: self.new_events.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// An event device carrying payloads of type `P`.
///
/// Configuration follows a fixed order: [`configure`](Self::configure), then queue and port
/// setup and links, then [`start`](Self::start).
/// No topology mutation is allowed once the device is started.
pub trait EventDevice<P: Send + 'static>: Send {
    type Port: EventPort<P> + 'static;

    /// Report device limits and capabilities.
    fn info(&self) -> DevInfo;

    fn state(&self) -> DevState;

    fn configure(&mut self, config: &DevConfig) -> Result<(), DevError>;

    fn queue_setup(&mut self, queue: QueueId, conf: &QueueConf) -> Result<(), DevError>;

    fn port_setup(&mut self, port: PortId, conf: &PortConf) -> Result<(), DevError>;

    /// Link `port` to `queues`, returning the number of links established.
    fn port_link(&mut self, port: PortId, queues: &[QueueId]) -> Result<usize, DevError>;

    /// Hand out the handle of a set up port; each port can be taken once.
    fn take_port(&mut self, port: PortId) -> Result<Self::Port, DevError>;

    /// A producer of new events into `queue`, admitted against `new_event_threshold`.
    fn injector(&self, queue: QueueId, new_event_threshold: u32) -> Result<Injector<P>, DevError>;

    /// The scheduling task to run on a service core.
    ///
    /// `None` if the device schedules as part of port dequeue.
    fn scheduler_service(&self) -> Result<Option<Box<dyn Service>>, DevError>;

    fn start(&mut self) -> Result<(), DevError>;

    /// Refuse all further new events; in flight events are still scheduled.
    fn stop_new_events(&self);

    /// Events currently in flight in the device (including those held by ports).
    fn inflight(&self) -> u32;

    fn stats(&self) -> DevStatsSnapshot;

    fn stop(&mut self) -> Result<(), DevError>;

    fn close(&mut self) -> Result<(), DevError>;
}
