// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event device abstraction.
//!
//! An event device schedules [`Event`]s from a set of queues to a set of ports.
//! Each queue has a scheduling discipline (atomic, ordered, parallel, or single-link) and each
//! port is owned by exactly one core, which dequeues held events from it and enqueues events
//! back into the device.
//!
//! The crate provides the [`EventDevice`] / [`EventPort`] traits, a software implementation of
//! both ([`sw::SwEventDev`]), the service-core runtime used to run infrastructure tasks
//! ([`service`]), and the interfaces of the receive and transmit collaborators
//! ([`adapter`], [`tx`]).

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod adapter;
pub mod config;
pub mod dev;
pub mod event;
mod flow;
pub mod info;
pub mod lcore;
pub mod port;
mod sched;
pub mod service;
pub mod sw;
pub mod tx;

pub use dev::{DevError, DevState, DevStats, EventDevice};
pub use event::{Event, EventOp, FlowId, PortId, QueueId, SchedType, StageId};
pub use port::{EnqueueError, EnqueueErrorKind, EventPort};
