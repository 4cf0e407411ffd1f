// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A staged, flow-aware event pipeline over an event device.
//!
//! Received events enter one queue per receive source and travel through a fixed list of
//! stages, each with its own scheduling type. Worker tasks dequeue, run the stage handler,
//! and re-enqueue the event for its next stage; final events are transmitted either by the
//! workers directly or, when the transmit path cannot be called concurrently, by a single
//! transmit service fed through a single-link queue.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

mod capability;
mod error;
mod lifecycle;
mod opts;
pub mod sample;
mod setup;
mod stage;
mod stats;
mod topology;
mod tx_service;
mod worker;

pub use capability::check_capabilities;
pub use error::{ConfigError, LifecycleError, PipelineError, Step};
pub use lifecycle::Pipeline;
pub use opts::{PipelineOpts, PipelineOptsBuilder, PipelineOptsBuilderError};
pub use stage::{HandlerFactory, StageHandler, Verdict};
pub use stats::{Stats, TxServiceStats, WorkerStats};
pub use topology::{MAX_STAGES, PortPlan, PortRole, QueuePlan, Topology, TopologyPlan};
