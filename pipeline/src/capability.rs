// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Check a topology plan against the limits an event device reports.

use crate::error::ConfigError;
use crate::topology::{Topology, TopologyPlan};
use eventdev::config::QueueKind;
use eventdev::info::DevInfo;
use tracing::debug;

/// Reject `plan` if it does not fit the device described by `info`.
///
/// This runs before the device is configured; a failure is a static misconfiguration.
#[tracing::instrument(level = "debug", skip(plan, info), fields(driver = info.driver_name))]
pub fn check_capabilities(
    plan: &TopologyPlan,
    info: &DevInfo,
    dequeue_depth: Option<u16>,
) -> Result<(), ConfigError> {
    if plan.queue_count() > usize::from(info.max_event_queues) {
        return Err(ConfigError::TooManyQueues {
            requested: plan.queue_count(),
            available: usize::from(info.max_event_queues),
        });
    }
    if plan.port_count() > usize::from(info.max_event_ports) {
        return Err(ConfigError::TooManyPorts {
            requested: plan.port_count(),
            available: usize::from(info.max_event_ports),
        });
    }
    if plan.nb_flows > info.max_event_queue_flows {
        return Err(ConfigError::TooManyFlows {
            requested: plan.nb_flows,
            available: info.max_event_queue_flows,
        });
    }
    if let Some(queue) = plan.queues.iter().find(|q| {
        q.kind != QueueKind::SingleLink && q.nb_atomic_order_sequences > info.max_num_events
    }) {
        return Err(ConfigError::TooManyOrderSequences {
            queue: queue.id,
            requested: queue.nb_atomic_order_sequences,
            available: info.max_num_events,
        });
    }
    match dequeue_depth {
        Some(0) => return Err(ConfigError::ZeroDequeueDepth),
        Some(depth) if depth > info.max_event_port_dequeue_depth => {
            return Err(ConfigError::DequeueDepth {
                requested: depth,
                available: info.max_event_port_dequeue_depth,
            });
        }
        _ => {}
    }
    if plan.topology == Topology::AllTypesQueue && !info.has_all_types_queues() {
        return Err(ConfigError::NoAllTypesQueues {
            driver: info.driver_name,
        });
    }
    debug!(
        "plan fits: {} of {} queues, {} of {} ports",
        plan.queue_count(),
        info.max_event_queues,
        plan.port_count(),
        info.max_event_ports
    );
    Ok(())
}
