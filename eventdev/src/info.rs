// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device capability probe.

use core::fmt::Display;

bitflags::bitflags! {
    /// Optional features an event device may support.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct DevCapabilities: u32 {
        /// Scheduling happens as part of every port dequeue; no scheduling service is needed.
        const DISTRIBUTED_SCHED = 1 << 0;
        /// A single queue can carry atomic, ordered and parallel events at the same time.
        const QUEUE_ALL_TYPES = 1 << 1;
        /// Ports can dequeue and enqueue more than one event per call.
        const BURST_MODE = 1 << 2;
    }
}

/// Limits and capabilities reported by an event device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: &'static str,
    pub max_event_queues: u8,
    pub max_event_ports: u8,
    /// Maximum number of events in flight in the device at any time.
    pub max_num_events: u32,
    pub max_event_port_dequeue_depth: u16,
    pub max_event_port_enqueue_depth: u16,
    /// Maximum number of flow contexts per atomic queue.
    pub max_event_queue_flows: u32,
    pub capabilities: DevCapabilities,
}

impl DevInfo {
    #[must_use]
    pub fn has_distributed_sched(&self) -> bool {
        self.capabilities.contains(DevCapabilities::DISTRIBUTED_SCHED)
    }

    #[must_use]
    pub fn has_all_types_queues(&self) -> bool {
        self.capabilities.contains(DevCapabilities::QUEUE_ALL_TYPES)
    }

    #[must_use]
    pub fn has_burst_mode(&self) -> bool {
        self.capabilities.contains(DevCapabilities::BURST_MODE)
    }
}

impl Display for DevInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "event device '{}'", self.driver_name)?;
        writeln!(f, "  max queues        : {}", self.max_event_queues)?;
        writeln!(f, "  max ports         : {}", self.max_event_ports)?;
        writeln!(f, "  max events        : {}", self.max_num_events)?;
        writeln!(f, "  max dequeue depth : {}", self.max_event_port_dequeue_depth)?;
        writeln!(f, "  max enqueue depth : {}", self.max_event_port_enqueue_depth)?;
        writeln!(f, "  max queue flows   : {}", self.max_event_queue_flows)?;
        write!(f, "  capabilities      : {:?}", self.capabilities)
    }
}
