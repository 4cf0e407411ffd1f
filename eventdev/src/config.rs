// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device, queue and port configuration.

use crate::dev::DevError;
use crate::event::SchedType;
use crate::info::DevInfo;

/// Device wide configuration applied by [`crate::EventDevice::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevConfig {
    pub nb_event_queues: u8,
    pub nb_event_ports: u8,
    /// Upper bound of events in flight in the device.
    pub nb_events_limit: u32,
    /// Flow contexts per atomic queue.
    pub nb_event_queue_flows: u32,
    pub nb_event_port_dequeue_depth: u16,
    pub nb_event_port_enqueue_depth: u16,
}

impl DevConfig {
    /// Check the configuration against the limits of a device.
    pub fn validate(&self, info: &DevInfo) -> Result<(), DevError> {
        fn check(what: &'static str, requested: u32, max: u32) -> Result<(), DevError> {
            if requested == 0 {
                return Err(DevError::Zero(what));
            }
            if requested > max {
                return Err(DevError::ExceedsLimit {
                    what,
                    requested,
                    max,
                });
            }
            Ok(())
        }
        check(
            "event queues",
            u32::from(self.nb_event_queues),
            u32::from(info.max_event_queues),
        )?;
        check(
            "event ports",
            u32::from(self.nb_event_ports),
            u32::from(info.max_event_ports),
        )?;
        check("events limit", self.nb_events_limit, info.max_num_events)?;
        check(
            "queue flows",
            self.nb_event_queue_flows,
            info.max_event_queue_flows,
        )?;
        check(
            "port dequeue depth",
            u32::from(self.nb_event_port_dequeue_depth),
            u32::from(info.max_event_port_dequeue_depth),
        )?;
        check(
            "port enqueue depth",
            u32::from(self.nb_event_port_enqueue_depth),
            u32::from(info.max_event_port_enqueue_depth),
        )
    }
}

/// Scheduling discipline of an event queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum QueueKind {
    /// Carries atomic, ordered and parallel events, selected per event.
    #[strum(serialize = "ALL_TYPES")]
    AllTypes,
    #[strum(serialize = "ATOMIC")]
    Atomic,
    #[strum(serialize = "ORDERED")]
    Ordered,
    #[strum(serialize = "PARALLEL")]
    Parallel,
    /// Exactly one port is linked; used to hand work to a dedicated task.
    #[strum(serialize = "SINGLE_LINK")]
    SingleLink,
}

impl QueueKind {
    /// The scheduling type an event of type `requested` actually gets on this queue.
    #[must_use]
    pub fn effective(self, requested: SchedType) -> SchedType {
        match self {
            QueueKind::AllTypes | QueueKind::SingleLink => requested,
            QueueKind::Atomic => SchedType::Atomic,
            QueueKind::Ordered => SchedType::Ordered,
            QueueKind::Parallel => SchedType::Parallel,
        }
    }
}

impl From<SchedType> for QueueKind {
    fn from(value: SchedType) -> Self {
        match value {
            SchedType::Atomic => QueueKind::Atomic,
            SchedType::Ordered => QueueKind::Ordered,
            SchedType::Parallel => QueueKind::Parallel,
        }
    }
}

/// Queue priorities; lower values are served first.
pub mod priority {
    pub const HIGHEST: u8 = 0;
    pub const NORMAL: u8 = 128;
    pub const LOWEST: u8 = 255;
}

/// Configuration of a single event queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConf {
    pub kind: QueueKind,
    pub priority: u8,
    /// Number of flow contexts tracked for atomic events on this queue.
    pub nb_atomic_flows: u32,
    /// Number of ordered events which may be outstanding on this queue.
    pub nb_atomic_order_sequences: u32,
}

impl QueueConf {
    #[must_use]
    pub fn new(kind: QueueKind, nb_flows: u32) -> Self {
        Self {
            kind,
            priority: priority::NORMAL,
            nb_atomic_flows: nb_flows,
            nb_atomic_order_sequences: nb_flows,
        }
    }
}

/// Configuration of a single event port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConf {
    /// How many events the port can hold for batched processing.
    pub dequeue_depth: u16,
    /// Outstanding enqueue budget.
    pub enqueue_depth: u16,
    /// New events are refused once this many events are in flight in the device.
    pub new_event_threshold: u32,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::info::DevCapabilities;

    fn info() -> DevInfo {
        DevInfo {
            driver_name: "test",
            max_event_queues: 4,
            max_event_ports: 4,
            max_num_events: 1024,
            max_event_port_dequeue_depth: 32,
            max_event_port_enqueue_depth: 32,
            max_event_queue_flows: 256,
            capabilities: DevCapabilities::empty(),
        }
    }

    fn config() -> DevConfig {
        DevConfig {
            nb_event_queues: 2,
            nb_event_ports: 2,
            nb_events_limit: 1024,
            nb_event_queue_flows: 256,
            nb_event_port_dequeue_depth: 32,
            nb_event_port_enqueue_depth: 32,
        }
    }

    #[test]
    fn config_within_limits_is_valid() {
        assert!(config().validate(&info()).is_ok());
    }

    #[test]
    fn config_beyond_limits_names_resource() {
        let cfg = DevConfig {
            nb_event_queues: 5,
            ..config()
        };
        match cfg.validate(&info()) {
            Err(DevError::ExceedsLimit {
                what,
                requested,
                max,
            }) => {
                assert_eq!(what, "event queues");
                assert_eq!(requested, 5);
                assert_eq!(max, 4);
            }
            other => panic!("unexpected result {other:?}"),
        }
        let cfg = DevConfig {
            nb_event_ports: 0,
            ..config()
        };
        let err = cfg.validate(&info()).unwrap_err();
        assert!(matches!(err, DevError::Zero("event ports")));
        assert_eq!(err.to_string(), "event ports must not be zero");
    }

    #[test]
    fn queue_kind_forces_sched_type() {
        assert_eq!(
            QueueKind::AllTypes.effective(SchedType::Ordered),
            SchedType::Ordered
        );
        assert_eq!(
            QueueKind::Parallel.effective(SchedType::Atomic),
            SchedType::Parallel
        );
        assert_eq!(QueueKind::SingleLink.to_string(), "SINGLE_LINK");
    }
}
