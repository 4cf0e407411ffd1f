// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Events and the identifiers they carry.

use core::fmt::Display;

macro_rules! index_newtype {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $as_fn:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(pub $inner);

        impl $name {
            #[must_use]
            pub const fn $as_fn(self) -> $inner {
                self.0
            }

            #[must_use]
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> $name {
                $name(value)
            }
        }

        impl From<$name> for $inner {
            fn from(value: $name) -> $inner {
                value.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

index_newtype!(
    /// Index of an event queue within a device.
    QueueId,
    u8,
    as_u8
);
index_newtype!(
    /// Index of an event port within a device.
    PortId,
    u8,
    as_u8
);
index_newtype!(
    /// Identifier of the flow an event belongs to.
    ///
    /// Flows are never materialized: the device hashes the identifier into one of the
    /// flow contexts of the queue the event is scheduled from.
    FlowId,
    u32,
    as_u32
);
index_newtype!(
    /// Pipeline stage an event is currently targeted at.
    StageId,
    u8,
    as_u8
);

impl StageId {
    /// The stage every received event starts at.
    pub const FIRST: StageId = StageId(0);
}

/// Scheduling type requested for a single event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, strum::Display, strum::EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum SchedType {
    /// At most one port holds events of a given flow at any time.
    #[default]
    Atomic,
    /// Events may be processed concurrently but are restored to arrival order on re-enqueue.
    Ordered,
    /// No ordering and no per-flow exclusivity.
    Parallel,
}

/// What an enqueued event means to the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum EventOp {
    /// A new event entering the device; subject to admission control.
    #[default]
    New,
    /// An event previously dequeued from this port, sent on to its next queue.
    Forward,
    /// Release of the scheduling context of a held event without forwarding it.
    Release,
}

/// The unit of scheduling.
#[derive(Debug)]
pub struct Event<P> {
    pub flow_id: FlowId,
    pub queue_id: QueueId,
    pub stage: StageId,
    pub sched_type: SchedType,
    pub op: EventOp,
    pub payload: P,
    pub(crate) ctx: Option<SchedCtx>,
}

impl<P> Event<P> {
    /// Create a new event targeted at the first stage of `queue_id`.
    #[must_use]
    pub fn new(flow_id: FlowId, queue_id: QueueId, sched_type: SchedType, payload: P) -> Self {
        Self {
            flow_id,
            queue_id,
            stage: StageId::FIRST,
            sched_type,
            op: EventOp::New,
            payload,
            ctx: None,
        }
    }

    /// True if the event was handed out by a port and still carries its scheduling context.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.ctx.is_some()
    }

    /// Consume the event, returning its payload.
    ///
    /// The scheduling context (if any) is released with the port's next dequeue.
    #[must_use]
    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Scheduling context stamped on an event when it is scheduled to a port.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SchedCtx {
    pub(crate) port: PortId,
    pub(crate) queue: QueueId,
    pub(crate) kind: CtxKind,
    /// Slot in the owning port's held list, assigned on dequeue.
    pub(crate) held: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CtxKind {
    Atomic { slot: u32 },
    Ordered { seq: u64 },
    Parallel,
}

impl SchedCtx {
    pub(crate) const UNHELD: u32 = u32::MAX;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn sched_type_names() {
        assert_eq!(SchedType::from_str("atomic").unwrap(), SchedType::Atomic);
        assert_eq!(SchedType::from_str("ordered").unwrap(), SchedType::Ordered);
        assert_eq!(SchedType::Parallel.to_string(), "parallel");
        assert!(SchedType::from_str("fifo").is_err());
    }

    #[test]
    fn new_event_starts_at_first_stage() {
        let ev = Event::new(FlowId(7), QueueId(1), SchedType::Atomic, ());
        assert_eq!(ev.stage, StageId::FIRST);
        assert_eq!(ev.op, EventOp::New);
        assert!(!ev.is_held());
    }
}
