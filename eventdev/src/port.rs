// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Event ports: the per-thread access point to an event device.

use crate::event::{Event, PortId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueErrorKind {
    /// The port's enqueue budget is exhausted; retry after the scheduler has run.
    #[error("port enqueue ring is full")]
    Full,
    /// New event refused because too many events are in flight.
    #[error("too many events in flight")]
    Backpressure,
    #[error("destination queue does not exist")]
    InvalidQueue,
    #[error("device is not running")]
    Stopped,
}

/// A refused enqueue. The event is handed back to the caller.
#[derive(Debug)]
pub struct EnqueueError<P> {
    pub kind: EnqueueErrorKind,
    pub event: Event<P>,
}

impl<P> EnqueueError<P> {
    pub(crate) fn new(kind: EnqueueErrorKind, event: Event<P>) -> Self {
        Self { kind, event }
    }
}

/// A port of an event device.
///
/// A port is used by one thread at a time. Events dequeued from a port are *held* by it
/// until forwarded or released; every held context still open is released implicitly at
/// the next dequeue.
pub trait EventPort<P>: Send {
    fn id(&self) -> PortId;

    /// Dequeue up to `max` events, appending them to `out`.
    ///
    /// Polls at most `poll_budget` times before giving up; returns the number of events
    /// dequeued.
    fn dequeue_burst(&mut self, out: &mut Vec<Event<P>>, max: usize, poll_budget: u32) -> usize;

    /// Dequeue a single event.
    fn dequeue(&mut self, poll_budget: u32) -> Option<Event<P>> {
        let mut out = Vec::with_capacity(1);
        self.dequeue_burst(&mut out, 1, poll_budget);
        out.pop()
    }

    /// Enqueue one event; its `op` tells the device whether it is new, forwarded or released.
    fn enqueue(&mut self, event: Event<P>) -> Result<(), EnqueueError<P>>;

    /// Enqueue events from the front of `events`, stopping at the first refusal.
    ///
    /// Events accepted are removed from `events`; returns how many were accepted.
    fn enqueue_burst(&mut self, events: &mut Vec<Event<P>>) -> usize {
        let mut accepted = 0;
        let mut refused = Vec::new();
        for event in events.drain(..) {
            if !refused.is_empty() {
                refused.push(event);
                continue;
            }
            match self.enqueue(event) {
                Ok(()) => accepted += 1,
                Err(e) => refused.push(e.event),
            }
        }
        *events = refused;
        accepted
    }

    /// End the scheduling context of a held event without forwarding it.
    fn release(&mut self, event: Event<P>);

    /// End every scheduling context this port holds.
    fn release_all(&mut self);
}
