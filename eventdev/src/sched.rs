// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Software scheduler core shared by the software device, its ports and its injectors.

use crate::adapter::{InjectError, NewEventSink};
use crate::config::QueueConf;
use crate::dev::DevStats;
use crate::event::{CtxKind, Event, EventOp, PortId, QueueId, SchedCtx, SchedType};
use crate::flow::FlowTable;
use crate::service::Service;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::trace;

/// Rings between the scheduler and one port.
#[derive(Debug)]
pub(crate) struct PortRings<P> {
    pub(crate) id: PortId,
    /// scheduler -> port, sized by the port dequeue depth
    pub(crate) to_port: ArrayQueue<Event<P>>,
    /// port -> scheduler, sized by the port enqueue depth
    pub(crate) from_port: ArrayQueue<Event<P>>,
    /// ordered contexts which ended without a forward
    pub(crate) releases: ArrayQueue<(QueueId, u64)>,
}

impl<P> PortRings<P> {
    pub(crate) fn new(id: PortId, dequeue_depth: u16, enqueue_depth: u16) -> Self {
        Self {
            id,
            to_port: ArrayQueue::new(usize::from(dequeue_depth.max(1))),
            from_port: ArrayQueue::new(usize::from(enqueue_depth.max(1))),
            releases: ArrayQueue::new(usize::from(dequeue_depth.max(1))),
        }
    }
}

#[derive(Debug)]
enum RobSlot<P> {
    Pending,
    Done(Option<Event<P>>),
}

#[derive(Debug)]
struct QueueState<P> {
    conf: Option<QueueConf>,
    links: Vec<PortId>,
    iq: VecDeque<Event<P>>,
    next_seq: u64,
    rob: BTreeMap<u64, RobSlot<P>>,
    rr: usize,
}

impl<P> QueueState<P> {
    fn new() -> Self {
        Self {
            conf: None,
            links: Vec::new(),
            iq: VecDeque::new(),
            next_seq: 0,
            rob: BTreeMap::new(),
            rr: 0,
        }
    }

    /// Pop the events at the head of the reorder buffer whose contexts have completed.
    fn rob_drain(&mut self, out: &mut Vec<Event<P>>) {
        while let Some(entry) = self.rob.first_entry() {
            if matches!(entry.get(), RobSlot::Pending) {
                break;
            }
            if let RobSlot::Done(Some(ev)) = entry.remove() {
                out.push(ev);
            }
        }
    }
}

/// State only ever touched by whoever holds the scheduler lock.
#[derive(Debug)]
pub(crate) struct SchedState<P> {
    queues: Vec<QueueState<P>>,
    ports: Vec<Option<Arc<PortRings<P>>>>,
    /// queue indices in service order
    order: Vec<usize>,
}

/// Device state shared by the device handle, its ports, injectors and scheduling service.
#[derive(Debug)]
pub(crate) struct Shared<P> {
    pub(crate) nb_queues: u8,
    pub(crate) flows: Box<[FlowTable]>,
    pub(crate) new_events: ArrayQueue<Event<P>>,
    pub(crate) inflight: AtomicU32,
    pub(crate) events_limit: u32,
    pub(crate) running: AtomicBool,
    pub(crate) accepting: AtomicBool,
    pub(crate) distributed: bool,
    pub(crate) stats: DevStats,
    pub(crate) sched: Mutex<SchedState<P>>,
}

impl<P> Shared<P> {
    pub(crate) fn new(
        nb_queues: u8,
        nb_ports: u8,
        nb_flows: u32,
        events_limit: u32,
        distributed: bool,
    ) -> Self {
        Self {
            nb_queues,
            flows: (0..nb_queues).map(|_| FlowTable::new(nb_flows)).collect(),
            new_events: ArrayQueue::new(events_limit.max(1) as usize),
            inflight: AtomicU32::new(0),
            events_limit,
            running: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            distributed,
            stats: DevStats::default(),
            sched: Mutex::new(SchedState {
                queues: (0..nb_queues).map(|_| QueueState::new()).collect(),
                ports: (0..nb_ports).map(|_| None).collect(),
                order: Vec::new(),
            }),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Account for one more event in flight if below `threshold`.
    pub(crate) fn admit(&self, threshold: u32) -> bool {
        let limit = threshold.min(self.events_limit);
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// An event left the device.
    pub(crate) fn retire(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "in flight event count underflow");
    }

    /// Run one scheduling pass if nobody else is; used for distributed scheduling.
    pub(crate) fn try_schedule(&self) -> usize {
        match self.sched.try_lock() {
            Some(mut state) => state.run(self),
            None => 0,
        }
    }

    pub(crate) fn schedule(&self) -> usize {
        self.sched.lock().run(self)
    }
}

impl<P: Send> NewEventSink<P> for Shared<P> {
    fn inject(&self, mut event: Event<P>, threshold: u32) -> Result<(), InjectError<P>> {
        if !self.is_running() || !self.accepting.load(Ordering::Acquire) {
            return Err(InjectError::Closed(event.payload));
        }
        if !self.admit(threshold) {
            self.stats.refused.fetch_add(1, Ordering::Relaxed);
            return Err(InjectError::Backpressure(event.payload));
        }
        event.op = EventOp::New;
        event.ctx = None;
        match self.new_events.push(event) {
            Ok(()) => {
                self.stats.new_events.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                self.retire();
                self.stats.refused.fetch_add(1, Ordering::Relaxed);
                Err(InjectError::Backpressure(event.payload))
            }
        }
    }
}

impl<P> SchedState<P> {
    pub(crate) fn set_queue(&mut self, queue: QueueId, conf: QueueConf) {
        self.queues[queue.as_usize()].conf = Some(conf);
    }

    pub(crate) fn queue_conf(&self, queue: QueueId) -> Option<&QueueConf> {
        self.queues[queue.as_usize()].conf.as_ref()
    }

    pub(crate) fn set_port(&mut self, rings: Arc<PortRings<P>>) {
        let idx = usize::from(rings.id.as_u8());
        self.ports[idx] = Some(rings);
    }

    pub(crate) fn port(&self, port: PortId) -> Option<&Arc<PortRings<P>>> {
        self.ports[usize::from(port.as_u8())].as_ref()
    }

    pub(crate) fn links(&self, queue: QueueId) -> &[PortId] {
        &self.queues[queue.as_usize()].links
    }

    pub(crate) fn link(&mut self, queue: QueueId, port: PortId) -> bool {
        let links = &mut self.queues[queue.as_usize()].links;
        if links.contains(&port) {
            false
        } else {
            links.push(port);
            true
        }
    }

    /// Freeze the service order of the queues; called on device start.
    pub(crate) fn seal(&mut self) {
        let mut order: Vec<usize> = (0..self.queues.len())
            .filter(|&q| self.queues[q].conf.is_some())
            .collect();
        order.sort_by_key(|&q| {
            self.queues[q]
                .conf
                .as_ref()
                .map_or(u8::MAX, |conf| conf.priority)
        });
        self.order = order;
    }

    /// One scheduling pass. Returns the amount of work done.
    pub(crate) fn run(&mut self, shared: &Shared<P>) -> usize {
        if !shared.is_running() {
            return 0;
        }
        let mut work = 0;

        while let Some(event) = shared.new_events.pop() {
            work += 1;
            self.push_iq(event, shared);
        }

        let ports = std::mem::take(&mut self.ports);
        for rings in ports.iter().flatten() {
            while let Some(event) = rings.from_port.pop() {
                work += 1;
                self.accept(event, shared);
            }
            while let Some((queue, seq)) = rings.releases.pop() {
                work += 1;
                if let Some(slot) = self.queues[queue.as_usize()].rob.get_mut(&seq) {
                    *slot = RobSlot::Done(None);
                }
            }
        }
        self.ports = ports;

        let mut released = Vec::new();
        for queue in &mut self.queues {
            queue.rob_drain(&mut released);
        }
        for event in released {
            self.push_iq(event, shared);
        }

        let order = std::mem::take(&mut self.order);
        for &queue in &order {
            work += self.schedule_queue(queue, shared);
        }
        self.order = order;
        work
    }

    fn accept(&mut self, event: Event<P>, shared: &Shared<P>) {
        if event.op == EventOp::Forward
            && let Some(SchedCtx {
                queue,
                kind: CtxKind::Ordered { seq },
                ..
            }) = event.ctx
            && let Some(slot) = self.queues[queue.as_usize()].rob.get_mut(&seq)
        {
            *slot = RobSlot::Done(Some(event));
            return;
        }
        self.push_iq(event, shared);
    }

    fn push_iq(&mut self, mut event: Event<P>, shared: &Shared<P>) {
        event.ctx = None;
        match self.queues.get_mut(event.queue_id.as_usize()) {
            Some(queue) if queue.conf.is_some() => queue.iq.push_back(event),
            _ => {
                trace!(queue = %event.queue_id, "dropping event for unknown queue");
                shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                shared.retire();
            }
        }
    }

    fn schedule_queue(&mut self, q: usize, shared: &Shared<P>) -> usize {
        let ports = &self.ports;
        let queue = &mut self.queues[q];
        let Some(conf) = queue.conf.as_ref() else {
            return 0;
        };
        if queue.links.is_empty() || queue.iq.is_empty() {
            return 0;
        }
        let kind = conf.kind;
        let nb_flows = conf.nb_atomic_flows;
        let max_sequences = conf.nb_atomic_order_sequences.max(1) as usize;
        #[allow(clippy::cast_possible_truncation)]
        let queue_id = QueueId(q as u8);
        let flows = &shared.flows[q];

        let mut kept = VecDeque::new();
        let mut blocked: Vec<u32> = Vec::new();
        let mut placed = 0;

        while let Some(mut event) = queue.iq.pop_front() {
            let (target, slot) = match kind.effective(event.sched_type) {
                SchedType::Atomic => {
                    let slot = flows.slot_of(event.flow_id, nb_flows);
                    if blocked.contains(&slot) {
                        kept.push_back(event);
                        continue;
                    }
                    let target = queue.place_atomic(&mut event, slot, ports, flows, queue_id);
                    if target.is_none() {
                        blocked.push(slot);
                    }
                    (target, Some(slot))
                }
                sched => {
                    let ordered = sched == SchedType::Ordered;
                    let target =
                        queue.place_spread(&mut event, ordered, max_sequences, ports, queue_id);
                    (target, None)
                }
            };
            let Some(port) = target else {
                kept.push_back(event);
                continue;
            };
            match queue.deliver(event, port, slot, ports, flows) {
                Ok(()) => placed += 1,
                Err(event) => kept.push_back(event),
            }
        }
        queue.iq = kept;
        shared
            .stats
            .scheduled
            .fetch_add(placed as u64, Ordering::Relaxed);
        placed
    }
}

/// Least loaded linked port with room, round-robin on ties.
fn pick_port<P>(
    ports: &[Option<Arc<PortRings<P>>>],
    links: &[PortId],
    rr: usize,
) -> Option<PortId> {
    let n = links.len();
    (0..n)
        .map(|i| links[(rr + i) % n])
        .filter_map(|port| {
            let rings = ports[usize::from(port.as_u8())].as_ref()?;
            (!rings.to_port.is_full()).then(|| (rings.to_port.len(), port))
        })
        .min_by_key(|(load, _)| *load)
        .map(|(_, port)| port)
}

impl<P> QueueState<P> {
    /// Bind an atomic event to the port owning its flow, or to a linked port with room
    /// when the flow is idle. `None` while the owner has no room.
    fn place_atomic(
        &self,
        event: &mut Event<P>,
        slot: u32,
        ports: &[Option<Arc<PortRings<P>>>],
        flows: &FlowTable,
        queue: QueueId,
    ) -> Option<PortId> {
        let port = flows
            .owner(slot)
            .or_else(|| pick_port(ports, &self.links, self.rr))?;
        let rings = ports[usize::from(port.as_u8())].as_ref()?;
        if rings.to_port.is_full() {
            return None;
        }
        let owner = flows.acquire(slot, port);
        debug_assert_eq!(owner, port);
        event.ctx = Some(SchedCtx {
            port: owner,
            queue,
            kind: CtxKind::Atomic { slot },
            held: SchedCtx::UNHELD,
        });
        Some(owner)
    }

    /// Bind an ordered or parallel event to the least loaded linked port. An ordered event
    /// also takes the next sequence number, if the reorder buffer has room for it.
    fn place_spread(
        &mut self,
        event: &mut Event<P>,
        ordered: bool,
        max_sequences: usize,
        ports: &[Option<Arc<PortRings<P>>>],
        queue: QueueId,
    ) -> Option<PortId> {
        if ordered && self.rob.len() >= max_sequences {
            return None;
        }
        let port = pick_port(ports, &self.links, self.rr)?;
        let kind = if ordered {
            let seq = self.next_seq;
            self.next_seq += 1;
            self.rob.insert(seq, RobSlot::Pending);
            CtxKind::Ordered { seq }
        } else {
            CtxKind::Parallel
        };
        event.ctx = Some(SchedCtx {
            port,
            queue,
            kind,
            held: SchedCtx::UNHELD,
        });
        Some(port)
    }

    /// Push a placed event to its port, undoing the placement if the ring refuses it.
    fn deliver(
        &mut self,
        event: Event<P>,
        port: PortId,
        slot: Option<u32>,
        ports: &[Option<Arc<PortRings<P>>>],
        flows: &FlowTable,
    ) -> Result<(), Event<P>> {
        let pushed = match ports[usize::from(port.as_u8())].as_ref() {
            Some(rings) => rings.to_port.push(event),
            None => Err(event),
        };
        match pushed {
            Ok(()) => {
                self.rr = self.rr.wrapping_add(1);
                Ok(())
            }
            Err(mut event) => {
                // only the scheduler fills this ring, so this is not expected
                if let Some(slot) = slot {
                    flows.release(slot, port);
                }
                if let Some(SchedCtx {
                    kind: CtxKind::Ordered { seq },
                    ..
                }) = event.ctx.take()
                {
                    self.rob.remove(&seq);
                }
                Err(event)
            }
        }
    }
}

/// Scheduling task of a software device without distributed scheduling.
pub(crate) struct SchedulerService<P> {
    pub(crate) name: String,
    pub(crate) shared: Arc<Shared<P>>,
}

impl<P: Send> Service for SchedulerService<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> usize {
        self.shared.schedule()
    }
}
