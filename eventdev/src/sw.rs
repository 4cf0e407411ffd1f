// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Software event device.
//!
//! Scheduling is centralized: a single scheduling pass moves new and forwarded events into
//! per-queue input queues, and from there into the rings of linked ports.
//! Without [`DevCapabilities::DISTRIBUTED_SCHED`] the pass is run by the service returned from
//! [`EventDevice::scheduler_service`]; with it every port dequeue tries to run a pass.

use crate::adapter::{Injector, NewEventSink};
use crate::config::{DevConfig, PortConf, QueueConf, QueueKind};
use crate::dev::{DevError, DevState, DevStatsSnapshot, EventDevice};
use crate::event::{CtxKind, Event, EventOp, PortId, QueueId, SchedCtx};
use crate::info::{DevCapabilities, DevInfo};
use crate::port::{EnqueueError, EnqueueErrorKind, EventPort};
use crate::sched::{PortRings, SchedulerService, Shared};
use crate::service::Service;
use crossbeam_utils::Backoff;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Limits of the software device unless told otherwise.
#[must_use]
pub fn default_info() -> DevInfo {
    DevInfo {
        driver_name: "event_sw",
        max_event_queues: 64,
        max_event_ports: 64,
        max_num_events: 4096,
        max_event_port_dequeue_depth: 128,
        max_event_port_enqueue_depth: 128,
        max_event_queue_flows: 1024,
        capabilities: DevCapabilities::QUEUE_ALL_TYPES | DevCapabilities::BURST_MODE,
    }
}

pub struct SwEventDev<P> {
    info: DevInfo,
    state: DevState,
    config: Option<DevConfig>,
    shared: Option<Arc<Shared<P>>>,
    port_confs: Vec<Option<PortConf>>,
    taken: Vec<bool>,
}

impl<P> core::fmt::Debug for SwEventDev<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SwEventDev")
            .field("driver", &self.info.driver_name)
            .field("state", &self.state)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<P> Default for SwEventDev<P> {
    fn default() -> Self {
        Self::with_info(default_info())
    }
}

impl<P> SwEventDev<P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A software device advertising `info`; its scheduling mode follows the
    /// `DISTRIBUTED_SCHED` capability.
    #[must_use]
    pub fn with_info(info: DevInfo) -> Self {
        Self {
            info,
            state: DevState::Unconfigured,
            config: None,
            shared: None,
            port_confs: Vec::new(),
            taken: Vec::new(),
        }
    }

    fn expect_state(&self, expected: DevState) -> Result<(), DevError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DevError::InvalidState {
                expected,
                actual: self.state,
            })
        }
    }

    fn configured(&self) -> Result<(&DevConfig, &Arc<Shared<P>>), DevError> {
        match (&self.config, &self.shared) {
            (Some(config), Some(shared)) => Ok((config, shared)),
            _ => Err(DevError::InvalidState {
                expected: DevState::Configured,
                actual: self.state,
            }),
        }
    }

    fn check_queue(&self, queue: QueueId) -> Result<(), DevError> {
        let (config, _) = self.configured()?;
        if queue.as_u8() >= config.nb_event_queues {
            return Err(DevError::QueueOutOfRange {
                queue,
                configured: config.nb_event_queues,
            });
        }
        Ok(())
    }

    fn check_port(&self, port: PortId) -> Result<(), DevError> {
        let (config, _) = self.configured()?;
        if port.as_u8() >= config.nb_event_ports {
            return Err(DevError::PortOutOfRange {
                port,
                configured: config.nb_event_ports,
            });
        }
        Ok(())
    }
}

fn check_limit(what: &'static str, requested: u32, max: u32) -> Result<(), DevError> {
    if requested == 0 {
        Err(DevError::Zero(what))
    } else if requested > max {
        Err(DevError::ExceedsLimit {
            what,
            requested,
            max,
        })
    } else {
        Ok(())
    }
}

impl<P: Send + 'static> EventDevice<P> for SwEventDev<P> {
    type Port = SwPort<P>;

    fn info(&self) -> DevInfo {
        self.info.clone()
    }

    fn state(&self) -> DevState {
        self.state
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn configure(&mut self, config: &DevConfig) -> Result<(), DevError> {
        match self.state {
            DevState::Unconfigured | DevState::Stopped => {}
            DevState::Configured if !self.taken.contains(&true) => {}
            actual => {
                return Err(DevError::InvalidState {
                    expected: DevState::Unconfigured,
                    actual,
                });
            }
        }
        config.validate(&self.info)?;
        self.shared = Some(Arc::new(Shared::new(
            config.nb_event_queues,
            config.nb_event_ports,
            config.nb_event_queue_flows,
            config.nb_events_limit,
            self.info.has_distributed_sched(),
        )));
        self.port_confs = vec![None; usize::from(config.nb_event_ports)];
        self.taken = vec![false; usize::from(config.nb_event_ports)];
        self.config = Some(config.clone());
        self.state = DevState::Configured;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn queue_setup(&mut self, queue: QueueId, conf: &QueueConf) -> Result<(), DevError> {
        self.expect_state(DevState::Configured)?;
        self.check_queue(queue)?;
        let (config, shared) = self.configured()?;
        if conf.kind == QueueKind::AllTypes && !self.info.has_all_types_queues() {
            return Err(DevError::UnsupportedQueueKind(conf.kind));
        }
        if conf.kind != QueueKind::SingleLink {
            check_limit(
                "queue flows",
                conf.nb_atomic_flows,
                config.nb_event_queue_flows,
            )?;
            check_limit(
                "queue order sequences",
                conf.nb_atomic_order_sequences,
                config.nb_events_limit,
            )?;
        }
        shared.sched.lock().set_queue(queue, conf.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn port_setup(&mut self, port: PortId, conf: &PortConf) -> Result<(), DevError> {
        self.expect_state(DevState::Configured)?;
        self.check_port(port)?;
        if self.taken[usize::from(port.as_u8())] {
            return Err(DevError::PortTaken(port));
        }
        let (config, shared) = self.configured()?;
        check_limit(
            "port dequeue depth",
            u32::from(conf.dequeue_depth),
            u32::from(config.nb_event_port_dequeue_depth),
        )?;
        check_limit(
            "port enqueue depth",
            u32::from(conf.enqueue_depth),
            u32::from(config.nb_event_port_enqueue_depth),
        )?;
        check_limit(
            "new event threshold",
            conf.new_event_threshold,
            config.nb_events_limit,
        )?;
        let rings = Arc::new(PortRings::new(port, conf.dequeue_depth, conf.enqueue_depth));
        shared.sched.lock().set_port(rings);
        self.port_confs[usize::from(port.as_u8())] = Some(conf.clone());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn port_link(&mut self, port: PortId, queues: &[QueueId]) -> Result<usize, DevError> {
        self.expect_state(DevState::Configured)?;
        self.check_port(port)?;
        for &queue in queues {
            self.check_queue(queue)?;
        }
        let (_, shared) = self.configured()?;
        let mut sched = shared.sched.lock();
        if sched.port(port).is_none() {
            return Err(DevError::PortNotSetUp(port));
        }
        for &queue in queues {
            let Some(conf) = sched.queue_conf(queue) else {
                return Err(DevError::QueueNotSetUp(queue));
            };
            if conf.kind == QueueKind::SingleLink
                && let Some(&linked) = sched.links(queue).iter().find(|&&p| p != port)
            {
                return Err(DevError::SingleLinkTaken { queue, linked });
            }
        }
        for &queue in queues {
            if sched.link(queue, port) {
                debug!("port {port} linked to queue {queue}");
            }
        }
        Ok(queues.len())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn take_port(&mut self, port: PortId) -> Result<SwPort<P>, DevError> {
        if !matches!(self.state, DevState::Configured | DevState::Started) {
            return Err(DevError::InvalidState {
                expected: DevState::Configured,
                actual: self.state,
            });
        }
        self.check_port(port)?;
        let idx = usize::from(port.as_u8());
        let Some(conf) = self.port_confs[idx].clone() else {
            return Err(DevError::PortNotSetUp(port));
        };
        if self.taken[idx] {
            return Err(DevError::PortTaken(port));
        }
        let (_, shared) = self.configured()?;
        let rings = shared
            .sched
            .lock()
            .port(port)
            .cloned()
            .ok_or(DevError::PortNotSetUp(port))?;
        let port = SwPort {
            id: port,
            shared: shared.clone(),
            rings,
            conf,
            held: Vec::new(),
            pending: VecDeque::new(),
        };
        self.taken[idx] = true;
        Ok(port)
    }

    fn injector(&self, queue: QueueId, new_event_threshold: u32) -> Result<Injector<P>, DevError> {
        self.check_queue(queue)?;
        let (config, shared) = self.configured()?;
        if shared.sched.lock().queue_conf(queue).is_none() {
            return Err(DevError::QueueNotSetUp(queue));
        }
        check_limit(
            "new event threshold",
            new_event_threshold,
            config.nb_events_limit,
        )?;
        let sink: Arc<dyn NewEventSink<P>> = shared.clone();
        Ok(Injector::new(queue, new_event_threshold, sink))
    }

    fn scheduler_service(&self) -> Result<Option<Box<dyn Service>>, DevError> {
        let (_, shared) = self.configured()?;
        if shared.distributed {
            return Ok(None);
        }
        Ok(Some(Box::new(SchedulerService {
            name: format!("{}-scheduler", self.info.driver_name),
            shared: shared.clone(),
        })))
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn start(&mut self) -> Result<(), DevError> {
        if !matches!(self.state, DevState::Configured | DevState::Stopped) {
            return Err(DevError::InvalidState {
                expected: DevState::Configured,
                actual: self.state,
            });
        }
        let (config, shared) = self.configured()?;
        {
            let mut sched = shared.sched.lock();
            for queue in (0..config.nb_event_queues).map(QueueId) {
                if sched.queue_conf(queue).is_none() {
                    return Err(DevError::QueueNotSetUp(queue));
                }
            }
            for port in (0..config.nb_event_ports).map(PortId) {
                if sched.port(port).is_none() {
                    return Err(DevError::PortNotSetUp(port));
                }
            }
            sched.seal();
        }
        shared.accepting.store(true, Ordering::Release);
        shared.running.store(true, Ordering::Release);
        info!(
            "event device '{}' started: {} queues, {} ports",
            self.info.driver_name, config.nb_event_queues, config.nb_event_ports
        );
        self.state = DevState::Started;
        Ok(())
    }

    fn stop_new_events(&self) {
        if let Some(shared) = &self.shared {
            shared.accepting.store(false, Ordering::Release);
        }
    }

    fn inflight(&self) -> u32 {
        self.shared
            .as_ref()
            .map_or(0, |shared| shared.inflight.load(Ordering::Acquire))
    }

    fn stats(&self) -> DevStatsSnapshot {
        self.shared
            .as_ref()
            .map(|shared| shared.stats.snapshot())
            .unwrap_or_default()
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn stop(&mut self) -> Result<(), DevError> {
        self.expect_state(DevState::Started)?;
        if let Some(shared) = &self.shared {
            shared.accepting.store(false, Ordering::Release);
            shared.running.store(false, Ordering::Release);
        }
        self.state = DevState::Stopped;
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    fn close(&mut self) -> Result<(), DevError> {
        if self.state == DevState::Started {
            return Err(DevError::InvalidState {
                expected: DevState::Stopped,
                actual: self.state,
            });
        }
        self.shared = None;
        self.config = None;
        self.state = DevState::Closed;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum HeldState {
    Held,
    Forwarded,
    Released,
}

#[derive(Debug)]
struct Held {
    ctx: SchedCtx,
    state: HeldState,
}

/// A port of a [`SwEventDev`].
#[derive(Debug)]
pub struct SwPort<P> {
    id: PortId,
    shared: Arc<Shared<P>>,
    rings: Arc<PortRings<P>>,
    conf: PortConf,
    held: Vec<Held>,
    /// ordered releases not yet accepted by the scheduler
    pending: VecDeque<(QueueId, u64)>,
}

impl<P> SwPort<P> {
    #[must_use]
    pub fn conf(&self) -> &PortConf {
        &self.conf
    }

    /// Number of scheduling contexts this port still holds.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held
            .iter()
            .filter(|h| h.state != HeldState::Released)
            .count()
    }

    fn flush_pending(&mut self) {
        while let Some(release) = self.pending.pop_front() {
            if let Err(release) = self.rings.releases.push(release) {
                self.pending.push_front(release);
                break;
            }
        }
    }

    /// With distributed scheduling nobody else may drain a full ring: run a pass first.
    fn push_from_port(&self, event: Event<P>) -> Result<(), Event<P>> {
        match self.rings.from_port.push(event) {
            Err(event) if self.shared.distributed => {
                self.shared.try_schedule();
                self.rings.from_port.push(event)
            }
            other => other,
        }
    }

    fn held_index(&self, event: &Event<P>) -> Option<usize> {
        let ctx = event.ctx?;
        if ctx.port != self.id {
            return None;
        }
        let idx = ctx.held as usize;
        let held = self.held.get(idx)?;
        (held.state == HeldState::Held && held.ctx.kind == ctx.kind && held.ctx.queue == ctx.queue)
            .then_some(idx)
    }

    fn end_context(&mut self, idx: usize) {
        let Held { ctx, state } = self.held[idx];
        match ctx.kind {
            CtxKind::Atomic { slot } => {
                self.shared.flows[ctx.queue.as_usize()].release(slot, self.id);
            }
            CtxKind::Ordered { seq } if state == HeldState::Held => {
                self.pending.push_back((ctx.queue, seq));
            }
            CtxKind::Ordered { .. } | CtxKind::Parallel => {}
        }
        if state == HeldState::Held {
            self.shared.retire();
            self.shared.stats.released.fetch_add(1, Ordering::Relaxed);
        }
        self.held[idx].state = HeldState::Released;
    }

    fn release_contexts(&mut self) {
        for idx in 0..self.held.len() {
            if self.held[idx].state != HeldState::Released {
                self.end_context(idx);
            }
        }
        self.held.clear();
        self.flush_pending();
    }
}

impl<P: Send> EventPort<P> for SwPort<P> {
    fn id(&self) -> PortId {
        self.id
    }

    fn dequeue_burst(&mut self, out: &mut Vec<Event<P>>, max: usize, poll_budget: u32) -> usize {
        self.release_contexts();
        if !self.shared.is_running() || max == 0 {
            return 0;
        }
        let backoff = Backoff::new();
        let mut polls = 0;
        loop {
            if self.shared.distributed {
                self.shared.try_schedule();
            }
            let mut n = 0;
            while n < max {
                let Some(mut event) = self.rings.to_port.pop() else {
                    break;
                };
                if let Some(ctx) = event.ctx.as_mut() {
                    #[allow(clippy::cast_possible_truncation)]
                    let idx = self.held.len() as u32;
                    ctx.held = idx;
                    self.held.push(Held {
                        ctx: *ctx,
                        state: HeldState::Held,
                    });
                }
                out.push(event);
                n += 1;
            }
            if n > 0 || polls >= poll_budget {
                return n;
            }
            polls += 1;
            backoff.snooze();
        }
    }

    fn enqueue(&mut self, mut event: Event<P>) -> Result<(), EnqueueError<P>> {
        self.flush_pending();
        if !self.shared.is_running() {
            return Err(EnqueueError::new(EnqueueErrorKind::Stopped, event));
        }
        if event.op == EventOp::Release {
            self.release(event);
            return Ok(());
        }
        if event.queue_id.as_u8() >= self.shared.nb_queues {
            return Err(EnqueueError::new(EnqueueErrorKind::InvalidQueue, event));
        }
        if event.op == EventOp::Forward
            && let Some(idx) = self.held_index(&event)
        {
            return match self.push_from_port(event) {
                Ok(()) => {
                    self.held[idx].state = HeldState::Forwarded;
                    self.shared.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                }
                Err(event) => Err(EnqueueError::new(EnqueueErrorKind::Full, event)),
            };
        }
        // anything else enters the device as a new event
        event.op = EventOp::New;
        event.ctx = None;
        if self.rings.from_port.is_full() {
            return Err(EnqueueError::new(EnqueueErrorKind::Full, event));
        }
        if !self.shared.admit(self.conf.new_event_threshold) {
            self.shared.stats.refused.fetch_add(1, Ordering::Relaxed);
            return Err(EnqueueError::new(EnqueueErrorKind::Backpressure, event));
        }
        match self.push_from_port(event) {
            Ok(()) => {
                self.shared.stats.new_events.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                self.shared.retire();
                Err(EnqueueError::new(EnqueueErrorKind::Full, event))
            }
        }
    }

    fn release(&mut self, event: Event<P>) {
        if let Some(idx) = self.held_index(&event) {
            self.end_context(idx);
            self.flush_pending();
        }
    }

    fn release_all(&mut self) {
        self.release_contexts();
    }
}

impl<P> Drop for SwPort<P> {
    fn drop(&mut self) {
        self.release_contexts();
        let backoff = Backoff::new();
        while !self.pending.is_empty() && !backoff.is_completed() {
            backoff.snooze();
            self.flush_pending();
        }
        if !self.pending.is_empty() {
            warn!(
                "port {} dropped with {} ordered releases undelivered",
                self.id,
                self.pending.len()
            );
        }
    }
}
