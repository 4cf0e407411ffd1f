// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The worker task: dequeue, process, route.

use crate::error::PipelineError;
use crate::stage::{StageHandler, Verdict};
use crate::stats::{WorkerCounters, bump};
use crate::topology::TopologyPlan;
use crossbeam_utils::Backoff;
use eventdev::port::EventPort;
use eventdev::tx::{Transmit, TransmitError};
use eventdev::{Event, EventOp, SchedType};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Pause before the first retry; doubled for every further retry.
pub(crate) const RETRY_PAUSE: Duration = Duration::from_micros(100);
pub(crate) const MAX_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Spin, then yield, for `RETRY_PAUSE * 2^attempt` (at most `MAX_RETRY_PAUSE`) before retry
/// number `attempt`, counted from 0.
pub(crate) fn retry_pause(attempt: u32) {
    let pause = RETRY_PAUSE.saturating_mul(1 << attempt.min(16));
    let deadline = Instant::now() + pause.min(MAX_RETRY_PAUSE);
    let backoff = Backoff::new();
    while Instant::now() < deadline {
        backoff.snooze();
    }
}

/// Enqueue every event of `batch`, retrying refusals up to `retries` times.
///
/// On failure the refused events are left in `batch`, still held by `port`.
pub(crate) fn enqueue_with_retry<P, E: EventPort<P> + ?Sized>(
    port: &mut E,
    batch: &mut Vec<Event<P>>,
    retries: u32,
) -> Result<usize, PipelineError> {
    let mut accepted = port.enqueue_burst(batch);
    let mut attempt = 0;
    while !batch.is_empty() && attempt < retries {
        retry_pause(attempt);
        accepted += port.enqueue_burst(batch);
        attempt += 1;
    }
    if batch.is_empty() {
        Ok(accepted)
    } else {
        Err(PipelineError::ResourceExhausted {
            port: port.id(),
            pending: batch.len(),
            retries,
        })
    }
}

/// Transmit every event of `batch`, retrying the unsent ones up to `retries` times.
///
/// Returns the number of events sent; on failure the unsent events are left in `batch`.
pub(crate) fn transmit_with_retry<P>(
    tx: &mut dyn Transmit<P>,
    batch: &mut Vec<Event<P>>,
    retries: u32,
) -> (usize, Result<(), TransmitError>) {
    let (mut sent, mut result) = tx.transmit(batch);
    let mut attempt = 0;
    while result.is_err() && !batch.is_empty() && attempt < retries {
        retry_pause(attempt);
        let (n, r) = tx.transmit(batch);
        sent += n;
        result = r;
        attempt += 1;
    }
    if batch.is_empty() {
        result = Ok(());
    }
    (sent, result)
}

/// Where a worker sends final events.
pub(crate) enum Sink<P> {
    /// Enqueue onto the transmit service's single-link queue.
    TxQueue(eventdev::QueueId),
    /// Transmit directly through a handle owned by this worker.
    Direct(Box<dyn Transmit<P>>),
}

/// Worker loop parameters.
#[derive(Debug, Copy, Clone)]
pub(crate) struct WorkerParams {
    pub(crate) dequeue_depth: usize,
    pub(crate) deq_polls: u32,
    pub(crate) retries: u32,
}

pub(crate) struct Worker<P, E> {
    id: usize,
    port: E,
    plan: Arc<TopologyPlan>,
    handler: Box<dyn StageHandler<P>>,
    sink: Sink<P>,
    params: WorkerParams,
    counters: Arc<WorkerCounters>,
    stop: Arc<AtomicBool>,
}

impl<P, E: EventPort<P>> Worker<P, E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        port: E,
        plan: Arc<TopologyPlan>,
        handler: Box<dyn StageHandler<P>>,
        sink: Sink<P>,
        params: WorkerParams,
        counters: Arc<WorkerCounters>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            port,
            plan,
            handler,
            sink,
            params,
            counters,
            stop,
        }
    }

    /// Run until the stop flag is raised.
    pub(crate) fn run(mut self) {
        info!(worker = self.id, port = %self.port.id(), "Worker started");
        let depth = self.params.dequeue_depth.max(1);
        let mut events = Vec::with_capacity(depth);
        let mut forward = Vec::with_capacity(depth);
        let mut finals = Vec::with_capacity(depth);
        while !self.stop.load(Ordering::Relaxed) {
            let n = self
                .port
                .dequeue_burst(&mut events, depth, self.params.deq_polls);
            if n == 0 {
                continue;
            }
            bump(&self.counters.dequeued, n);
            self.process(&mut events, &mut forward, &mut finals);
            self.handler.flush();
            self.forward(&mut forward);
            self.finish(&mut finals);
        }
        self.port.release_all();
        info!(worker = self.id, "Worker exited");
    }

    fn process(
        &mut self,
        events: &mut Vec<Event<P>>,
        forward: &mut Vec<Event<P>>,
        finals: &mut Vec<Event<P>>,
    ) {
        let last = self.plan.last_stage();
        for mut event in events.drain(..) {
            match self.handler.process(event.stage, &mut event) {
                Verdict::Drop => {
                    self.port.release(event);
                    bump(&self.counters.handler_drops, 1);
                }
                Verdict::Done => finals.push(event),
                Verdict::Next if event.stage >= last => finals.push(event),
                Verdict::Next => {
                    let next = eventdev::StageId(event.stage.as_u8() + 1);
                    event.queue_id = self.plan.next_queue(event.queue_id, next);
                    event.sched_type = self.plan.sched_type(next);
                    event.stage = next;
                    event.op = EventOp::Forward;
                    forward.push(event);
                }
            }
        }
    }

    fn forward(&mut self, forward: &mut Vec<Event<P>>) {
        if forward.is_empty() {
            return;
        }
        let total = forward.len();
        match enqueue_with_retry(&mut self.port, forward, self.params.retries) {
            Ok(n) => bump(&self.counters.forwarded, n),
            Err(e) => {
                trace!(worker = self.id, "{e}");
                bump(&self.counters.forwarded, total - forward.len());
                bump(&self.counters.enqueue_drops, forward.len());
                for event in forward.drain(..) {
                    self.port.release(event);
                }
            }
        }
    }

    fn finish(&mut self, finals: &mut Vec<Event<P>>) {
        if finals.is_empty() {
            return;
        }
        match &mut self.sink {
            Sink::TxQueue(queue) => {
                for event in finals.iter_mut() {
                    event.queue_id = *queue;
                    event.sched_type = SchedType::Atomic;
                    event.op = EventOp::Forward;
                }
                let total = finals.len();
                match enqueue_with_retry(&mut self.port, finals, self.params.retries) {
                    Ok(n) => bump(&self.counters.to_tx_service, n),
                    Err(e) => {
                        trace!(worker = self.id, "{e}");
                        bump(&self.counters.to_tx_service, total - finals.len());
                        bump(&self.counters.enqueue_drops, finals.len());
                        for event in finals.drain(..) {
                            self.port.release(event);
                        }
                    }
                }
            }
            Sink::Direct(tx) => {
                let (sent, result) = transmit_with_retry(tx.as_mut(), finals, self.params.retries);
                bump(&self.counters.transmitted, sent);
                if let Err(e) = result {
                    trace!(worker = self.id, "transmit: {e}");
                    bump(&self.counters.tx_drops, finals.len());
                    for event in finals.drain(..) {
                        self.port.release(event);
                    }
                }
            }
        }
    }
}
