// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! In-memory collaborators: a synthetic receive adapter, a recording transmit path and two
//! stage handlers.

use crate::stage::{StageHandler, Verdict};
use crossbeam_utils::Backoff;
use eventdev::adapter::{AdapterError, InjectError, Injector, RxAdapter, SourceId};
use eventdev::lcore::LCoreId;
use eventdev::tx::{Transmit, TransmitError, TxPath};
use eventdev::{Event, FlowId, QueueId, SchedType, StageId};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// The payload generated by [`SyntheticRx`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Packet {
    pub source: SourceId,
    /// Position of the packet in its source's sequence.
    pub seq: u64,
}

/// A receive adapter generating packets on one thread per bound source.
///
/// The flow of a packet is derived from its source: source `s` spreads its packets round
/// robin over flows `s * flows_per_source ..`.
pub struct SyntheticRx {
    nb_pkts: u64,
    flows_per_source: u32,
    bound: Vec<(SourceId, Injector<Packet>)>,
    stop: Arc<AtomicBool>,
    generated: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

impl SyntheticRx {
    pub const DEFAULT_FLOWS_PER_SOURCE: u32 = 16;

    /// A generator of `nb_pkts` packets per source; unlimited when zero.
    #[must_use]
    pub fn new(nb_pkts: u64) -> Self {
        Self {
            nb_pkts,
            flows_per_source: Self::DEFAULT_FLOWS_PER_SOURCE,
            bound: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            generated: Arc::new(AtomicU64::new(0)),
            threads: Vec::new(),
        }
    }

    #[must_use]
    pub fn flows_per_source(mut self, flows: u32) -> Self {
        self.flows_per_source = flows.max(1);
        self
    }

    /// Packets injected so far, across sources.
    #[must_use]
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    fn generate(
        source: SourceId,
        injector: &Injector<Packet>,
        nb_pkts: u64,
        flows: u32,
        stop: &AtomicBool,
        generated: &AtomicU64,
    ) {
        let backoff = Backoff::new();
        let base = u32::from(source.as_u16()).wrapping_mul(flows);
        let mut seq = 0;
        'generate: while nb_pkts == 0 || seq < nb_pkts {
            #[allow(clippy::cast_possible_truncation)]
            let flow = FlowId(base.wrapping_add((seq % u64::from(flows)) as u32));
            let mut packet = Packet { source, seq };
            loop {
                if stop.load(Ordering::Relaxed) {
                    break 'generate;
                }
                match injector.inject(flow, packet) {
                    Ok(()) => break,
                    Err(InjectError::Backpressure(p)) => {
                        packet = p;
                        backoff.snooze();
                    }
                    Err(InjectError::Closed(_)) => break 'generate,
                }
            }
            backoff.reset();
            generated.fetch_add(1, Ordering::Relaxed);
            seq += 1;
        }
        debug!("source {source} generated {seq} packets");
    }
}

impl RxAdapter<Packet> for SyntheticRx {
    fn bind(
        &mut self,
        queue: QueueId,
        source: SourceId,
        injector: Injector<Packet>,
    ) -> Result<(), AdapterError> {
        if !self.threads.is_empty() {
            return Err(AdapterError::AlreadyStarted);
        }
        if self.bound.iter().any(|(s, _)| *s == source) {
            return Err(AdapterError::AlreadyBound(source));
        }
        debug!("source {source} bound to queue {queue}");
        self.bound.push((source, injector));
        Ok(())
    }

    fn start(&mut self) -> Result<(), AdapterError> {
        if self.bound.is_empty() {
            return Err(AdapterError::NothingBound);
        }
        if !self.threads.is_empty() {
            return Err(AdapterError::AlreadyStarted);
        }
        self.stop.store(false, Ordering::Release);
        for (source, injector) in &self.bound {
            let source = *source;
            let injector = injector.clone();
            let (nb_pkts, flows) = (self.nb_pkts, self.flows_per_source);
            let stop = self.stop.clone();
            let generated = self.generated.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rx-{source}"))
                .spawn(move || {
                    Self::generate(source, &injector, nb_pkts, flows, &stop, &generated);
                })
                .map_err(|e| AdapterError::Thread(e.to_string()))?;
            self.threads.push(handle);
        }
        info!("synthetic receive started on {} sources", self.threads.len());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AdapterError> {
        self.stop.store(true, Ordering::Release);
        let mut res = Ok(());
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                res = Err(AdapterError::Thread("receive thread panicked".to_string()));
            }
        }
        res
    }
}

impl Drop for SyntheticRx {
    fn drop(&mut self) {
        let _ = RxAdapter::stop(self);
    }
}

#[derive(Debug, Default)]
struct TxRecord {
    mt_safe: bool,
    sent: AtomicU64,
    calls: AtomicU64,
    in_call: AtomicBool,
    concurrent_calls: AtomicU64,
    callers: Mutex<BTreeSet<String>>,
    lcores: Mutex<BTreeSet<LCoreId>>,
}

/// A transmit path that consumes events and records who called it.
#[derive(Debug, Clone)]
pub struct RecordingTx {
    record: Arc<TxRecord>,
}

impl RecordingTx {
    /// A path that declares itself safe (or not) for concurrent transmit.
    #[must_use]
    pub fn new(mt_safe: bool) -> Self {
        Self {
            record: Arc::new(TxRecord {
                mt_safe,
                ..TxRecord::default()
            }),
        }
    }

    #[must_use]
    pub fn sent(&self) -> u64 {
        self.record.sent.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.record.calls.load(Ordering::Relaxed)
    }

    /// Calls which overlapped another call in progress.
    #[must_use]
    pub fn concurrent_calls(&self) -> u64 {
        self.record.concurrent_calls.load(Ordering::Relaxed)
    }

    /// Names of the threads which called the path.
    #[must_use]
    pub fn callers(&self) -> BTreeSet<String> {
        self.record.callers.lock().clone()
    }

    /// Lcores of the threads which called the path.
    #[must_use]
    pub fn lcores(&self) -> BTreeSet<LCoreId> {
        self.record.lcores.lock().clone()
    }
}

struct RecordingHandle(Arc<TxRecord>);

impl<P> Transmit<P> for RecordingHandle {
    fn transmit(&mut self, batch: &mut Vec<Event<P>>) -> (usize, Result<(), TransmitError>) {
        let record = &self.0;
        if record.in_call.swap(true, Ordering::AcqRel) {
            record.concurrent_calls.fetch_add(1, Ordering::Relaxed);
            if !record.mt_safe {
                warn!("concurrent call to a transmit path which is not MT safe");
            }
        }
        record.calls.fetch_add(1, Ordering::Relaxed);
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("unnamed");
        {
            let mut callers = record.callers.lock();
            if !callers.contains(name) {
                callers.insert(name.to_string());
            }
        }
        if let Some(lcore) = LCoreId::current() {
            record.lcores.lock().insert(lcore);
        }
        let n = batch.len();
        batch.clear();
        record.sent.fetch_add(n as u64, Ordering::Relaxed);
        record.in_call.store(false, Ordering::Release);
        (n, Ok(()))
    }
}

impl<P> TxPath<P> for RecordingTx {
    fn mt_safe(&self) -> bool {
        self.record.mt_safe
    }

    fn handle(&self) -> Box<dyn Transmit<P>> {
        Box::new(RecordingHandle(self.record.clone()))
    }
}

/// Moves every event on to its next stage.
#[derive(Debug, Default, Copy, Clone)]
pub struct Forwarder;

impl<P> StageHandler<P> for Forwarder {
    fn process(&mut self, _: StageId, _: &mut Event<P>) -> Verdict {
        Verdict::Next
    }
}

/// Flows currently marked by the [`FlowTracker`]s sharing it, with their worker.
#[derive(Debug, Default)]
pub struct FlowTable {
    owners: Mutex<HashMap<FlowId, usize>>,
    violations: AtomicU64,
    checked: AtomicU64,
}

impl FlowTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomic events seen while another worker had their flow in hand.
    #[must_use]
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    /// Atomic events checked.
    #[must_use]
    pub fn checked(&self) -> u64 {
        self.checked.load(Ordering::Relaxed)
    }
}

/// Forwards every event, checking that no two workers process events of one atomic flow at
/// the same time.
///
/// A flow is marked when one of its atomic events is processed and unmarked when the
/// burst is flushed.
#[derive(Debug)]
pub struct FlowTracker {
    worker: usize,
    table: Arc<FlowTable>,
    marked: Vec<FlowId>,
}

impl FlowTracker {
    #[must_use]
    pub fn new(worker: usize, table: Arc<FlowTable>) -> Self {
        Self {
            worker,
            table,
            marked: Vec::new(),
        }
    }
}

impl<P> StageHandler<P> for FlowTracker {
    fn process(&mut self, _: StageId, event: &mut Event<P>) -> Verdict {
        if event.sched_type != SchedType::Atomic {
            return Verdict::Next;
        }
        self.table.checked.fetch_add(1, Ordering::Relaxed);
        let mut owners = self.table.owners.lock();
        let owner = *owners.entry(event.flow_id).or_insert(self.worker);
        if owner == self.worker {
            self.marked.push(event.flow_id);
        } else {
            self.table.violations.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = self.worker,
                "flow {} held by worker {owner} too", event.flow_id
            );
        }
        Verdict::Next
    }

    fn flush(&mut self) {
        let mut owners = self.table.owners.lock();
        for flow in self.marked.drain(..) {
            if owners.get(&flow) == Some(&self.worker) {
                owners.remove(&flow);
            }
        }
    }
}
