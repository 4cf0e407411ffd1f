// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pipeline counters.
//!
//! Tasks bump their own counters with relaxed atomics; [`Stats`] is the aggregate returned by
//! [`crate::Pipeline::stop_and_drain`].

use eventdev::PortId;
use eventdev::dev::DevStatsSnapshot;
use eventdev::lcore::LCoreId;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

pub const WORKER_DEQUEUED: &str = "evpipe_worker_dequeued";
pub const WORKER_FORWARDED: &str = "evpipe_worker_forwarded";
pub const WORKER_TRANSMITTED: &str = "evpipe_worker_transmitted";
pub const WORKER_DROPPED: &str = "evpipe_worker_dropped";
pub const TX_SERVICE_TRANSMITTED: &str = "evpipe_tx_service_transmitted";
pub const TX_SERVICE_DROPPED: &str = "evpipe_tx_service_dropped";
pub const UNDRAINED: &str = "evpipe_undrained_events";

/// Counters of one worker task.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub dequeued: AtomicU64,
    /// Events re-enqueued to their next stage.
    pub forwarded: AtomicU64,
    /// Final events handed to the transmit service queue.
    pub to_tx_service: AtomicU64,
    /// Final events transmitted directly.
    pub transmitted: AtomicU64,
    /// Events dropped after the enqueue retries ran out.
    pub enqueue_drops: AtomicU64,
    /// Events dropped after the transmit retries ran out.
    pub tx_drops: AtomicU64,
    /// Events consumed by a stage handler.
    pub handler_drops: AtomicU64,
}

/// Counters of the transmit service task.
#[derive(Debug, Default)]
pub struct TxServiceCounters {
    pub dequeued: AtomicU64,
    pub transmitted: AtomicU64,
    pub tx_drops: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: usize) {
    counter.fetch_add(n as u64, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub lcore: LCoreId,
    pub port: PortId,
    pub dequeued: u64,
    pub forwarded: u64,
    pub to_tx_service: u64,
    pub transmitted: u64,
    pub enqueue_drops: u64,
    pub tx_drops: u64,
    pub handler_drops: u64,
}

impl WorkerStats {
    pub(crate) fn new(lcore: LCoreId, port: PortId, c: &WorkerCounters) -> Self {
        Self {
            lcore,
            port,
            dequeued: c.dequeued.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            to_tx_service: c.to_tx_service.load(Ordering::Relaxed),
            transmitted: c.transmitted.load(Ordering::Relaxed),
            enqueue_drops: c.enqueue_drops.load(Ordering::Relaxed),
            tx_drops: c.tx_drops.load(Ordering::Relaxed),
            handler_drops: c.handler_drops.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn drops(&self) -> u64 {
        self.enqueue_drops + self.tx_drops
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TxServiceStats {
    pub port: PortId,
    pub dequeued: u64,
    pub transmitted: u64,
    pub tx_drops: u64,
}

impl TxServiceStats {
    pub(crate) fn new(port: PortId, c: &TxServiceCounters) -> Self {
        Self {
            port,
            dequeued: c.dequeued.load(Ordering::Relaxed),
            transmitted: c.transmitted.load(Ordering::Relaxed),
            tx_drops: c.tx_drops.load(Ordering::Relaxed),
        }
    }
}

/// Aggregated statistics of a pipeline run.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Stats {
    pub workers: Vec<WorkerStats>,
    pub tx_service: Option<TxServiceStats>,
    pub device: DevStatsSnapshot,
    /// Events still in flight when the drain gave up.
    pub undrained: u32,
}

impl Stats {
    /// Events that left the pipeline through the transmit path.
    #[must_use]
    pub fn transmitted(&self) -> u64 {
        self.workers.iter().map(|w| w.transmitted).sum::<u64>()
            + self.tx_service.as_ref().map_or(0, |t| t.transmitted)
    }

    /// Events dropped after bounded retries, anywhere in the pipeline.
    #[must_use]
    pub fn drops(&self) -> u64 {
        self.workers.iter().map(WorkerStats::drops).sum::<u64>()
            + self.tx_service.as_ref().map_or(0, |t| t.tx_drops)
    }

    /// Publish the statistics to the installed `metrics` recorder.
    pub fn publish(&self) {
        describe_counter!(WORKER_DEQUEUED, "Events dequeued by a worker");
        describe_counter!(WORKER_FORWARDED, "Events forwarded to their next stage");
        describe_counter!(WORKER_TRANSMITTED, "Events transmitted by a worker");
        describe_counter!(WORKER_DROPPED, "Events dropped by a worker after retries");
        describe_counter!(TX_SERVICE_TRANSMITTED, "Events transmitted by the tx service");
        describe_counter!(TX_SERVICE_DROPPED, "Events dropped by the transmit service");
        describe_gauge!(UNDRAINED, "Events left in flight after the drain");

        for w in &self.workers {
            let lcore = w.lcore.to_string();
            counter!(WORKER_DEQUEUED, "lcore" => lcore.clone()).increment(w.dequeued);
            counter!(WORKER_FORWARDED, "lcore" => lcore.clone()).increment(w.forwarded);
            counter!(WORKER_TRANSMITTED, "lcore" => lcore.clone()).increment(w.transmitted);
            counter!(WORKER_DROPPED, "lcore" => lcore).increment(w.drops());
        }
        if let Some(tx) = &self.tx_service {
            counter!(TX_SERVICE_TRANSMITTED).increment(tx.transmitted);
            counter!(TX_SERVICE_DROPPED).increment(tx.tx_drops);
        }
        gauge!(UNDRAINED).set(f64::from(self.undrained));
    }

    /// Log the totals of every task and of the whole run.
    pub fn log_summary(&self) {
        for w in &self.workers {
            info!(
                lcore = %w.lcore,
                port = %w.port,
                dequeued = w.dequeued,
                forwarded = w.forwarded,
                to_tx_service = w.to_tx_service,
                transmitted = w.transmitted,
                drops = w.drops(),
                handler_drops = w.handler_drops,
                "worker totals"
            );
        }
        if let Some(tx) = &self.tx_service {
            info!(
                port = %tx.port,
                dequeued = tx.dequeued,
                transmitted = tx.transmitted,
                drops = tx.tx_drops,
                "transmit service totals"
            );
        }
        info!(
            new_events = self.device.new_events,
            transmitted = self.transmitted(),
            drops = self.drops(),
            undrained = self.undrained,
            "pipeline totals"
        );
    }
}
