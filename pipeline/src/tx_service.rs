// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The transmit service: sole caller of a transmit path that is not safe for concurrent use.

use crate::stats::{TxServiceCounters, bump};
use crate::worker::transmit_with_retry;
use eventdev::Event;
use eventdev::port::EventPort;
use eventdev::service::Service;
use eventdev::tx::Transmit;
use std::sync::Arc;
use tracing::trace;

/// Polls per dequeue; the service loop itself provides the outer polling.
const DEQ_POLLS: u32 = 0;

pub(crate) struct TxService<P, E> {
    name: String,
    port: E,
    tx: Box<dyn Transmit<P>>,
    batch: Vec<Event<P>>,
    depth: usize,
    retries: u32,
    counters: Arc<TxServiceCounters>,
}

impl<P, E: EventPort<P>> TxService<P, E> {
    pub(crate) fn new(
        port: E,
        tx: Box<dyn Transmit<P>>,
        depth: usize,
        retries: u32,
        counters: Arc<TxServiceCounters>,
    ) -> Self {
        Self {
            name: format!("tx-service-port-{}", port.id()),
            port,
            tx,
            batch: Vec::with_capacity(depth),
            depth: depth.max(1),
            retries,
            counters,
        }
    }
}

impl<P: Send, E: EventPort<P>> Service for TxService<P, E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self) -> usize {
        let n = self.port.dequeue_burst(&mut self.batch, self.depth, DEQ_POLLS);
        if n == 0 {
            return 0;
        }
        bump(&self.counters.dequeued, n);
        let (sent, result) = transmit_with_retry(self.tx.as_mut(), &mut self.batch, self.retries);
        bump(&self.counters.transmitted, sent);
        if let Err(e) = result {
            trace!(service = %self.name, "transmit: {e}");
            bump(&self.counters.tx_drops, self.batch.len());
            for event in self.batch.drain(..) {
                self.port.release(event);
            }
        }
        n
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use eventdev::port::EnqueueError;
    use eventdev::tx::TransmitError;
    use eventdev::{FlowId, PortId, QueueId, SchedType};
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    struct QueuePort(VecDeque<Event<u32>>);

    impl EventPort<u32> for QueuePort {
        fn id(&self) -> PortId {
            PortId(2)
        }

        fn dequeue_burst(&mut self, out: &mut Vec<Event<u32>>, max: usize, _: u32) -> usize {
            let n = max.min(self.0.len());
            out.extend(self.0.drain(..n));
            n
        }

        fn enqueue(&mut self, event: Event<u32>) -> Result<(), EnqueueError<u32>> {
            self.0.push_back(event);
            Ok(())
        }

        fn release(&mut self, _: Event<u32>) {}

        fn release_all(&mut self) {}
    }

    /// Sends at most `room` events per call.
    struct SlowTx {
        room: usize,
        sent: Vec<u32>,
    }

    impl Transmit<u32> for SlowTx {
        fn transmit(&mut self, batch: &mut Vec<Event<u32>>) -> (usize, Result<(), TransmitError>) {
            let n = self.room.min(batch.len());
            self.sent.extend(batch.drain(..n).map(|e| e.payload));
            if batch.is_empty() {
                (n, Ok(()))
            } else {
                (n, Err(TransmitError::Busy))
            }
        }
    }

    fn port(n: u32) -> QueuePort {
        QueuePort(
            (0..n)
                .map(|i| Event::new(FlowId(i), QueueId(2), SchedType::Atomic, i))
                .collect(),
        )
    }

    #[test]
    fn partial_transmit_retried() {
        let counters = Arc::new(TxServiceCounters::default());
        let mut svc = TxService::new(
            port(6),
            Box::new(SlowTx {
                room: 2,
                sent: Vec::new(),
            }),
            8,
            3,
            counters.clone(),
        );
        assert_eq!(svc.name(), "tx-service-port-2");
        assert_eq!(svc.run(), 6);
        assert_eq!(svc.run(), 0);
        assert_eq!(counters.dequeued.load(Ordering::Relaxed), 6);
        assert_eq!(counters.transmitted.load(Ordering::Relaxed), 6);
        assert_eq!(counters.tx_drops.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unsent_events_dropped_after_retries() {
        let counters = Arc::new(TxServiceCounters::default());
        let mut svc = TxService::new(
            port(10),
            Box::new(SlowTx {
                room: 2,
                sent: Vec::new(),
            }),
            10,
            3,
            counters.clone(),
        );
        assert_eq!(svc.run(), 10);
        // one call plus three retries, two events each
        assert_eq!(counters.transmitted.load(Ordering::Relaxed), 8);
        assert_eq!(counters.tx_drops.load(Ordering::Relaxed), 2);
    }
}
