// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow contexts of an atomic-capable queue.
//!
//! Each slot packs `(owner port, held count)` in a single `AtomicU64`.
//! The scheduler acquires a slot for a port when it hands the port an atomic event;
//! the port releases the slot when its scheduling context ends.
//! While the held count is non-zero the flow is pinned to its owner.

use crate::event::{FlowId, PortId};
use std::sync::atomic::{AtomicU64, Ordering};

const FREE: u32 = u32::MAX;

#[inline]
fn pack(owner: u32, held: u32) -> u64 {
    (u64::from(owner) << 32) | u64::from(held)
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn unpack(raw: u64) -> (u32, u32) {
    ((raw >> 32) as u32, raw as u32)
}

#[derive(Debug)]
pub(crate) struct FlowTable {
    slots: Box<[AtomicU64]>,
}

impl FlowTable {
    pub(crate) fn new(nb_flows: u32) -> Self {
        let slots = (0..nb_flows.max(1))
            .map(|_| AtomicU64::new(pack(FREE, 0)))
            .collect();
        Self { slots }
    }

    /// Slot of `flow` on a queue using the first `nb_flows` slots of the table.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn slot_of(&self, flow: FlowId, nb_flows: u32) -> u32 {
        // slots.len() came from a u32
        flow.as_u32() % nb_flows.clamp(1, self.slots.len() as u32)
    }

    /// The port a flow slot is pinned to, if any.
    pub(crate) fn owner(&self, slot: u32) -> Option<PortId> {
        let (owner, held) = unpack(self.slots[slot as usize].load(Ordering::Acquire));
        if held == 0 {
            None
        } else {
            Self::port(owner)
        }
    }

    /// Take one more reference on `slot`, pinning it to `candidate` if it is free.
    ///
    /// Returns the port the slot is pinned to after the call.
    pub(crate) fn acquire(&self, slot: u32, candidate: PortId) -> PortId {
        let prev = self.slots[slot as usize]
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let (owner, held) = unpack(raw);
                if held == 0 {
                    Some(pack(u32::from(candidate.as_u8()), 1))
                } else {
                    Some(pack(owner, held + 1))
                }
            })
            .unwrap_or_else(|raw| raw);
        let (owner, held) = unpack(prev);
        if held == 0 {
            candidate
        } else {
            Self::port(owner).unwrap_or(candidate)
        }
    }

    /// Drop one reference on `slot` held by `port`; the slot is freed when the count hits zero.
    pub(crate) fn release(&self, slot: u32, port: PortId) {
        let res =
            self.slots[slot as usize].fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                let (owner, held) = unpack(raw);
                if held == 0 || owner != u32::from(port.as_u8()) {
                    return None;
                }
                if held == 1 {
                    Some(pack(FREE, 0))
                } else {
                    Some(pack(owner, held - 1))
                }
            });
        debug_assert!(
            res.is_ok(),
            "port {port} released flow slot {slot} it does not hold"
        );
    }

    #[cfg(test)]
    pub(crate) fn held(&self, slot: u32) -> u32 {
        unpack(self.slots[slot as usize].load(Ordering::Acquire)).1
    }

    #[allow(clippy::cast_possible_truncation)]
    fn port(owner: u32) -> Option<PortId> {
        if owner == FREE {
            None
        } else {
            Some(PortId(owner as u8))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn acquire_pins_until_last_release() {
        let table = FlowTable::new(16);
        let slot = table.slot_of(FlowId(35), 16);
        assert_eq!(slot, 3);
        assert_eq!(table.owner(slot), None);

        assert_eq!(table.acquire(slot, PortId(1)), PortId(1));
        // a pinned flow keeps its owner whatever the candidate
        assert_eq!(table.acquire(slot, PortId(2)), PortId(1));
        assert_eq!(table.held(slot), 2);

        table.release(slot, PortId(1));
        assert_eq!(table.owner(slot), Some(PortId(1)));
        table.release(slot, PortId(1));
        assert_eq!(table.owner(slot), None);

        assert_eq!(table.acquire(slot, PortId(2)), PortId(2));
    }

    #[test]
    fn held_slot_keeps_a_single_owner() {
        const SLOTS: u32 = 4;
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|ops: Vec<(bool, u8, u8)>| {
                let table = FlowTable::new(SLOTS);
                // (owner, references) per slot
                let mut model = [(PortId(0), 0u32); SLOTS as usize];
                for (acquire, slot, port) in ops {
                    let slot = u32::from(slot) % SLOTS;
                    let entry = &mut model[slot as usize];
                    if acquire {
                        let candidate = PortId(port % 8);
                        if entry.1 == 0 {
                            entry.0 = candidate;
                        }
                        assert_eq!(table.acquire(slot, candidate), entry.0);
                        entry.1 += 1;
                    } else if entry.1 > 0 {
                        table.release(slot, entry.0);
                        entry.1 -= 1;
                    }
                    assert_eq!(table.held(slot), entry.1);
                    assert_eq!(table.owner(slot), (entry.1 > 0).then_some(entry.0));
                }
            });
    }

    #[test]
    fn concurrent_release_never_loses_a_pin() {
        const ROUNDS: u32 = 100_000;
        let table = Arc::new(FlowTable::new(1));
        let (send, recv) = std::sync::mpsc::sync_channel::<PortId>(64);
        let releaser = {
            let table = table.clone();
            std::thread::spawn(move || {
                for port in recv {
                    table.release(0, port);
                }
            })
        };
        for round in 0..ROUNDS {
            #[allow(clippy::cast_possible_truncation)]
            let candidate = PortId((round % 4) as u8);
            let owner = table.acquire(0, candidate);
            // whoever owns the slot, the new reference belongs to that owner
            send.send(owner).unwrap();
        }
        drop(send);
        releaser.join().unwrap();
        assert_eq!(table.held(0), 0);
        assert_eq!(table.owner(0), None);
    }
}
