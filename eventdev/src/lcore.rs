// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Logical cores: named threads standing in for pinned cores.

use core::fmt::Display;
use std::cell::Cell;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{debug, info};

#[repr(transparent)]
#[derive(Copy, Clone, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct LCoreId(pub u32);

thread_local! {
    static CURRENT: Cell<Option<LCoreId>> = const { Cell::new(None) };
}

pub mod err {
    #[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
    pub enum LCoreIdError {
        #[error("illegal lcore id: {0} (too large)")]
        IllegalId(u32),
        #[error("invalid lcore id '{0}'")]
        NotANumber(String),
        #[error("invalid lcore range {0}-{1}")]
        BadRange(u32, u32),
        #[error("empty lcore list")]
        Empty,
    }
}

use err::LCoreIdError;

impl LCoreId {
    pub const MAX: u32 = 128;

    pub fn new(id: u32) -> Result<LCoreId, LCoreIdError> {
        if id >= Self::MAX {
            Err(LCoreIdError::IllegalId(id))
        } else {
            Ok(LCoreId(id))
        }
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// The lcore the calling thread was launched on, if any.
    #[must_use]
    pub fn current() -> Option<LCoreId> {
        CURRENT.with(Cell::get)
    }

    fn enter(self) {
        CURRENT.with(|c| c.set(Some(self)));
    }
}

impl Display for LCoreId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LCoreId {
    type Err = LCoreIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<u32>()
            .map_err(|_| LCoreIdError::NotANumber(s.to_string()))?;
        LCoreId::new(id)
    }
}

/// An ordered set of lcores, written as a list of ids and ranges: `1,3-5`.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct LCoreSet(BTreeSet<LCoreId>);

impl LCoreSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn contains(&self, lcore: LCoreId) -> bool {
        self.0.contains(&lcore)
    }

    pub fn iter(&self) -> impl Iterator<Item = LCoreId> + '_ {
        self.0.iter().copied()
    }

    pub fn insert(&mut self, lcore: LCoreId) -> bool {
        self.0.insert(lcore)
    }

    #[must_use]
    pub fn is_disjoint(&self, other: &LCoreSet) -> bool {
        self.0.is_disjoint(&other.0)
    }
}

impl FromIterator<LCoreId> for LCoreSet {
    fn from_iter<T: IntoIterator<Item = LCoreId>>(iter: T) -> Self {
        LCoreSet(iter.into_iter().collect())
    }
}

impl FromStr for LCoreSet {
    type Err = LCoreIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut set = BTreeSet::new();
        for item in s.split(',').map(str::trim) {
            if item.is_empty() {
                return Err(LCoreIdError::Empty);
            }
            match item.split_once('-') {
                Some((lo, hi)) => {
                    let lo: LCoreId = lo.parse()?;
                    let hi: LCoreId = hi.parse()?;
                    if lo > hi {
                        return Err(LCoreIdError::BadRange(lo.0, hi.0));
                    }
                    set.extend((lo.0..=hi.0).map(LCoreId));
                }
                None => {
                    set.insert(item.parse()?);
                }
            }
        }
        Ok(LCoreSet(set))
    }
}

impl Display for LCoreSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let ids: Vec<u32> = self.iter().map(|l| l.0).collect();
        let mut first = true;
        let mut i = 0;
        while i < ids.len() {
            let mut j = i;
            while j + 1 < ids.len() && ids[j + 1] == ids[j] + 1 {
                j += 1;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if j > i {
                write!(f, "{}-{}", ids[i], ids[j])?;
            } else {
                write!(f, "{}", ids[i])?;
            }
            i = j + 1;
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for LCoreSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// TODO: expose the lcore stack size through the command line
const STACK_SIZE: usize = 8 << 20;

#[derive(Debug, thiserror::Error)]
pub enum WorkerThreadLaunchError {
    #[error("unable to spawn thread for lcore {0}: {1}")]
    Spawn(LCoreId, std::io::Error),
}

/// A thread running a single task on an lcore.
#[derive(Debug)]
pub struct WorkerThread {
    lcore_id: LCoreId,
    handle: std::thread::JoinHandle<()>,
}

impl WorkerThread {
    /// Launch `f` on a thread named after `lcore`.
    #[cold]
    #[tracing::instrument(level = "debug", skip(f))]
    pub fn launch<T: Send + FnOnce() + 'static>(
        lcore: LCoreId,
        f: T,
    ) -> Result<WorkerThread, WorkerThreadLaunchError> {
        Self::spawn(format!("lcore-{lcore}"), lcore, f)
    }

    pub(crate) fn spawn<T: Send + FnOnce() + 'static>(
        name: String,
        lcore: LCoreId,
        f: T,
    ) -> Result<WorkerThread, WorkerThreadLaunchError> {
        let handle = std::thread::Builder::new()
            .name(name)
            .stack_size(STACK_SIZE)
            .spawn(move || {
                lcore.enter();
                debug!("thread entered lcore {lcore}");
                f();
            })
            .map_err(|e| WorkerThreadLaunchError::Spawn(lcore, e))?;
        Ok(WorkerThread {
            lcore_id: lcore,
            handle,
        })
    }

    #[must_use]
    pub fn lcore_id(&self) -> LCoreId {
        self.lcore_id
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn join(self) -> std::thread::Result<()> {
        info!("joining worker thread on lcore {}", self.lcore_id);
        let res = self.handle.join();
        info!("joined worker thread on lcore {}", self.lcore_id);
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_lcore_list() {
        let set: LCoreSet = "1,3-5, 9".parse().unwrap();
        let ids: Vec<u32> = set.iter().map(|l| l.as_u32()).collect();
        assert_eq!(ids, vec![1, 3, 4, 5, 9]);
        assert_eq!(set.to_string(), "1,3-5,9");
        assert_eq!("5-3".parse::<LCoreSet>(), Err(LCoreIdError::BadRange(5, 3)));
        assert_eq!("1,,2".parse::<LCoreSet>(), Err(LCoreIdError::Empty));
        assert_eq!("x".parse::<LCoreSet>(), Err(LCoreIdError::NotANumber("x".into())));
        assert_eq!("200".parse::<LCoreSet>(), Err(LCoreIdError::IllegalId(200)));
    }

    #[test]
    fn lcore_set_display_parses_back() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|ids: Vec<u8>| {
                let set: LCoreSet = ids
                    .iter()
                    .map(|&id| LCoreId(u32::from(id) % LCoreId::MAX))
                    .collect();
                if set.is_empty() {
                    return;
                }
                let back: LCoreSet = set.to_string().parse().unwrap();
                assert_eq!(back, set);
            });
    }

    #[test]
    fn worker_thread_knows_its_lcore() {
        assert_eq!(LCoreId::current(), None);
        let (send, recv) = std::sync::mpsc::channel();
        let worker = WorkerThread::launch(LCoreId(7), move || {
            let name = std::thread::current().name().map(str::to_string);
            send.send((LCoreId::current(), name)).unwrap();
        })
        .unwrap();
        assert_eq!(worker.lcore_id(), LCoreId(7));
        worker.join().unwrap();
        let (lcore, name) = recv.recv().unwrap();
        assert_eq!(lcore, Some(LCoreId(7)));
        assert_eq!(name.as_deref(), Some("lcore-7"));
    }
}
