// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-stage processing hook run by the workers.

use eventdev::{Event, StageId};

/// What to do with an event after a stage processed it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Move on to the next stage; past the last stage the event is final.
    Next,
    /// Skip the remaining stages and transmit.
    Done,
    /// Consume the event without transmitting it.
    Drop,
}

/// The opaque per-stage processing logic.
///
/// Each worker owns its own handler, built by the factory passed to
/// [`crate::Pipeline::launch_workers`].
pub trait StageHandler<P>: Send {
    fn process(&mut self, stage: StageId, event: &mut Event<P>) -> Verdict;

    /// Called once per dequeued burst, after every event of the burst was routed.
    fn flush(&mut self) {}
}

/// Builds one [`StageHandler`] per worker.
pub type HandlerFactory<P> =
    std::sync::Arc<dyn Send + Sync + Fn(usize) -> Box<dyn StageHandler<P>>>;

impl<P> StageHandler<P> for Box<dyn StageHandler<P>> {
    fn process(&mut self, stage: StageId, event: &mut Event<P>) -> Verdict {
        (**self).process(stage, event)
    }

    fn flush(&mut self) {
        (**self).flush();
    }
}
