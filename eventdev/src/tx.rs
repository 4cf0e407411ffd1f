// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Transmit path abstraction.

use crate::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    #[error("transmit queue is full")]
    Busy,
    #[error("link is down")]
    LinkDown,
    #[error("transmit failed: {0}")]
    Failed(String),
}

/// A handle able to transmit finished events.
pub trait Transmit<P>: Send {
    /// Transmit events from the front of `batch`, removing those sent.
    ///
    /// Returns how many events were sent, and an error if the batch was cut short.
    fn transmit(&mut self, batch: &mut Vec<Event<P>>) -> (usize, Result<(), TransmitError>);
}

/// The output side of a pipeline.
pub trait TxPath<P>: Send + Sync {
    /// True if several threads may transmit at the same time through their own handles.
    fn mt_safe(&self) -> bool;

    /// A new transmit handle.
    fn handle(&self) -> Box<dyn Transmit<P>>;
}
