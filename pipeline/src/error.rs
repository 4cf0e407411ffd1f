// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pipeline error taxonomy.

use eventdev::DevError;
use eventdev::{PortId, QueueId};
use eventdev::adapter::AdapterError;
use eventdev::lcore::{LCoreId, WorkerThreadLaunchError};
use eventdev::service::ServiceError;

/// Invalid or over-capacity configuration, detected before the device is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no receive sources configured")]
    NoSources,
    #[error("no worker lcores configured")]
    NoWorkers,
    #[error("no pipeline stages configured")]
    NoStages,
    #[error("{requested} pipeline stages requested, at most {max} supported")]
    TooManyStages { requested: usize, max: usize },
    #[error("the flow bound must not be zero")]
    NoFlows,
    #[error("worker dequeue depth must not be zero")]
    ZeroDequeueDepth,
    #[error("lcore {0} is both a worker and a service lcore")]
    SharedLCore(LCoreId),
    #[error("too many event queues: planned {requested}, device supports {available}")]
    TooManyQueues { requested: usize, available: usize },
    #[error("too many event ports: planned {requested}, device supports {available}")]
    TooManyPorts { requested: usize, available: usize },
    #[error("too many flows per queue: requested {requested}, device supports {available}")]
    TooManyFlows { requested: u32, available: u32 },
    #[error(
        "queue {queue}: {requested} order sequences requested, device supports {available} events"
    )]
    TooManyOrderSequences {
        queue: QueueId,
        requested: u32,
        available: u32,
    },
    #[error("worker dequeue depth {requested} exceeds device maximum {available}")]
    DequeueDepth { requested: u16, available: u16 },
    #[error("event device '{driver}' cannot carry all scheduling types on one queue")]
    NoAllTypesQueues { driver: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A port refused events even after the bounded retries.
    #[error("port {port}: {pending} events still refused after {retries} retries")]
    ResourceExhausted {
        port: PortId,
        pending: usize,
        retries: u32,
    },
    #[error("event device fault: {0}")]
    DeviceFault(#[from] DevError),
    #[error("setup of queue {queue} failed: {source}")]
    QueueSetup {
        queue: QueueId,
        #[source]
        source: DevError,
    },
    #[error("setup of port {port} failed: {source}")]
    PortSetup {
        port: PortId,
        #[source]
        source: DevError,
    },
    #[error("linking port {port} failed: {source}")]
    PortLink {
        port: PortId,
        #[source]
        source: DevError,
    },
    #[error("no service lcore available to run the {0}")]
    NoServiceCore(&'static str),
    #[error(transparent)]
    Service(ServiceError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Launch(#[from] WorkerThreadLaunchError),
    #[error("worker on lcore {0} panicked")]
    WorkerPanicked(LCoreId),
    #[error("operation requires pipeline state {expected}, pipeline is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

impl From<ServiceError> for PipelineError {
    fn from(value: ServiceError) -> Self {
        match value {
            ServiceError::NoServiceCore => PipelineError::NoServiceCore("service"),
            other => PipelineError::Service(other),
        }
    }
}

/// Lifecycle steps, in execution order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Step {
    OptionCheck,
    Plan,
    CapabilityCheck,
    Configure,
    Start,
    ActivateService,
    LaunchWorkers,
    Drain,
    Stop,
    Destroy,
}

/// A lifecycle failure, naming the step that failed.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed: {error}")]
pub struct LifecycleError {
    pub step: Step,
    #[source]
    pub error: PipelineError,
}

impl LifecycleError {
    #[must_use]
    pub fn new(step: Step, error: impl Into<PipelineError>) -> Self {
        Self {
            step,
            error: error.into(),
        }
    }
}

/// Attach a [`Step`] to the error of a fallible lifecycle operation.
pub(crate) trait AtStep<T> {
    fn at(self, step: Step) -> Result<T, LifecycleError>;
}

impl<T, E: Into<PipelineError>> AtStep<T> for Result<T, E> {
    fn at(self, step: Step) -> Result<T, LifecycleError> {
        self.map_err(|e| LifecycleError::new(step, e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle_error_names_step_and_resource() {
        let err: Result<(), ConfigError> = Err(ConfigError::TooManyQueues {
            requested: 9,
            available: 8,
        });
        let err = err.at(Step::CapabilityCheck).unwrap_err();
        assert_eq!(
            err.to_string(),
            "capability_check failed: too many event queues: planned 9, device supports 8"
        );
    }

    #[test]
    fn missing_service_core_is_its_own_error() {
        let err = PipelineError::from(ServiceError::NoServiceCore);
        assert!(matches!(err, PipelineError::NoServiceCore(_)));
    }
}
