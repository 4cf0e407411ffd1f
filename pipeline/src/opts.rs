// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pipeline options.

use crate::error::ConfigError;
use crate::topology::{MAX_STAGES, Topology};
use derive_builder::Builder;
use eventdev::SchedType;
use eventdev::lcore::LCoreSet;
use std::fmt::Display;
use tracing::info;

/// Options of a pipeline run. Built with [`PipelineOptsBuilder`]; every field but the
/// worker lcores has a default.
#[derive(Builder, Clone, Debug, PartialEq, serde::Serialize)]
pub struct PipelineOpts {
    #[builder(default)]
    pub topology: Topology,

    /// Number of receive sources.
    #[builder(default = 1)]
    pub nb_sources: u16,

    /// Lcores running worker tasks, one port each.
    pub worker_lcores: LCoreSet,

    /// Lcores available to service tasks (scheduler, transmit service).
    #[builder(default)]
    pub service_lcores: LCoreSet,

    /// Scheduling type of each stage; the number of stages is the length of this list.
    #[builder(setter(into), default = vec![SchedType::Atomic])]
    pub stages: Vec<SchedType>,

    /// Flow contexts per queue.
    #[builder(default = 1024)]
    pub nb_flows: u32,

    /// Worker port dequeue depth; the device maximum if unset.
    #[builder(setter(strip_option), default)]
    pub worker_dequeue_depth: Option<u16>,

    /// Events generated per receive source; unlimited when zero.
    #[builder(default)]
    pub nb_pkts: u64,

    /// Dequeue bursts of events instead of one event at a time.
    #[builder(default = true)]
    pub burst: bool,

    /// Treat the transmit path as unsafe for concurrent calls even if it claims otherwise.
    #[builder(default)]
    pub mt_unsafe: bool,

    /// Retries of a refused enqueue or transmit before the events are dropped.
    #[builder(default = 3)]
    pub enq_retries: u32,

    /// Polls per dequeue before a worker goes back to check its stop flag.
    #[builder(default = 64)]
    pub deq_polls: u32,
}

impl PipelineOpts {
    #[must_use]
    pub fn builder() -> PipelineOptsBuilder {
        PipelineOptsBuilder::default()
    }

    /// Validate the options on their own, before any device is looked at.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.nb_sources == 0 {
            return Err(ConfigError::NoSources);
        }
        if self.worker_lcores.is_empty() {
            return Err(ConfigError::NoWorkers);
        }
        if let Some(shared) = self
            .service_lcores
            .iter()
            .find(|&l| self.worker_lcores.contains(l))
        {
            return Err(ConfigError::SharedLCore(shared));
        }
        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if self.stages.len() > MAX_STAGES {
            return Err(ConfigError::TooManyStages {
                requested: self.stages.len(),
                max: MAX_STAGES,
            });
        }
        if self.nb_flows == 0 {
            return Err(ConfigError::NoFlows);
        }
        if self.worker_dequeue_depth == Some(0) {
            return Err(ConfigError::ZeroDequeueDepth);
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)] // lcore ids are bounded well below u16::MAX
    #[must_use]
    pub fn nb_workers(&self) -> u16 {
        self.worker_lcores.len() as u16
    }

    /// Log the effective options.
    pub fn dump(&self) {
        for line in self.to_string().lines() {
            info!("{line}");
        }
    }
}

impl Display for PipelineOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let stages: Vec<String> = self.stages.iter().map(ToString::to_string).collect();
        writeln!(f, "pipeline options")?;
        writeln!(f, "  topology        : {}", self.topology)?;
        writeln!(f, "  receive sources : {}", self.nb_sources)?;
        writeln!(f, "  worker lcores   : {}", self.worker_lcores)?;
        writeln!(f, "  service lcores  : {}", self.service_lcores)?;
        writeln!(f, "  stages          : {} [{}]", self.stages.len(), stages.join(","))?;
        writeln!(f, "  flows           : {}", self.nb_flows)?;
        match self.worker_dequeue_depth {
            Some(depth) => writeln!(f, "  dequeue depth   : {depth}")?,
            None => writeln!(f, "  dequeue depth   : device max")?,
        }
        writeln!(f, "  packets/source  : {}", self.nb_pkts)?;
        writeln!(f, "  burst           : {}", self.burst)?;
        writeln!(f, "  mt unsafe tx    : {}", self.mt_unsafe)?;
        write!(f, "  enqueue retries : {}", self.enq_retries)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use eventdev::lcore::LCoreId;

    fn opts() -> PipelineOptsBuilder {
        let mut b = PipelineOpts::builder();
        b.worker_lcores("1-2".parse::<LCoreSet>().unwrap())
            .service_lcores("3".parse::<LCoreSet>().unwrap());
        b
    }

    #[test]
    fn builder_defaults() {
        let opts = opts().build().unwrap();
        assert_eq!(opts.topology, Topology::AllTypesQueue);
        assert_eq!(opts.nb_sources, 1);
        assert_eq!(opts.stages, vec![SchedType::Atomic]);
        assert_eq!(opts.enq_retries, 3);
        assert!(opts.burst);
        assert_eq!(opts.nb_workers(), 2);
        assert_eq!(opts.check(), Ok(()));
    }

    #[test]
    fn worker_lcores_are_required() {
        assert!(PipelineOpts::builder().build().is_err());
    }

    #[test]
    fn check_rejects_bad_options() {
        let shared = opts()
            .service_lcores("2".parse::<LCoreSet>().unwrap())
            .build()
            .unwrap();
        assert_eq!(shared.check(), Err(ConfigError::SharedLCore(LCoreId(2))));

        let no_stages = opts().stages(Vec::new()).build().unwrap();
        assert_eq!(no_stages.check(), Err(ConfigError::NoStages));

        let no_flows = opts().nb_flows(0).build().unwrap();
        assert_eq!(no_flows.check(), Err(ConfigError::NoFlows));

        let zero_depth = opts().worker_dequeue_depth(0).build().unwrap();
        assert_eq!(zero_depth.check(), Err(ConfigError::ZeroDequeueDepth));

        let no_sources = opts().nb_sources(0).build().unwrap();
        assert_eq!(no_sources.check(), Err(ConfigError::NoSources));
    }

    #[test]
    fn display_lists_options() {
        let text = opts()
            .stages(vec![SchedType::Atomic, SchedType::Ordered])
            .build()
            .unwrap()
            .to_string();
        assert!(text.contains("worker lcores   : 1-2"));
        assert!(text.contains("stages          : 2 [atomic,ordered]"));
    }
}
