// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command line of the `evpipe` binary.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub use clap::Parser;
use eventdev::SchedType;
use eventdev::lcore::LCoreSet;
use pipeline::{PipelineOpts, PipelineOptsBuilderError, Topology};
use std::fmt::Display;
use std::str::FromStr;

/// A list of stage scheduling types, one letter per stage: `a` (atomic), `o` (ordered),
/// `p` (parallel). Commas between letters are ignored, so `aop` and `a,o,p` are the same list.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StageList(Vec<SchedType>);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum InvalidStageList {
    #[error("empty stage list")]
    #[diagnostic(help("give one letter per stage, e.g. --stlist aop"))]
    Empty,
    #[error("'{0}' is not a stage type")]
    #[diagnostic(help("stage types are a (atomic), o (ordered) and p (parallel)"))]
    UnknownType(char),
}

impl StageList {
    #[must_use]
    pub fn as_slice(&self) -> &[SchedType] {
        &self.0
    }
}

impl From<StageList> for Vec<SchedType> {
    fn from(value: StageList) -> Self {
        value.0
    }
}

impl FromStr for StageList {
    type Err = InvalidStageList;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let stages = input
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .map(|c| match c.to_ascii_lowercase() {
                'a' => Ok(SchedType::Atomic),
                'o' => Ok(SchedType::Ordered),
                'p' => Ok(SchedType::Parallel),
                _ => Err(InvalidStageList::UnknownType(c)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        if stages.is_empty() {
            return Err(InvalidStageList::Empty);
        }
        Ok(StageList(stages))
    }
}

impl Display for StageList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for stage in &self.0 {
            let letter = match stage {
                SchedType::Atomic => 'a',
                SchedType::Ordered => 'o',
                SchedType::Parallel => 'p',
            };
            write!(f, "{letter}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum InvalidCmdArguments {
    #[error("no worker lcores given")]
    #[diagnostic(help("pass the worker lcores with --wlcores, e.g. --wlcores 1-4"))]
    NoWorkers,
    #[error("lcore {0} given both as a worker and as a service lcore")]
    #[diagnostic(help("--wlcores and --slcores must not overlap"))]
    SharedLCore(u32),
    #[error(transparent)]
    Options(#[from] PipelineOptsBuilderError),
}

#[derive(Parser, Debug, serde::Serialize)]
#[command(name = "evpipe")]
#[command(version)]
#[command(about = "A staged, flow-aware event pipeline", long_about = None)]
#[allow(clippy::struct_excessive_bools)]
pub struct CmdArgs {
    #[arg(
        long,
        value_name = "atq|queue",
        default_value_t = Topology::AllTypesQueue,
        help = "Queue topology: one all-types queue per receive source (atq) or one queue per stage and source (queue)"
    )]
    topology: Topology,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..=64),
        help = "Number of receive sources in [1..64]"
    )]
    sources: u16,

    #[arg(
        long,
        value_name = "LCORES",
        help = "Worker lcores, e.g. 1,3-5. One worker port per lcore"
    )]
    wlcores: Option<LCoreSet>,

    #[arg(
        long,
        value_name = "LCORES",
        help = "Service lcores for the event scheduler and the transmit service, e.g. 6-7"
    )]
    slcores: Option<LCoreSet>,

    #[arg(
        long,
        value_name = "STAGES",
        default_value = "a",
        help = "Scheduling type of each stage, one letter per stage: a (atomic), o (ordered), p (parallel).
Example: --stlist aop runs three stages"
    )]
    stlist: StageList,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 1024,
        value_parser = clap::value_parser!(u32).range(1..),
        help = "Flow contexts per queue"
    )]
    nb_flows: u32,

    #[arg(
        long,
        value_name = "N",
        value_parser = clap::value_parser!(u16).range(1..),
        help = "Worker port dequeue depth (default: device maximum)"
    )]
    wkr_deq_dep: Option<u16>,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 1 << 20,
        help = "Packets generated per receive source, 0 to run until interrupted"
    )]
    nb_pkts: u64,

    #[arg(long, default_value_t = false, help = "Dequeue one event at a time")]
    no_burst: bool,

    #[arg(
        long,
        default_value_t = false,
        help = "Treat the transmit path as unsafe for concurrent calls"
    )]
    mt_unsafe: bool,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 3,
        help = "Retries of a refused enqueue or transmit before the events are dropped"
    )]
    enq_retries: u32,

    #[arg(
        long,
        value_name = "N",
        default_value_t = 64,
        help = "Polls per dequeue before a worker checks for stop"
    )]
    deq_polls: u32,

    #[arg(
        long,
        value_name = "LEVEL",
        default_value_t = tracing::Level::INFO,
        help = "Log level, one of error, warn, info, debug, trace. RUST_LOG takes precedence"
    )]
    #[serde(serialize_with = "serialize_display")]
    log_level: tracing::Level,
}

fn serialize_display<T: Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl CmdArgs {
    #[must_use]
    pub fn log_level(&self) -> tracing::Level {
        self.log_level
    }

    #[must_use]
    pub fn stages(&self) -> &[SchedType] {
        self.stlist.as_slice()
    }
}

impl TryFrom<CmdArgs> for PipelineOpts {
    type Error = InvalidCmdArguments;

    fn try_from(value: CmdArgs) -> Result<Self, InvalidCmdArguments> {
        let workers = value.wlcores.ok_or(InvalidCmdArguments::NoWorkers)?;
        if workers.is_empty() {
            return Err(InvalidCmdArguments::NoWorkers);
        }
        let services = value.slcores.unwrap_or_default();
        if let Some(shared) = services.iter().find(|&l| workers.contains(l)) {
            return Err(InvalidCmdArguments::SharedLCore(shared.as_u32()));
        }
        let mut builder = PipelineOpts::builder();
        builder
            .topology(value.topology)
            .nb_sources(value.sources)
            .worker_lcores(workers)
            .service_lcores(services)
            .stages(value.stlist)
            .nb_flows(value.nb_flows)
            .nb_pkts(value.nb_pkts)
            .burst(!value.no_burst)
            .mt_unsafe(value.mt_unsafe)
            .enq_retries(value.enq_retries)
            .deq_polls(value.deq_polls);
        if let Some(depth) = value.wkr_deq_dep {
            builder.worker_dequeue_depth(depth);
        }
        Ok(builder.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventdev::lcore::LCoreId;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Result<CmdArgs, clap::Error> {
        CmdArgs::try_parse_from(std::iter::once("evpipe").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_stage_list() {
        let stages: StageList = "aop".parse().unwrap();
        assert_eq!(
            stages.as_slice(),
            &[SchedType::Atomic, SchedType::Ordered, SchedType::Parallel]
        );
        assert_eq!("a,O,p".parse::<StageList>().unwrap(), stages);
        assert_eq!(stages.to_string(), "aop");
        assert_eq!("".parse::<StageList>(), Err(InvalidStageList::Empty));
        assert_eq!(",".parse::<StageList>(), Err(InvalidStageList::Empty));
        assert_eq!(
            "ax".parse::<StageList>(),
            Err(InvalidStageList::UnknownType('x'))
        );
    }

    #[test]
    fn stage_list_never_panics() {
        bolero::check!().with_type::<String>().for_each(|input| {
            if let Ok(stages) = input.parse::<StageList>() {
                assert!(!stages.as_slice().is_empty());
                assert_eq!(stages.to_string().parse::<StageList>(), Ok(stages));
            }
        });
    }

    #[test]
    fn test_defaults() {
        let opts = PipelineOpts::try_from(parse(&["--wlcores", "1-2"]).unwrap()).unwrap();
        assert_eq!(opts.topology, Topology::AllTypesQueue);
        assert_eq!(opts.nb_sources, 1);
        assert_eq!(opts.nb_workers(), 2);
        assert!(opts.service_lcores.is_empty());
        assert_eq!(opts.stages, vec![SchedType::Atomic]);
        assert_eq!(opts.nb_flows, 1024);
        assert_eq!(opts.worker_dequeue_depth, None);
        assert!(opts.burst);
        assert!(!opts.mt_unsafe);
        assert_eq!(opts.enq_retries, 3);
    }

    #[test]
    fn test_full_command_line() {
        let args = parse(&[
            "--topology",
            "queue",
            "--sources",
            "2",
            "--wlcores",
            "1,3-4",
            "--slcores",
            "5",
            "--stlist",
            "aap",
            "--nb-flows",
            "64",
            "--wkr-deq-dep",
            "16",
            "--nb-pkts",
            "0",
            "--no-burst",
            "--mt-unsafe",
            "--enq-retries",
            "7",
            "--deq-polls",
            "8",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        let opts = PipelineOpts::try_from(args).unwrap();
        assert_eq!(opts.topology, Topology::QueuePerStage);
        assert_eq!(opts.nb_sources, 2);
        assert_eq!(
            opts.worker_lcores.iter().collect::<Vec<_>>(),
            vec![LCoreId(1), LCoreId(3), LCoreId(4)]
        );
        assert_eq!(
            opts.service_lcores.iter().collect::<Vec<_>>(),
            vec![LCoreId(5)]
        );
        assert_eq!(
            opts.stages,
            vec![SchedType::Atomic, SchedType::Atomic, SchedType::Parallel]
        );
        assert_eq!(opts.nb_flows, 64);
        assert_eq!(opts.worker_dequeue_depth, Some(16));
        assert_eq!(opts.nb_pkts, 0);
        assert!(!opts.burst);
        assert!(opts.mt_unsafe);
        assert_eq!(opts.enq_retries, 7);
        assert_eq!(opts.deq_polls, 8);
        assert_eq!(opts.check(), Ok(()));
    }

    #[test]
    fn test_rejected_command_lines() {
        assert!(matches!(
            PipelineOpts::try_from(parse(&[]).unwrap()),
            Err(InvalidCmdArguments::NoWorkers)
        ));
        assert!(matches!(
            PipelineOpts::try_from(parse(&["--wlcores", "1-3", "--slcores", "3"]).unwrap()),
            Err(InvalidCmdArguments::SharedLCore(3))
        ));
        assert!(parse(&["--wlcores", "1", "--stlist", "ax"]).is_err());
        assert!(parse(&["--wlcores", "1", "--topology", "ring"]).is_err());
        assert!(parse(&["--wlcores", "3-1"]).is_err());
        assert!(parse(&["--wlcores", "1", "--sources", "0"]).is_err());
        assert!(parse(&["--wlcores", "1", "--nb-flows", "0"]).is_err());
        assert!(parse(&["--wlcores", "1", "--wkr-deq-dep", "0"]).is_err());
    }
}
