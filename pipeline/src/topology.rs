// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Topology planning: how many queues and ports a pipeline needs, their disciplines, and
//! which port is linked to which queue.
//!
//! Planning is a pure function of its inputs. Two strategies are supported:
//!
//! * [`Topology::AllTypesQueue`]: one all-types queue per receive source carries every stage
//!   of that source; the stage travels on the event.
//! * [`Topology::QueuePerStage`]: one queue per (source, stage), each with the discipline of
//!   its stage.
//!
//! When the transmit path cannot be called concurrently, both strategies reserve one extra
//! single-link queue and one extra port for the transmit service.

use crate::error::ConfigError;
use arrayvec::ArrayVec;
use core::fmt::Display;
use eventdev::adapter::SourceId;
use eventdev::config::QueueKind;
use eventdev::{PortId, QueueId, SchedType, StageId};

/// Upper bound on the number of pipeline stages.
pub const MAX_STAGES: usize = 64;

const MAX_IDS: usize = u8::MAX as usize + 1;

#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    serde::Serialize,
)]
pub enum Topology {
    #[default]
    #[strum(serialize = "atq")]
    #[serde(rename = "atq")]
    AllTypesQueue,
    #[strum(serialize = "queue")]
    #[serde(rename = "queue")]
    QueuePerStage,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueuePlan {
    pub id: QueueId,
    pub kind: QueueKind,
    pub nb_atomic_flows: u32,
    pub nb_atomic_order_sequences: u32,
    /// Receive source feeding this queue, none for the transmit queue.
    pub source: Option<SourceId>,
    /// Stage carried by this queue; none when the queue carries every stage.
    pub stage: Option<StageId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::Display, serde::Serialize)]
#[strum(serialize_all = "snake_case")]
pub enum PortRole {
    Worker,
    TxService,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortPlan {
    pub id: PortId,
    pub role: PortRole,
    pub links: Vec<QueueId>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TopologyPlan {
    pub topology: Topology,
    pub queues: Vec<QueuePlan>,
    pub ports: Vec<PortPlan>,
    /// The single-link queue of the transmit service, if the transmit path is unsafe.
    pub tx_queue: Option<QueueId>,
    /// Scheduling type of each stage.
    pub stages: ArrayVec<SchedType, MAX_STAGES>,
    pub nb_flows: u32,
}

impl Topology {
    /// Compute the plan for `nb_sources` receive sources, `nb_workers` workers and `stages`.
    #[tracing::instrument(level = "debug", ret)]
    pub fn plan(
        self,
        nb_sources: u16,
        nb_workers: u16,
        unsafe_tx: bool,
        stages: &[SchedType],
        nb_flows: u32,
    ) -> Result<TopologyPlan, ConfigError> {
        if nb_sources == 0 {
            return Err(ConfigError::NoSources);
        }
        if nb_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        if nb_flows == 0 {
            return Err(ConfigError::NoFlows);
        }
        let stages: ArrayVec<SchedType, MAX_STAGES> =
            stages
                .try_into()
                .map_err(|_| ConfigError::TooManyStages {
                    requested: stages.len(),
                    max: MAX_STAGES,
                })?;

        let nb_sources = usize::from(nb_sources);
        let base = match self {
            Topology::AllTypesQueue => nb_sources,
            Topology::QueuePerStage => nb_sources * stages.len(),
        };
        let nb_queues = base + usize::from(unsafe_tx);
        if nb_queues > MAX_IDS {
            return Err(ConfigError::TooManyQueues {
                requested: nb_queues,
                available: MAX_IDS,
            });
        }
        let nb_ports = usize::from(nb_workers) + usize::from(unsafe_tx);
        if nb_ports > MAX_IDS {
            return Err(ConfigError::TooManyPorts {
                requested: nb_ports,
                available: MAX_IDS,
            });
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_IDS above
        let mut queues: Vec<QueuePlan> = (0..base)
            .map(|q| {
                let (source, stage) = match self {
                    Topology::AllTypesQueue => (q, None),
                    Topology::QueuePerStage => (q / stages.len(), Some(q % stages.len())),
                };
                QueuePlan {
                    id: QueueId(q as u8),
                    kind: match stage {
                        None => QueueKind::AllTypes,
                        Some(s) => QueueKind::from(stages[s]),
                    },
                    nb_atomic_flows: nb_flows,
                    nb_atomic_order_sequences: nb_flows,
                    source: Some(SourceId(source as u16)),
                    stage: stage.map(|s| StageId(s as u8)),
                }
            })
            .collect();
        let worker_links: Vec<QueueId> = queues.iter().map(|q| q.id).collect();

        #[allow(clippy::cast_possible_truncation)]
        let mut ports: Vec<PortPlan> = (0..usize::from(nb_workers))
            .map(|p| PortPlan {
                id: PortId(p as u8),
                role: PortRole::Worker,
                links: worker_links.clone(),
            })
            .collect();

        let tx_queue = if unsafe_tx {
            #[allow(clippy::cast_possible_truncation)]
            let id = QueueId(base as u8);
            queues.push(QueuePlan {
                id,
                kind: QueueKind::SingleLink,
                nb_atomic_flows: nb_flows,
                nb_atomic_order_sequences: nb_flows,
                source: None,
                stage: None,
            });
            #[allow(clippy::cast_possible_truncation)]
            ports.push(PortPlan {
                id: PortId(nb_workers as u8),
                role: PortRole::TxService,
                links: vec![id],
            });
            Some(id)
        } else {
            None
        };

        Ok(TopologyPlan {
            topology: self,
            queues,
            ports,
            tx_queue,
            stages,
            nb_flows,
        })
    }
}

impl TopologyPlan {
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    #[must_use]
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    #[must_use]
    pub fn unsafe_tx(&self) -> bool {
        self.tx_queue.is_some()
    }

    pub fn worker_ports(&self) -> impl Iterator<Item = &PortPlan> {
        self.ports.iter().filter(|p| p.role == PortRole::Worker)
    }

    #[must_use]
    pub fn tx_port(&self) -> Option<&PortPlan> {
        self.ports.iter().find(|p| p.role == PortRole::TxService)
    }

    /// Queues fed by receive sources, each with the source feeding it at the first stage.
    pub fn source_queues(&self) -> impl Iterator<Item = (SourceId, QueueId)> + '_ {
        self.queues.iter().filter_map(|q| match (q.source, q.stage) {
            (Some(source), None | Some(StageId::FIRST)) => Some((source, q.id)),
            _ => None,
        })
    }

    #[must_use]
    pub fn last_stage(&self) -> StageId {
        #[allow(clippy::cast_possible_truncation)] // at most MAX_STAGES stages
        StageId((self.stages.len() - 1) as u8)
    }

    #[must_use]
    pub fn sched_type(&self, stage: StageId) -> SchedType {
        self.stages
            .get(stage.as_usize())
            .copied()
            .unwrap_or_default()
    }

    /// The queue carrying `next` for an event currently on `current`.
    #[must_use]
    pub fn next_queue(&self, current: QueueId, next: StageId) -> QueueId {
        match self.topology {
            Topology::AllTypesQueue => current,
            Topology::QueuePerStage => {
                let nb_stages = self.stages.len();
                let source = current.as_usize() / nb_stages;
                #[allow(clippy::cast_possible_truncation)]
                QueueId((source * nb_stages + next.as_usize()) as u8)
            }
        }
    }
}

impl Display for TopologyPlan {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "topology {}: {} queues, {} ports, {} stages, {} flows",
            self.topology,
            self.queue_count(),
            self.port_count(),
            self.stages.len(),
            self.nb_flows
        )?;
        for q in &self.queues {
            write!(f, "  queue {:>3} {:<11}", q.id, q.kind.to_string())?;
            if let Some(source) = q.source {
                write!(f, " source {source}")?;
            }
            if let Some(stage) = q.stage {
                write!(f, " stage {stage}")?;
            }
            writeln!(f)?;
        }
        for p in &self.ports {
            let links: Vec<String> = p.links.iter().map(ToString::to_string).collect();
            writeln!(
                f,
                "  port  {:>3} {:<11} -> [{}]",
                p.id,
                p.role.to_string(),
                links.join(",")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn all_types_queue(id: u8, nb_flows: u32) -> QueuePlan {
        QueuePlan {
            id: QueueId(id),
            kind: QueueKind::AllTypes,
            nb_atomic_flows: nb_flows,
            nb_atomic_order_sequences: nb_flows,
            source: Some(SourceId(u16::from(id))),
            stage: None,
        }
    }

    #[test]
    fn two_sources_two_workers_safe_tx() {
        let plan = Topology::AllTypesQueue
            .plan(2, 2, false, &[SchedType::Atomic, SchedType::Atomic], 1024)
            .unwrap();
        assert_eq!(
            plan.queues,
            vec![all_types_queue(0, 1024), all_types_queue(1, 1024)]
        );
        assert_eq!(
            plan.ports,
            vec![
                PortPlan {
                    id: PortId(0),
                    role: PortRole::Worker,
                    links: vec![QueueId(0), QueueId(1)],
                },
                PortPlan {
                    id: PortId(1),
                    role: PortRole::Worker,
                    links: vec![QueueId(0), QueueId(1)],
                },
            ]
        );
        assert_eq!(plan.tx_queue, None);
        assert!(plan.tx_port().is_none());
    }

    #[test]
    fn two_sources_two_workers_unsafe_tx() {
        let plan = Topology::AllTypesQueue
            .plan(2, 2, true, &[SchedType::Atomic], 1024)
            .unwrap();
        assert_eq!(plan.queue_count(), 3);
        assert_eq!(plan.port_count(), 3);
        assert_eq!(plan.queues[2].kind, QueueKind::SingleLink);
        assert_eq!(plan.tx_queue, Some(QueueId(2)));
        let workers: Vec<&PortPlan> = plan.worker_ports().collect();
        assert_eq!(workers.len(), 2);
        for port in workers {
            assert_eq!(port.links, vec![QueueId(0), QueueId(1)]);
        }
        assert_eq!(
            plan.tx_port(),
            Some(&PortPlan {
                id: PortId(2),
                role: PortRole::TxService,
                links: vec![QueueId(2)],
            })
        );
    }

    #[test]
    fn queue_per_stage_layout() {
        let stages = [SchedType::Atomic, SchedType::Parallel, SchedType::Ordered];
        let plan = Topology::QueuePerStage.plan(2, 1, true, &stages, 64).unwrap();
        assert_eq!(plan.queue_count(), 7);
        let kinds: Vec<QueueKind> = plan.queues.iter().map(|q| q.kind).collect();
        assert_eq!(
            kinds,
            vec![
                QueueKind::Atomic,
                QueueKind::Parallel,
                QueueKind::Ordered,
                QueueKind::Atomic,
                QueueKind::Parallel,
                QueueKind::Ordered,
                QueueKind::SingleLink,
            ]
        );
        let sources: Vec<(SourceId, QueueId)> = plan.source_queues().collect();
        assert_eq!(
            sources,
            vec![(SourceId(0), QueueId(0)), (SourceId(1), QueueId(3))]
        );
        assert_eq!(plan.next_queue(QueueId(3), StageId(1)), QueueId(4));
        assert_eq!(plan.next_queue(QueueId(4), StageId(2)), QueueId(5));
        assert_eq!(plan.last_stage(), StageId(2));
        assert_eq!(plan.sched_type(StageId(1)), SchedType::Parallel);
    }

    #[test]
    fn all_types_stays_on_its_queue() {
        let plan = Topology::AllTypesQueue
            .plan(3, 1, false, &[SchedType::Atomic, SchedType::Ordered], 16)
            .unwrap();
        assert_eq!(plan.next_queue(QueueId(2), StageId(1)), QueueId(2));
        let sources: Vec<(SourceId, QueueId)> = plan.source_queues().collect();
        assert_eq!(sources.len(), 3);
    }

    #[test]
    fn degenerate_inputs_rejected() {
        let stages = [SchedType::Atomic];
        assert_eq!(
            Topology::AllTypesQueue.plan(0, 2, false, &stages, 16),
            Err(ConfigError::NoSources)
        );
        assert_eq!(
            Topology::AllTypesQueue.plan(2, 0, false, &stages, 16),
            Err(ConfigError::NoWorkers)
        );
        assert_eq!(
            Topology::AllTypesQueue.plan(2, 2, false, &[], 16),
            Err(ConfigError::NoStages)
        );
        assert_eq!(
            Topology::AllTypesQueue.plan(2, 2, false, &stages, 0),
            Err(ConfigError::NoFlows)
        );
        assert_eq!(
            Topology::QueuePerStage.plan(200, 2, false, &[SchedType::Atomic; 2], 16),
            Err(ConfigError::TooManyQueues {
                requested: 400,
                available: 256
            })
        );
    }

    #[test]
    fn topology_names() {
        assert_eq!(Topology::default().to_string(), "atq");
        assert_eq!("queue".parse::<Topology>().unwrap(), Topology::QueuePerStage);
    }

    #[test]
    fn planning_is_deterministic() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|(r, w, unsafe_tx, s, per_stage): (u8, u8, bool, u8, bool)| {
                let topology = if per_stage {
                    Topology::QueuePerStage
                } else {
                    Topology::AllTypesQueue
                };
                let stages = vec![SchedType::Atomic; usize::from(s % 8)];
                let a = topology.plan(u16::from(r), u16::from(w), unsafe_tx, &stages, 128);
                let b = topology.plan(u16::from(r), u16::from(w), unsafe_tx, &stages, 128);
                assert_eq!(a, b);
            });
    }

    #[test]
    fn plan_sizes_follow_inputs() {
        bolero::check!()
            .with_type()
            .cloned()
            .for_each(|(r, w, unsafe_tx, s): (u8, u8, bool, u8)| {
                let s = usize::from(s % 4) + 1;
                let stages = vec![SchedType::Parallel; s];
                let Ok(plan) =
                    Topology::AllTypesQueue.plan(u16::from(r), u16::from(w), unsafe_tx, &stages, 8)
                else {
                    assert!(r == 0 || w == 0);
                    return;
                };
                let extra = usize::from(unsafe_tx);
                assert_eq!(plan.queue_count(), usize::from(r) + extra);
                assert_eq!(plan.port_count(), usize::from(w) + extra);
                // the transmit queue is never linked to a worker
                if let Some(tx) = plan.tx_queue {
                    assert!(plan.worker_ports().all(|p| !p.links.contains(&tx)));
                    assert_eq!(plan.tx_port().map(|p| p.links.clone()), Some(vec![tx]));
                }
            });
    }
}
