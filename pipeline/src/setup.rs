// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Apply a [`TopologyPlan`] to an event device.

use crate::error::{ConfigError, PipelineError};
use crate::topology::{PortRole, TopologyPlan};
use eventdev::adapter::RxAdapter;
use eventdev::config::{DevConfig, PortConf, QueueConf, priority};
use eventdev::info::DevInfo;
use eventdev::service::{Service, ServiceCores, ServiceId};
use eventdev::{EventDevice, StageId};
use tracing::{debug, info};

/// Ports handed out by [`configure`], by role.
#[derive(Debug)]
pub(crate) struct Ports<T> {
    pub(crate) workers: Vec<T>,
    pub(crate) tx_service: Option<T>,
}

/// The device configuration for `plan`: every limit at the device maximum.
pub(crate) fn dev_config(plan: &TopologyPlan, info: &DevInfo) -> Result<DevConfig, ConfigError> {
    let nb_event_queues =
        u8::try_from(plan.queue_count()).map_err(|_| ConfigError::TooManyQueues {
            requested: plan.queue_count(),
            available: usize::from(info.max_event_queues),
        })?;
    let nb_event_ports =
        u8::try_from(plan.port_count()).map_err(|_| ConfigError::TooManyPorts {
            requested: plan.port_count(),
            available: usize::from(info.max_event_ports),
        })?;
    Ok(DevConfig {
        nb_event_queues,
        nb_event_ports,
        nb_events_limit: info.max_num_events,
        nb_event_queue_flows: plan.nb_flows,
        nb_event_port_dequeue_depth: info.max_event_port_dequeue_depth,
        nb_event_port_enqueue_depth: info.max_event_port_enqueue_depth,
    })
}

/// Configure the device, its queues and ports, link them, and take every port.
#[tracing::instrument(level = "info", skip_all, fields(topology = %plan.topology))]
pub(crate) fn configure<P: Send + 'static, D: EventDevice<P>>(
    dev: &mut D,
    plan: &TopologyPlan,
    worker_dequeue_depth: Option<u16>,
) -> Result<Ports<D::Port>, PipelineError> {
    let info = dev.info();
    let config = dev_config(plan, &info)?;
    dev.configure(&config)?;

    for queue in &plan.queues {
        let conf = QueueConf {
            kind: queue.kind,
            priority: priority::NORMAL,
            nb_atomic_flows: queue.nb_atomic_flows,
            nb_atomic_order_sequences: queue.nb_atomic_order_sequences,
        };
        dev.queue_setup(queue.id, &conf)
            .map_err(|source| PipelineError::QueueSetup {
                queue: queue.id,
                source,
            })?;
        debug!("queue {} set up as {}", queue.id, queue.kind);
    }

    for port in &plan.ports {
        let dequeue_depth = match port.role {
            PortRole::Worker => worker_dequeue_depth.unwrap_or(info.max_event_port_dequeue_depth),
            PortRole::TxService => info.max_event_port_dequeue_depth,
        };
        let conf = PortConf {
            dequeue_depth,
            enqueue_depth: info.max_event_port_enqueue_depth,
            new_event_threshold: info.max_num_events,
        };
        dev.port_setup(port.id, &conf)
            .map_err(|source| PipelineError::PortSetup {
                port: port.id,
                source,
            })?;
        let linked = dev
            .port_link(port.id, &port.links)
            .map_err(|source| PipelineError::PortLink {
                port: port.id,
                source,
            })?;
        debug!("port {} ({}) linked to {linked} queues", port.id, port.role);
    }

    let mut ports = Ports {
        workers: Vec::with_capacity(plan.port_count()),
        tx_service: None,
    };
    for port in &plan.ports {
        let handle = dev.take_port(port.id)?;
        match port.role {
            PortRole::Worker => ports.workers.push(handle),
            PortRole::TxService => ports.tx_service = Some(handle),
        }
    }
    info!(
        "event device '{}' configured: {} queues, {} ports",
        info.driver_name,
        plan.queue_count(),
        plan.port_count()
    );
    Ok(ports)
}

/// Bind one injector per receive source to the queue it feeds.
pub(crate) fn bind_sources<P: Send + 'static, D: EventDevice<P>>(
    dev: &D,
    plan: &TopologyPlan,
    adapter: &mut dyn RxAdapter<P>,
) -> Result<(), PipelineError> {
    let threshold = dev.info().max_num_events;
    let sched_type = plan.sched_type(StageId::FIRST);
    for (source, queue) in plan.source_queues() {
        let injector = dev.injector(queue, threshold)?.with_sched_type(sched_type);
        adapter.bind(queue, source, injector)?;
        debug!("receive source {source} bound to queue {queue}");
    }
    Ok(())
}

/// Map `service` onto the least loaded service core, with its runstate off.
pub(crate) fn register_service(
    cores: &mut ServiceCores,
    service: Box<dyn Service>,
    what: &'static str,
) -> Result<ServiceId, PipelineError> {
    let lcore = cores.pick_core().ok_or(PipelineError::NoServiceCore(what))?;
    let id = cores.register_service(service, lcore)?;
    info!("{what} mapped to service lcore {lcore}");
    Ok(id)
}

/// Register the scheduling service of `dev` if it needs one.
pub(crate) fn register_scheduler<P: Send + 'static, D: EventDevice<P>>(
    dev: &D,
    cores: &mut ServiceCores,
) -> Result<Option<ServiceId>, PipelineError> {
    match dev.scheduler_service()? {
        Some(service) => register_service(cores, service, "event scheduler").map(Some),
        None => {
            debug!("device schedules on dequeue, no scheduler service needed");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::topology::Topology;
    use eventdev::config::QueueKind;
    use eventdev::lcore::{LCoreId, LCoreSet};
    use eventdev::sw::{SwEventDev, default_info};
    use eventdev::{DevError, DevState, EventPort, PortId, QueueId, SchedType};

    fn plan(unsafe_tx: bool) -> TopologyPlan {
        let stages = [SchedType::Atomic, SchedType::Ordered];
        Topology::AllTypesQueue
            .plan(2, 2, unsafe_tx, &stages, 128)
            .unwrap()
    }

    #[test]
    fn config_at_device_maxima() {
        let info = default_info();
        let config = dev_config(&plan(true), &info).unwrap();
        assert_eq!(config.nb_event_queues, 3);
        assert_eq!(config.nb_event_ports, 3);
        assert_eq!(config.nb_events_limit, info.max_num_events);
        assert_eq!(config.nb_event_queue_flows, 128);
    }

    #[test]
    fn configure_hands_out_ports_by_role() {
        let mut dev = SwEventDev::<u32>::new();
        let ports = configure(&mut dev, &plan(true), Some(16)).unwrap();
        assert_eq!(dev.state(), DevState::Configured);
        assert_eq!(ports.workers.len(), 2);
        assert_eq!(ports.workers[0].conf().dequeue_depth, 16);
        let tx = ports.tx_service.unwrap();
        assert_eq!(tx.id(), PortId(2));
        assert_eq!(
            tx.conf().dequeue_depth,
            default_info().max_event_port_dequeue_depth
        );
        // every port is taken
        assert!(matches!(
            dev.take_port(PortId(0)),
            Err(DevError::PortTaken(_))
        ));
    }

    #[test]
    fn per_stage_queues_get_stage_disciplines() {
        let mut info = default_info();
        info.capabilities = eventdev::info::DevCapabilities::BURST_MODE;
        let mut dev = SwEventDev::<u32>::with_info(info);
        let plan = Topology::QueuePerStage
            .plan(1, 1, false, &[SchedType::Atomic, SchedType::Parallel], 64)
            .unwrap();
        assert_eq!(plan.queues[1].kind, QueueKind::Parallel);
        assert!(configure(&mut dev, &plan, None).is_ok());
    }

    #[test]
    fn all_types_plan_refused_by_device_without_capability() {
        let mut info = default_info();
        info.capabilities = eventdev::info::DevCapabilities::empty();
        let mut dev = SwEventDev::<u32>::with_info(info);
        let err = configure(&mut dev, &plan(false), None).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::QueueSetup {
                queue: QueueId(0),
                source: DevError::UnsupportedQueueKind(QueueKind::AllTypes)
            }
        ));
        assert!(err.to_string().starts_with("setup of queue 0 failed"));
    }

    #[test]
    fn scheduler_needs_a_service_core() {
        let mut dev = SwEventDev::<u32>::new();
        configure(&mut dev, &plan(false), None).unwrap();
        let mut none = ServiceCores::new(LCoreSet::default());
        assert!(matches!(
            register_scheduler(&dev, &mut none),
            Err(PipelineError::NoServiceCore("event scheduler"))
        ));
        let mut cores = ServiceCores::new([LCoreId(4)].into_iter().collect());
        let id = register_scheduler(&dev, &mut cores).unwrap().unwrap();
        assert!(!cores.runstate(id).unwrap());
    }
}
