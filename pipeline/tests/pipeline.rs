// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use eventdev::info::{DevCapabilities, DevInfo};
use eventdev::lcore::LCoreSet;
use eventdev::service::ServiceCores;
use eventdev::sw::{SwEventDev, default_info};
use eventdev::{DevState, EventDevice, SchedType};
use pipeline::sample::{FlowTable, FlowTracker, Forwarder, Packet, RecordingTx, SyntheticRx};
use pipeline::{
    ConfigError, HandlerFactory, LifecycleError, Pipeline, PipelineError, PipelineOpts,
    PipelineOptsBuilder, Stats, Step, Topology,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_test::traced_test;

const NB_PKTS: u64 = 500;

fn opts(sources: u16, workers: &str, services: &str) -> PipelineOptsBuilder {
    let services = if services.is_empty() {
        LCoreSet::default()
    } else {
        services.parse::<LCoreSet>().unwrap()
    };
    let mut b = PipelineOpts::builder();
    b.nb_sources(sources)
        .worker_lcores(workers.parse::<LCoreSet>().unwrap())
        .service_lcores(services)
        .nb_flows(256)
        .nb_pkts(NB_PKTS)
        .enq_retries(10);
    b
}

fn forwarder() -> HandlerFactory<Packet> {
    Arc::new(|_| Box::new(Forwarder))
}

fn pipeline(
    opts: PipelineOpts,
    info: DevInfo,
    tx: &RecordingTx,
) -> Pipeline<SwEventDev<Packet>, Packet> {
    let rx = SyntheticRx::new(opts.nb_pkts);
    let cores = ServiceCores::new(opts.service_lcores.clone());
    Pipeline::new(
        SwEventDev::with_info(info),
        opts,
        Arc::new(tx.clone()),
        Box::new(rx),
        cores,
    )
}

fn run(
    opts: PipelineOpts,
    info: DevInfo,
    tx: &RecordingTx,
    factory: &HandlerFactory<Packet>,
) -> Result<Stats, LifecycleError> {
    let mut p = pipeline(opts, info, tx);
    let stop = AtomicBool::new(false);
    let stats = p.run(factory, &stop)?;
    p.destroy()?;
    Ok(stats)
}

fn assert_complete(stats: &Stats, expected: u64) {
    assert_eq!(stats.undrained, 0);
    assert_eq!(stats.drops(), 0);
    assert_eq!(stats.transmitted(), expected);
    assert_eq!(stats.device.new_events, expected);
    assert_eq!(stats.device.dropped, 0);
}

#[test]
#[traced_test]
fn workers_transmit_when_the_path_is_mt_safe() {
    let tx = RecordingTx::new(true);
    let opts = opts(2, "1-2", "3")
        .stages(vec![
            SchedType::Atomic,
            SchedType::Ordered,
            SchedType::Parallel,
        ])
        .build()
        .unwrap();
    let stats = run(opts, default_info(), &tx, &forwarder()).unwrap();
    assert_complete(&stats, 2 * NB_PKTS);
    assert!(stats.tx_service.is_none());
    assert_eq!(tx.sent(), 2 * NB_PKTS);
    assert!(tx.callers().iter().all(|name| name.starts_with("lcore-")));
    assert_eq!(stats.workers.len(), 2);
}

#[test]
#[traced_test]
fn unsafe_transmit_path_has_a_single_caller() {
    let tx = RecordingTx::new(false);
    let opts = opts(2, "1-2", "3")
        .stages(vec![SchedType::Atomic, SchedType::Atomic])
        .build()
        .unwrap();
    let stats = run(opts, default_info(), &tx, &forwarder()).unwrap();
    assert_complete(&stats, 2 * NB_PKTS);
    let callers = tx.callers();
    assert_eq!(callers.len(), 1, "transmit called from {callers:?}");
    assert_eq!(callers.first().map(String::as_str), Some("service-3"));
    assert_eq!(tx.concurrent_calls(), 0);
    let service = stats.tx_service.unwrap();
    assert_eq!(service.transmitted, 2 * NB_PKTS);
    assert!(stats.workers.iter().all(|w| w.transmitted == 0));
}

#[test]
fn mt_unsafe_option_forces_the_transmit_service() {
    let tx = RecordingTx::new(true);
    let opts = opts(1, "1-3", "4").mt_unsafe(true).build().unwrap();
    let stats = run(opts, default_info(), &tx, &forwarder()).unwrap();
    assert_complete(&stats, NB_PKTS);
    assert_eq!(tx.callers().len(), 1);
    assert_eq!(tx.lcores().len(), 1);
}

#[test]
fn atomic_flows_never_processed_concurrently() {
    let tx = RecordingTx::new(true);
    let table = FlowTable::new();
    let factory: HandlerFactory<Packet> = {
        let table = table.clone();
        Arc::new(move |worker| Box::new(FlowTracker::new(worker, table.clone())))
    };
    let opts = opts(2, "1-4", "5")
        .stages(vec![SchedType::Atomic; 3])
        .build()
        .unwrap();
    let stats = run(opts, default_info(), &tx, &factory).unwrap();
    assert_complete(&stats, 2 * NB_PKTS);
    assert_eq!(table.checked(), 3 * 2 * NB_PKTS);
    assert_eq!(table.violations(), 0);
}

#[test]
fn queue_per_stage_topology() {
    let tx = RecordingTx::new(false);
    let mut info = default_info();
    info.capabilities = DevCapabilities::BURST_MODE;
    let opts = opts(2, "1-2", "3-4")
        .topology(Topology::QueuePerStage)
        .stages(vec![
            SchedType::Atomic,
            SchedType::Parallel,
            SchedType::Ordered,
        ])
        .build()
        .unwrap();
    let stats = run(opts, info, &tx, &forwarder()).unwrap();
    assert_complete(&stats, 2 * NB_PKTS);
    assert_eq!(stats.device.forwarded, 2 * NB_PKTS * 3);
}

#[test]
fn single_event_workers() {
    let tx = RecordingTx::new(true);
    let opts = opts(1, "1-2", "3")
        .burst(false)
        .worker_dequeue_depth(4)
        .build()
        .unwrap();
    let stats = run(opts, default_info(), &tx, &forwarder()).unwrap();
    assert_complete(&stats, NB_PKTS);
}

#[test]
fn distributed_device_needs_no_service_core() {
    let tx = RecordingTx::new(true);
    let mut info = default_info();
    info.capabilities |= DevCapabilities::DISTRIBUTED_SCHED;
    let opts = opts(2, "1-2", "").build().unwrap();
    let stats = run(opts, info, &tx, &forwarder()).unwrap();
    assert_complete(&stats, 2 * NB_PKTS);
}

#[test]
#[traced_test]
fn drain_terminates_after_stop() {
    let tx = RecordingTx::new(false);
    let opts = opts(2, "1-2", "3")
        .nb_pkts(0)
        .stages(vec![SchedType::Ordered, SchedType::Atomic])
        .build()
        .unwrap();
    let mut p = pipeline(opts, default_info(), &tx);
    let stop = Arc::new(AtomicBool::new(false));
    let raise = {
        let stop = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            stop.store(true, Ordering::Relaxed);
        })
    };
    let stats = p.run(&forwarder(), &stop).unwrap();
    raise.join().unwrap();
    assert_eq!(stats.undrained, 0);
    assert_eq!(p.device().inflight(), 0);
    assert!(stats.device.new_events > 0);
    assert_eq!(stats.device.new_events, stats.transmitted() + stats.drops());
    assert_eq!(p.device().state(), DevState::Stopped);
    p.destroy().unwrap();
}

#[test]
fn capability_failure_leaves_device_untouched() {
    let tx = RecordingTx::new(false);
    let mut info = default_info();
    info.max_event_queues = 2;
    let opts = opts(2, "1-2", "3").build().unwrap();
    let mut p = pipeline(opts, info, &tx);
    let err = p.run(&forwarder(), &AtomicBool::new(false)).unwrap_err();
    assert_eq!(err.step, Step::CapabilityCheck);
    assert!(matches!(
        err.error,
        PipelineError::Config(ConfigError::TooManyQueues {
            requested: 3,
            available: 2
        })
    ));
    assert_eq!(p.device().state(), DevState::Unconfigured);
}

#[test]
fn flows_beyond_device_events_rejected_before_configure() {
    let mut info = default_info();
    info.max_num_events = 512;
    let opts = opts(1, "1-2", "3").nb_flows(1000).build().unwrap();
    let mut p = pipeline(opts, info, &RecordingTx::new(true));
    let err = p.run(&forwarder(), &AtomicBool::new(false)).unwrap_err();
    assert_eq!(err.step, Step::CapabilityCheck);
    assert_eq!(
        err.to_string(),
        "capability_check failed: queue 0: 1000 order sequences requested, device supports 512 events"
    );
    assert_eq!(p.device().state(), DevState::Unconfigured);
}

#[test]
fn missing_service_core_fails_configure() {
    let opts = opts(1, "1", "").build().unwrap();
    let tx = RecordingTx::new(true);
    let err = run(opts.clone(), default_info(), &tx, &forwarder())
        .unwrap_err();
    assert_eq!(err.step, Step::Configure);
    assert!(matches!(
        err.error,
        PipelineError::NoServiceCore("event scheduler")
    ));

    let tx = RecordingTx::new(false);
    let err = run(opts, default_info(), &tx, &forwarder()).unwrap_err();
    assert!(matches!(
        err.error,
        PipelineError::NoServiceCore("transmit service")
    ));
}
