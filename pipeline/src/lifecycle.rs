// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The lifecycle controller.
//!
//! A [`Pipeline`] walks a fixed order of steps: option and capability checks, device
//! configuration, device start, transmit service activation, worker launch, drain, stop and
//! destroy. Any failing step aborts the ones after it and is reported as a [`LifecycleError`]
//! naming the step.

use crate::capability::check_capabilities;
use crate::error::{AtStep, LifecycleError, PipelineError, Step};
use crate::opts::PipelineOpts;
use crate::setup::{self, Ports};
use crate::stage::HandlerFactory;
use crate::stats::{Stats, TxServiceCounters, TxServiceStats, WorkerCounters, WorkerStats};
use crate::topology::TopologyPlan;
use crate::tx_service::TxService;
use crate::worker::{Sink, Worker, WorkerParams};
use eventdev::adapter::RxAdapter;
use eventdev::lcore::{LCoreId, WorkerThread};
use eventdev::service::{ServiceCores, ServiceId};
use eventdev::tx::TxPath;
use eventdev::{EventDevice, EventPort, PortId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between two drain polls of the device in-flight count.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_micros(100);
/// Drain polls allowed per event the device may hold.
const DRAIN_POLLS_PER_EVENT: u32 = 4;
const MIN_DRAIN_POLLS: u32 = 1024;
/// Interval between two checks of the stop signal in [`Pipeline::run`].
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Copy, Clone, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
enum State {
    New,
    Checked,
    Configured,
    Started,
    Running,
    Stopped,
    Destroyed,
}

struct WorkerHandle {
    lcore: LCoreId,
    port: PortId,
    counters: Arc<WorkerCounters>,
    thread: WorkerThread,
}

/// A staged, flow-aware event pipeline over an event device `D` carrying payloads `P`.
pub struct Pipeline<D, P>
where
    D: EventDevice<P>,
    P: Send + 'static,
{
    dev: D,
    opts: PipelineOpts,
    tx_path: Arc<dyn TxPath<P>>,
    adapter: Box<dyn RxAdapter<P>>,
    service_cores: ServiceCores,
    state: State,
    plan: Option<Arc<TopologyPlan>>,
    worker_ports: Vec<D::Port>,
    scheduler: Option<ServiceId>,
    tx_service: Option<(ServiceId, PortId, Arc<TxServiceCounters>)>,
    workers: Vec<WorkerHandle>,
    finished: Vec<WorkerStats>,
    stop: Arc<AtomicBool>,
}

impl<D, P> Pipeline<D, P>
where
    D: EventDevice<P>,
    P: Send + 'static,
{
    pub fn new(
        dev: D,
        opts: PipelineOpts,
        tx_path: Arc<dyn TxPath<P>>,
        adapter: Box<dyn RxAdapter<P>>,
        service_cores: ServiceCores,
    ) -> Self {
        Self {
            dev,
            opts,
            tx_path,
            adapter,
            service_cores,
            state: State::New,
            plan: None,
            worker_ports: Vec::new(),
            scheduler: None,
            tx_service: None,
            workers: Vec::new(),
            finished: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn opts(&self) -> &PipelineOpts {
        &self.opts
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// The plan computed by [`Pipeline::check`].
    #[must_use]
    pub fn plan(&self) -> Option<&TopologyPlan> {
        self.plan.as_deref()
    }

    fn expect(&self, step: Step, expected: State) -> Result<(), LifecycleError> {
        if self.state == expected {
            return Ok(());
        }
        Err(LifecycleError::new(
            step,
            PipelineError::InvalidState {
                expected: expected.into(),
                actual: self.state.into(),
            },
        ))
    }

    /// Validate the options, plan the topology and check it fits the device.
    ///
    /// Nothing is done to the device; a failure here is a static misconfiguration.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn check(&mut self) -> Result<&TopologyPlan, LifecycleError> {
        self.expect(Step::OptionCheck, State::New)?;
        self.opts.check().at(Step::OptionCheck)?;
        let unsafe_tx = self.opts.mt_unsafe || !self.tx_path.mt_safe();
        let plan = self
            .opts
            .topology
            .plan(
                self.opts.nb_sources,
                self.opts.nb_workers(),
                unsafe_tx,
                &self.opts.stages,
                self.opts.nb_flows,
            )
            .at(Step::Plan)?;
        let info = self.dev.info();
        check_capabilities(&plan, &info, self.opts.worker_dequeue_depth)
            .at(Step::CapabilityCheck)?;
        for line in plan.to_string().lines() {
            info!("{line}");
        }
        self.state = State::Checked;
        Ok(self.plan.insert(Arc::new(plan)))
    }

    /// Configure the device according to the plan, wire the receive sources and register
    /// the services.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn configure(&mut self) -> Result<(), LifecycleError> {
        self.expect(Step::Configure, State::Checked)?;
        let plan = self.plan.clone().ok_or_else(|| {
            LifecycleError::new(
                Step::Configure,
                PipelineError::InvalidState {
                    expected: State::Checked.into(),
                    actual: self.state.into(),
                },
            )
        })?;
        let Ports {
            workers,
            tx_service,
        } = setup::configure(&mut self.dev, &plan, self.opts.worker_dequeue_depth)
            .at(Step::Configure)?;
        self.worker_ports = workers;

        if let Some(port) = tx_service {
            let counters = Arc::new(TxServiceCounters::default());
            let port_id = port.id();
            let service = TxService::new(
                port,
                self.tx_path.handle(),
                usize::from(self.dev.info().max_event_port_dequeue_depth),
                self.opts.enq_retries,
                counters.clone(),
            );
            let id = setup::register_service(
                &mut self.service_cores,
                Box::new(service),
                "transmit service",
            )
            .at(Step::Configure)?;
            self.tx_service = Some((id, port_id, counters));
        }

        setup::bind_sources(&self.dev, &plan, self.adapter.as_mut()).at(Step::Configure)?;
        self.scheduler =
            setup::register_scheduler(&self.dev, &mut self.service_cores).at(Step::Configure)?;
        self.state = State::Configured;
        Ok(())
    }

    /// Start the device and the service cores; the scheduler (if any) starts running.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        self.expect(Step::Start, State::Configured)?;
        self.dev.start().at(Step::Start)?;
        self.service_cores.start().at(Step::Start)?;
        if let Some(id) = self.scheduler {
            self.service_cores.set_runstate(id, true).at(Step::Start)?;
        }
        self.state = State::Started;
        Ok(())
    }

    /// Set the transmit service running, before any worker can send it final events.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn activate_services(&mut self) -> Result<(), LifecycleError> {
        self.expect(Step::ActivateService, State::Started)?;
        if let Some((id, _, _)) = &self.tx_service {
            self.service_cores
                .set_runstate(*id, true)
                .at(Step::ActivateService)?;
        }
        Ok(())
    }

    /// Launch one worker per worker lcore, each with its own port and handler, then start
    /// the receive adapter.
    #[tracing::instrument(level = "info", skip_all)]
    pub fn launch_workers(&mut self, factory: &HandlerFactory<P>) -> Result<(), LifecycleError> {
        self.expect(Step::LaunchWorkers, State::Started)?;
        let tx_idle = match &self.tx_service {
            Some((id, _, _)) => !self.service_cores.runstate(*id).at(Step::LaunchWorkers)?,
            None => false,
        };
        if tx_idle {
            self.activate_services()?;
        }
        let Some(plan) = self.plan.clone() else {
            return Err(LifecycleError::new(
                Step::LaunchWorkers,
                PipelineError::InvalidState {
                    expected: State::Started.into(),
                    actual: self.state.into(),
                },
            ));
        };
        let info = self.dev.info();
        let depth = if self.opts.burst && info.has_burst_mode() {
            usize::from(
                self.opts
                    .worker_dequeue_depth
                    .unwrap_or(info.max_event_port_dequeue_depth),
            )
        } else {
            1
        };
        let params = WorkerParams {
            dequeue_depth: depth,
            deq_polls: self.opts.deq_polls,
            retries: self.opts.enq_retries,
        };
        debug!("worker dequeue depth {depth}");

        let lcores: Vec<LCoreId> = self.opts.worker_lcores.iter().collect();
        for (index, (lcore, port)) in lcores
            .into_iter()
            .zip(std::mem::take(&mut self.worker_ports))
            .enumerate()
        {
            let sink = match plan.tx_queue {
                Some(queue) => Sink::TxQueue(queue),
                None => Sink::Direct(self.tx_path.handle()),
            };
            let counters = Arc::new(WorkerCounters::default());
            let port_id = port.id();
            let worker = Worker::new(
                index,
                port,
                plan.clone(),
                factory(index),
                sink,
                params,
                counters.clone(),
                self.stop.clone(),
            );
            let thread = WorkerThread::launch(lcore, move || worker.run()).at(Step::LaunchWorkers)?;
            self.workers.push(WorkerHandle {
                lcore,
                port: port_id,
                counters,
                thread,
            });
        }
        info!("{} workers launched", self.workers.len());
        self.adapter.start().at(Step::LaunchWorkers)?;
        self.state = State::Running;
        Ok(())
    }

    /// Events that left the pipeline so far: transmitted, dropped, or consumed by a handler.
    #[must_use]
    pub fn completed(&self) -> u64 {
        let workers: u64 = self
            .workers
            .iter()
            .map(|w| {
                let c = &w.counters;
                c.transmitted.load(Ordering::Relaxed)
                    + c.tx_drops.load(Ordering::Relaxed)
                    + c.enqueue_drops.load(Ordering::Relaxed)
                    + c.handler_drops.load(Ordering::Relaxed)
            })
            .sum();
        let tx = self.tx_service.as_ref().map_or(0, |(_, _, c)| {
            c.transmitted.load(Ordering::Relaxed) + c.tx_drops.load(Ordering::Relaxed)
        });
        workers + tx
    }

    fn join_workers(&mut self) -> Result<(), PipelineError> {
        self.stop.store(true, Ordering::Release);
        let mut res = Ok(());
        for worker in self.workers.drain(..) {
            let lcore = worker.lcore;
            if worker.thread.join().is_err() {
                error!("worker on lcore {lcore} panicked");
                res = Err(PipelineError::WorkerPanicked(lcore));
            }
            self.finished
                .push(WorkerStats::new(lcore, worker.port, &worker.counters));
        }
        res
    }

    /// Wait for the device to be empty; returns the events still in flight on timeout.
    fn drain(&self) -> u32 {
        let budget = self
            .dev
            .info()
            .max_num_events
            .saturating_mul(DRAIN_POLLS_PER_EVENT)
            .max(MIN_DRAIN_POLLS);
        let mut inflight = self.dev.inflight();
        let mut polls = 0;
        while inflight > 0 && polls < budget {
            std::thread::sleep(DRAIN_POLL_INTERVAL);
            polls += 1;
            let now = self.dev.inflight();
            if now < inflight {
                debug!("draining: {now} events in flight");
            }
            inflight = now;
        }
        if inflight > 0 {
            warn!("drain gave up after {polls} polls with {inflight} events in flight");
        } else {
            info!("drained after {polls} polls");
        }
        inflight
    }

    /// Stop receiving, let the in-flight events finish, stop the tasks and the device.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn stop_and_drain(&mut self) -> Result<Stats, LifecycleError> {
        if !matches!(self.state, State::Running | State::Started) {
            return Err(LifecycleError::new(
                Step::Drain,
                PipelineError::InvalidState {
                    expected: State::Running.into(),
                    actual: self.state.into(),
                },
            ));
        }
        self.adapter.stop().at(Step::Drain)?;
        self.dev.stop_new_events();
        let undrained = self.drain();

        self.join_workers().at(Step::Stop)?;
        self.service_cores.stop().at(Step::Stop)?;
        self.dev.stop().at(Step::Stop)?;
        self.state = State::Stopped;

        let stats = Stats {
            workers: std::mem::take(&mut self.finished),
            tx_service: self
                .tx_service
                .as_ref()
                .map(|(_, port, c)| TxServiceStats::new(*port, c)),
            device: self.dev.stats(),
            undrained,
        };
        stats.publish();
        Ok(stats)
    }

    /// Release the device.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn destroy(mut self) -> Result<(), LifecycleError> {
        self.expect(Step::Destroy, State::Stopped)?;
        self.dev.close().at(Step::Destroy)?;
        self.state = State::Destroyed;
        Ok(())
    }

    /// Run every step in order with handlers from `factory`, until `stop` is raised or every
    /// generated event has left the pipeline.
    pub fn run(
        &mut self,
        factory: &HandlerFactory<P>,
        stop: &AtomicBool,
    ) -> Result<Stats, LifecycleError> {
        self.opts.dump();
        self.check()?;
        self.configure()?;
        self.start()?;
        self.activate_services()?;
        self.launch_workers(factory)?;
        let expected = self
            .opts
            .nb_pkts
            .saturating_mul(u64::from(self.opts.nb_sources));
        while !stop.load(Ordering::Relaxed) {
            if expected > 0 && self.completed() >= expected {
                info!("all {expected} events completed");
                break;
            }
            std::thread::sleep(RUN_POLL_INTERVAL);
        }
        self.stop_and_drain()
    }
}

impl<D, P> Drop for Pipeline<D, P>
where
    D: EventDevice<P>,
    P: Send + 'static,
{
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!("pipeline dropped with workers running, stopping them");
            let _ = self.adapter.stop();
            let _ = self.join_workers();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::ConfigError;
    use crate::sample::{Forwarder, Packet, RecordingTx, SyntheticRx};
    use eventdev::lcore::LCoreSet;
    use eventdev::sw::SwEventDev;

    fn opts(workers: &str, services: &str) -> PipelineOpts {
        PipelineOpts::builder()
            .worker_lcores(workers.parse::<LCoreSet>().unwrap())
            .service_lcores(services.parse::<LCoreSet>().unwrap())
            .nb_pkts(64)
            .build()
            .unwrap()
    }

    fn pipeline(opts: PipelineOpts, mt_safe: bool) -> Pipeline<SwEventDev<Packet>, Packet> {
        let service_cores = ServiceCores::new(opts.service_lcores.clone());
        Pipeline::new(
            SwEventDev::new(),
            opts,
            Arc::new(RecordingTx::new(mt_safe)),
            Box::new(SyntheticRx::new(64)),
            service_cores,
        )
    }

    #[test]
    fn steps_run_in_order() {
        let mut p = pipeline(opts("1", "2"), true);
        let err = p.configure().unwrap_err();
        assert_eq!(err.step, Step::Configure);
        assert!(matches!(err.error, PipelineError::InvalidState { .. }));
        assert!(p.check().is_ok());
        assert!(matches!(
            p.start(),
            Err(LifecycleError {
                step: Step::Start,
                ..
            })
        ));
    }

    #[test]
    fn option_errors_name_the_step() {
        let mut bad = opts("1", "2");
        bad.stages.clear();
        let err = pipeline(bad, true).check().unwrap_err();
        assert_eq!(err.step, Step::OptionCheck);
        assert!(matches!(
            err.error,
            PipelineError::Config(ConfigError::NoStages)
        ));
    }

    #[test]
    fn unsafe_transmit_path_reserves_a_service_port() {
        let mut p = pipeline(opts("1-2", "3"), false);
        let plan = p.check().unwrap();
        assert_eq!(plan.port_count(), 3);
        assert!(plan.unsafe_tx());
        let mut safe = pipeline(opts("1-2", "3"), true);
        assert!(!safe.check().unwrap().unsafe_tx());
    }

    #[test]
    fn single_event_run() {
        let mut p = pipeline(opts("1", "2"), true);
        let factory: HandlerFactory<Packet> = Arc::new(|_| Box::new(Forwarder));
        let stop = AtomicBool::new(false);
        let stats = p.run(&factory, &stop).unwrap();
        assert_eq!(stats.transmitted(), 64);
        assert_eq!(stats.undrained, 0);
        p.destroy().unwrap();
    }
}
