// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Service cores: lcores dedicated to running registered services in a loop.

use crate::lcore::{LCoreId, LCoreSet, WorkerThread, WorkerThreadLaunchError};
use core::fmt::Display;
use crossbeam_utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

/// A task run repeatedly by a service core.
pub trait Service: Send {
    fn name(&self) -> &str;

    /// Run one iteration; returns the amount of work done (0 when idle).
    fn run(&mut self) -> usize;
}

#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceId(u32);

impl Display for ServiceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("no service lcore available")]
    NoServiceCore,
    #[error("lcore {0} is not a service lcore")]
    NotAServiceCore(LCoreId),
    #[error("unknown service {0}")]
    UnknownService(ServiceId),
    #[error("service cores are already running")]
    AlreadyStarted,
    #[error(transparent)]
    Launch(#[from] WorkerThreadLaunchError),
    #[error("service lcore {0} panicked")]
    Panicked(LCoreId),
}

struct Registered {
    id: ServiceId,
    name: String,
    lcore: LCoreId,
    runstate: Arc<AtomicBool>,
    service: Option<Box<dyn Service>>,
}

/// The set of service lcores and the services mapped onto them.
///
/// A registered service only runs while both the service cores are started and its
/// runstate is set.
pub struct ServiceCores {
    lcores: LCoreSet,
    services: Vec<Registered>,
    stop: Arc<AtomicBool>,
    threads: Vec<WorkerThread>,
}

impl core::fmt::Debug for ServiceCores {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServiceCores")
            .field("lcores", &self.lcores)
            .field("services", &self.services.len())
            .field("running", &!self.threads.is_empty())
            .finish_non_exhaustive()
    }
}

impl ServiceCores {
    #[must_use]
    pub fn new(lcores: LCoreSet) -> Self {
        Self {
            lcores,
            services: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    #[must_use]
    pub fn lcores(&self) -> &LCoreSet {
        &self.lcores
    }

    /// The service lcore with the fewest services mapped to it.
    #[must_use]
    pub fn pick_core(&self) -> Option<LCoreId> {
        self.lcores
            .iter()
            .min_by_key(|&lcore| self.services.iter().filter(|s| s.lcore == lcore).count())
    }

    /// Map `service` onto `lcore`. The service starts with its runstate off.
    #[tracing::instrument(level = "debug", skip(self, service), fields(service = service.name()))]
    pub fn register_service(
        &mut self,
        service: Box<dyn Service>,
        lcore: LCoreId,
    ) -> Result<ServiceId, ServiceError> {
        if !self.threads.is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }
        if !self.lcores.contains(lcore) {
            return Err(ServiceError::NotAServiceCore(lcore));
        }
        #[allow(clippy::cast_possible_truncation)]
        let id = ServiceId(self.services.len() as u32);
        debug!("service {id} '{}' mapped to lcore {lcore}", service.name());
        self.services.push(Registered {
            id,
            name: service.name().to_string(),
            lcore,
            runstate: Arc::new(AtomicBool::new(false)),
            service: Some(service),
        });
        Ok(id)
    }

    fn get(&self, id: ServiceId) -> Result<&Registered, ServiceError> {
        self.services
            .get(id.0 as usize)
            .ok_or(ServiceError::UnknownService(id))
    }

    pub fn set_runstate(&self, id: ServiceId, running: bool) -> Result<(), ServiceError> {
        let svc = self.get(id)?;
        debug!("service {} '{}' runstate {running}", svc.id, svc.name);
        svc.runstate.store(running, Ordering::Release);
        Ok(())
    }

    pub fn runstate(&self, id: ServiceId) -> Result<bool, ServiceError> {
        Ok(self.get(id)?.runstate.load(Ordering::Acquire))
    }

    /// Spawn one thread per service lcore that has services mapped.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn start(&mut self) -> Result<(), ServiceError> {
        if !self.threads.is_empty() {
            return Err(ServiceError::AlreadyStarted);
        }
        self.stop.store(false, Ordering::Release);
        for lcore in self.lcores.clone().iter() {
            let mut mapped: Vec<(Box<dyn Service>, Arc<AtomicBool>)> = self
                .services
                .iter_mut()
                .filter(|s| s.lcore == lcore)
                .filter_map(|s| Some((s.service.take()?, s.runstate.clone())))
                .collect();
            if mapped.is_empty() {
                continue;
            }
            let stop = self.stop.clone();
            let thread = WorkerThread::spawn(format!("service-{lcore}"), lcore, move || {
                let backoff = Backoff::new();
                while !stop.load(Ordering::Acquire) {
                    let mut work = 0;
                    for (service, runstate) in &mut mapped {
                        if runstate.load(Ordering::Acquire) {
                            work += service.run();
                        }
                    }
                    if work == 0 {
                        backoff.snooze();
                    } else {
                        backoff.reset();
                    }
                }
            })?;
            info!("service lcore {lcore} started");
            self.threads.push(thread);
        }
        Ok(())
    }

    /// Stop and join every service lcore. Services are dropped with their threads.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn stop(&mut self) -> Result<(), ServiceError> {
        self.stop.store(true, Ordering::Release);
        let mut res = Ok(());
        for thread in self.threads.drain(..) {
            let lcore = thread.lcore_id();
            if thread.join().is_err() {
                error!("service lcore {lcore} panicked");
                res = Err(ServiceError::Panicked(lcore));
            }
        }
        res
    }
}

impl Drop for ServiceCores {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let _ = self.stop();
        }
    }
}
