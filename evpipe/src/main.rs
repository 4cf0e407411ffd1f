// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all, clippy::pedantic)]

use args::{CmdArgs, Parser};
use eventdev::service::ServiceCores;
use eventdev::sw::SwEventDev;
use miette::{Context, IntoDiagnostic};
use pipeline::sample::{Forwarder, Packet, RecordingTx, SyntheticRx};
use pipeline::{HandlerFactory, Pipeline, PipelineOpts};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

fn init_logging(level: tracing::Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() -> miette::Result<()> {
    let args = CmdArgs::parse();
    init_logging(args.log_level());
    let opts = PipelineOpts::try_from(args)?;
    info!(" ━━━━━━ evpipe started ━━━━━━");

    let stop = Arc::new(AtomicBool::new(false));
    let ctrlc_stop = stop.clone();
    ctrlc::set_handler(move || {
        ctrlc_stop.store(true, Ordering::Relaxed);
    })
    .into_diagnostic()
    .wrap_err("failed to set SIGINT handler")?;

    let tx = RecordingTx::new(true);
    let rx = SyntheticRx::new(opts.nb_pkts);
    let service_cores = ServiceCores::new(opts.service_lcores.clone());
    let mut pipeline = Pipeline::new(
        SwEventDev::<Packet>::new(),
        opts,
        Arc::new(tx.clone()),
        Box::new(rx),
        service_cores,
    );
    let factory: HandlerFactory<Packet> = Arc::new(|_| Box::new(Forwarder));

    let stats = pipeline
        .run(&factory, &stop)
        .into_diagnostic()
        .wrap_err("pipeline run failed")?;
    pipeline
        .destroy()
        .into_diagnostic()
        .wrap_err("pipeline teardown failed")?;

    if stats.undrained > 0 {
        warn!("{} events were still in flight at stop", stats.undrained);
    }
    stats.log_summary();
    info!(
        "{} events transmitted by {} distinct transmit callers",
        tx.sent(),
        tx.callers().len()
    );
    let report = serde_yaml_ng::to_string(&stats).into_diagnostic()?;
    println!("{report}");
    Ok(())
}
