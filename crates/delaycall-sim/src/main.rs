#![doc = include_str!("../README.md")]

mod sim;

use clap::Parser;
use delaycall::{Dispatcher, MonitoredSink, RunSummary};
use futures::StreamExt;
use sim::config::{CliArgs, SimConfig};
use sim::recorder::{EventReport, record_events};
use sim::service::SimulatedService;
use sim::telemetry::{self, init_telemetry};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = SimConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let service = SimulatedService::new(config.max_service, config.failure_one_in);
    let sink = MonitoredSink::new(service, config.ordering);
    let dispatcher = Dispatcher::new(config.delay.clone(), sink)?;
    let recorder = tokio::spawn(record_events(dispatcher.subscribe()));

    let stop = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(stop.clone()));

    let source = sim::source::open(&config.source)
        .await?
        .take_until(stop.clone().cancelled_owned())
        .inspect(|_| telemetry::increment_requests());
    let summary = dispatcher.run(source).await?;
    telemetry::record_rejected(summary.rejected);
    signal_task.abort();

    #[cfg(feature = "tracing")]
    tracing::info!("Request source exhausted, waiting for workers to retire...");

    let shutdown = dispatcher.shutdown().await;
    let verification = dispatcher.sink().verify();
    let stats = dispatcher.stats();
    drop(dispatcher);

    // Workers still running after a timed-out shutdown keep the event channel
    // open, so only wait on the recorder after a clean shutdown.
    let report = if shutdown.is_ok() {
        Some(recorder.await?)
    } else {
        recorder.abort();
        None
    };

    print_summary(&summary, report.as_ref());
    #[cfg(feature = "tracing")]
    tracing::info!(?stats, "Simulation finished");
    #[cfg(not(feature = "tracing"))]
    let _ = stats;

    providers.shutdown();

    shutdown?;
    verification?;
    Ok(())
}

fn log_startup_info(_config: &SimConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting simulation with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting simulation with a {:?} window and {:?} ordering checks",
            _config.delay.window,
            _config.ordering
        );
    }
}

fn print_summary(summary: &RunSummary, report: Option<&EventReport>) {
    println!(
        "requests: {} accepted, {} rejected",
        summary.accepted, summary.rejected
    );
    println!(
        "routing:  {} direct, {} spawned a worker, {} forwarded",
        summary.direct, summary.spawned, summary.forwarded
    );
    if let Some(report) = report {
        println!(
            "executed: {} direct, {} delayed, {} failed",
            report.direct, report.delayed, report.failures
        );
        println!(
            "workers:  {} spawned, {} retired, peak {} concurrent",
            report.workers_spawned, report.workers_retired, report.peak_workers
        );
        if report.lagged > 0 {
            println!("events:   {} dropped by a lagging consumer", report.lagged);
        }
    }
}

/// Cancels `stop` on Ctrl+C or SIGTERM so the source ends and the dispatcher
/// shuts down gracefully.
async fn shutdown_signal(stop: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    stop.cancel();
}
