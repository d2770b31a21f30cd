use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info, warn};
use syslog::{BasicLogger, Facility, Formatter3164};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use traind::{
    agent::{BrokerOverride, EdgeAgent},
    cli::Cli,
    config::{ConfigLoader, ServiceConfig},
    config_manager::ConfigManager,
    registration::{DeviceIdentity, RegistrationClient},
    retry::TokioSleeper,
};

/// Plain stderr logger for foreground runs.
struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

fn level_filter(name: &str) -> LevelFilter {
    match name {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            eprintln!("Unknown log level {other:?}, defaulting to info");
            LevelFilter::Info
        }
    }
}

fn init_log(level: &str, daemonized: bool) -> Result<()> {
    let filter = level_filter(level);

    if daemonized {
        let logger = syslog::unix(Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: "traind".into(),
            pid: 0,
        })
        .map_err(|e| anyhow!("syslog init: {e}"))?;
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))?;
    } else {
        log::set_boxed_logger(Box::new(StderrLogger))?;
    }

    log::set_max_level(filter);
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives. Both matter: a foreground run
/// is interrupted from the terminal, while a daemonized one has no
/// controlling terminal and is stopped with SIGTERM by the service
/// manager. Missing the latter would skip hardware cleanup with the
/// outputs still driving a train.
async fn shutdown_signal() -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = term.recv() => Ok(()),
    }
}

fn into_daemon() -> Result<()> {
    Daemonize::new()
        .start()
        .map_err(|e| anyhow!("daemonize: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::new(cli.config.clone(), cli.cache.clone());
    let service = loader
        .load_service_config()
        .context("loading service config")?;

    init_log(&service.log_level, cli.daemonize)?;

    // Fork before the runtime spawns any threads.
    if cli.daemonize {
        into_daemon()?;
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(cli, loader, service))
}

async fn run(cli: Cli, loader: ConfigLoader, service: ServiceConfig) -> Result<()> {
    info!(
        "traind starting, control plane at {}",
        service.control_plane_url()
    );

    let client = RegistrationClient::new(&service)?;
    let identity = DeviceIdentity::detect();
    if identity.address == "unknown" {
        warn!("Could not detect a local address; registering as \"unknown\"");
    }

    let manager = ConfigManager::new(client, loader, identity);
    let agent = EdgeAgent::new(
        manager,
        Arc::new(TokioSleeper),
        cli.simulator,
        BrokerOverride {
            host: cli.broker_host,
            port: cli.broker_port,
        },
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signals: {e}"),
        }
    });

    agent.run(shutdown).await?;
    info!("traind stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(level_filter("verbose"), LevelFilter::Info);
        assert_eq!(level_filter("debug"), LevelFilter::Debug);
        assert_eq!(level_filter("error"), LevelFilter::Error);
    }

    #[tokio::test]
    async fn sigterm_resolves_the_shutdown_future() {
        let waiter = tokio::spawn(shutdown_signal());

        // Let the handler install before the signal is raised; tokio's
        // registry then swallows the SIGTERM instead of killing the test.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = std::process::Command::new("kill")
            .args(["-s", "TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(delivered.success());

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("shutdown future did not resolve on SIGTERM")
            .unwrap()
            .unwrap();
    }
}
