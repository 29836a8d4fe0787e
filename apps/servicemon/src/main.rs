use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use logger::{LogFile, LogTarget};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod config;
mod daemon;
mod database;
mod error;
mod monitoring;
mod pool;
#[cfg(test)]
mod testing;

use config::Config;
use daemon::PidLock;
use database::{Datastore, DatastoreGateway, EventWriter, WriterConfig};
use error::DaemonError;
use monitoring::{
    CheckDefaults, CheckExecutor, CheckerRegistry, Controller, ControllerConfig, ResultHandler, RunQueue,
};

/// Service availability monitor
#[derive(Parser)]
#[command(name = "servicemon")]
#[command(about = "Checks network services and reports up/down transitions as events", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/servicemon/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Stay in the foreground and log to stderr
    #[arg(short = 'n', long)]
    foreground: bool,

    /// Seconds between check cycles, overriding the configuration
    #[arg(long, value_name = "SECONDS")]
    check_interval: Option<u64>,

    /// Print the available checkers and exit
    #[arg(long)]
    list_checkers: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_checkers {
        print!("{}", CheckerRegistry::with_builtin());
        return ExitCode::SUCCESS;
    }

    match start(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("servicemon: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Everything that can fail before the scheduling loop runs happens here,
/// while errors still reach the terminal.
fn start(cli: Cli) -> Result<()> {
    let mut config = Config::from_config(cli.config.as_deref())?;
    if let Some(interval) = cli.check_interval {
        config.monitor.check_interval = interval;
    }
    config.validate()?;

    let mut pid_lock = PidLock::acquire(&config.daemon.pidfile)?;

    let log_file = if cli.foreground {
        None
    } else {
        daemon::daemonize(&config.daemon.logfile)?;
        let log_file = LogFile::open(&config.daemon.logfile)
            .map_err(|source| DaemonError::LogFile { path: config.daemon.logfile.clone(), source })?;
        Some(log_file)
    };
    pid_lock.write_pid()?;

    logger::init(log_file.clone().map_or(LogTarget::Stderr, LogTarget::File));
    info!("servicemon {} starting (pid {})", env!("CARGO_PKG_VERSION"), std::process::id());
    debug!("Effective configuration:\n{}", config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("servicemon")
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(run(config, log_file))?;

    drop(pid_lock);
    Ok(())
}

async fn run(config: Config, log_file: Option<LogFile>) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signals = daemon::spawn_signal_handler(shutdown.clone(), log_file)?;

    let gateway: Arc<dyn Datastore> = Arc::new(
        DatastoreGateway::open(&config.database.path)
            .await
            .with_context(|| format!("cannot open datastore {}", config.database.path.display()))?,
    );

    let (events, writer) = EventWriter::channel(
        Arc::clone(&gateway),
        WriterConfig {
            retry_backoff: config.events.retry_backoff(),
            flush_timeout: config.events.flush_timeout(),
            max_pending: config.events.max_pending,
        },
    );
    let writer = writer.spawn();

    let executor = Arc::new(CheckExecutor::new(config.monitor.retry, config.monitor.retry_delay()));
    let run_queue = RunQueue::new(config.monitor.max_workers, executor, ResultHandler::new(events));

    let controller = Controller::new(
        ControllerConfig {
            check_interval: config.monitor.check_interval(),
            terminate_grace: config.monitor.terminate_grace(),
        },
        gateway,
        Arc::new(CheckerRegistry::with_builtin()),
        CheckDefaults { timeout: config.monitor.timeout() },
        run_queue,
        Some(writer),
    );
    controller.run(shutdown.clone()).await;

    shutdown.cancel();
    signals.await.context("signal handler failed")?;
    info!("servicemon stopped");
    Ok(())
}
