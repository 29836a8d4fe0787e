//! Process lifecycle: singleton lock, daemonisation and signals.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use daemonize::Daemonize;
use fs2::FileExt;
use logger::LogFile;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::DaemonError;

/// Exclusive lock on the PID file, held for the life of the process.
///
/// The file is removed again when the lock is dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    file: File,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self, DaemonError> {
        let pid_error = |source| DaemonError::PidFile { path: path.to_path_buf(), source };
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path).map_err(pid_error)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                let pid = fs::read_to_string(path).ok().and_then(|text| text.trim().parse().ok());
                return Err(DaemonError::AlreadyRunning { pid });
            }
            return Err(pid_error(e));
        }

        Ok(Self { path: path.to_path_buf(), file })
    }

    /// Record the current process id; call again after forking.
    pub fn write_pid(&mut self) -> Result<(), DaemonError> {
        rewrite(&mut self.file, std::process::id())
            .map_err(|source| DaemonError::PidFile { path: self.path.clone(), source })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn rewrite(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{pid}")?;
    file.flush()
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            error!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// Detach from the terminal.
///
/// Must run before the async runtime is built. Standard output and error
/// are appended to `logfile`; the working directory is kept so relative
/// paths in the configuration stay valid.
pub fn daemonize(logfile: &Path) -> Result<(), DaemonError> {
    let open = || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile)
            .map_err(|source| DaemonError::LogFile { path: logfile.to_path_buf(), source })
    };
    let cwd = std::env::current_dir().map_err(|e| DaemonError::Daemonize(e.to_string()))?;

    Daemonize::new()
        .working_directory(cwd)
        .stdout(open()?)
        .stderr(open()?)
        .start()
        .map_err(|e| DaemonError::Daemonize(e.to_string()))
}

/// Translate signals into lifecycle actions.
///
/// SIGTERM and SIGINT cancel `shutdown`; SIGHUP re-opens the log file.
pub fn spawn_signal_handler(
    shutdown: CancellationToken,
    log_file: Option<LogFile>,
) -> Result<JoinHandle<()>, DaemonError> {
    let mut terminate = signal(SignalKind::terminate()).map_err(DaemonError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(DaemonError::Signal)?;
    let mut hangup = signal(SignalKind::hangup()).map_err(DaemonError::Signal)?;

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = terminate.recv() => {
                    info!("Received SIGTERM, shutting down");
                    break;
                }
                _ = interrupt.recv() => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = hangup.recv() => reopen_log(log_file.as_ref()),
            }
        }
        shutdown.cancel();
    }))
}

fn reopen_log(log_file: Option<&LogFile>) {
    match log_file {
        Some(log_file) => match log_file.reopen() {
            Ok(()) => info!("Reopened log file {}", log_file.path().display()),
            Err(e) => error!("Failed to reopen log file {}: {}", log_file.path().display(), e),
        },
        None => info!("Received SIGHUP, logging to stderr, nothing to reopen"),
    }
}
