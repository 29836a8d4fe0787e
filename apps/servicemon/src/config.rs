use std::{env, fmt, fs, path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound for every duration setting, one day
const MAX_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: Daemon,
    pub monitor: Monitor,
    pub database: Database,
    pub events: Events,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Daemon {
    pub pidfile: path::PathBuf,
    pub logfile: path::PathBuf,
}

/// Scheduling and checker defaults. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Monitor {
    pub check_interval: u64,
    pub max_workers: usize,
    pub timeout: f64,
    pub retry: u32,
    pub retry_delay: f64,
    pub terminate_grace: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: path::PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Events {
    pub retry_backoff: f64,
    pub flush_timeout: u64,
    /// Upper bound on events waiting for a successful commit. Unset means
    /// unbounded.
    pub max_pending: Option<usize>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self { pidfile: "servicemon.pid".into(), logfile: "servicemon.log".into() }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            check_interval: 60,
            max_workers: 50,
            timeout: 10.0,
            retry: 3,
            retry_delay: 5.0,
            terminate_grace: 10,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self { path: "servicemon.db".into() }
    }
}

impl Default for Events {
    fn default() -> Self {
        Self { retry_backoff: 5.0, flush_timeout: 10, max_pending: None }
    }
}

impl Monitor {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_delay)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace)
    }
}

impl Events {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs(self.flush_timeout)
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/servicemon/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("servicemon/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Daemon")?;
        write_1(f, "PID File", &self.daemon.pidfile.display())?;
        write_1(f, "Log File", &self.daemon.logfile.display())?;
        write_title_1(f, "Monitor")?;
        write_1(f, "Check Interval (s)", &self.monitor.check_interval)?;
        write_1(f, "Max Workers", &self.monitor.max_workers)?;
        write_1(f, "Default Timeout (s)", &self.monitor.timeout)?;
        write_1(f, "Confirmation Retries", &self.monitor.retry)?;
        write_1(f, "Retry Delay (s)", &self.monitor.retry_delay)?;
        write_1(f, "Terminate Grace (s)", &self.monitor.terminate_grace)?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_title_1(f, "Events")?;
        write_1(f, "Retry Backoff (s)", &self.events.retry_backoff)?;
        write_1(f, "Flush Timeout (s)", &self.events.flush_timeout)?;
        match self.events.max_pending {
            Some(max) => write_1(f, "Max Pending", &max)?,
            None => write_1(f, "Max Pending", &"unbounded")?,
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/servicemon/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```rust,ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| ConfigError::ParseFailed { path: config_path, source })
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| ConfigError::WriteFailed { path: parent.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| ConfigError::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.check_interval == 0 || self.monitor.check_interval > MAX_SECONDS {
            return Err(ConfigError::Invalid {
                setting: "monitor.check_interval",
                reason: format!("must be between 1 and {MAX_SECONDS} seconds"),
            });
        }
        if self.monitor.max_workers == 0 {
            return Err(ConfigError::Invalid {
                setting: "monitor.max_workers",
                reason: "must be at least 1".into(),
            });
        }
        for (setting, value) in [
            ("monitor.timeout", self.monitor.timeout),
            ("monitor.retry_delay", self.monitor.retry_delay),
            ("events.retry_backoff", self.events.retry_backoff),
        ] {
            if !value.is_finite() || !(0.0..=MAX_SECONDS as f64).contains(&value) {
                return Err(ConfigError::Invalid {
                    setting,
                    reason: format!("{value} is not a number of seconds between 0 and {MAX_SECONDS}"),
                });
            }
        }
        if self.monitor.timeout == 0.0 {
            return Err(ConfigError::Invalid {
                setting: "monitor.timeout",
                reason: "must be greater than zero".into(),
            });
        }
        if self.events.max_pending == Some(0) {
            return Err(ConfigError::Invalid {
                setting: "events.max_pending",
                reason: "must be at least 1 when set".into(),
            });
        }
        Ok(())
    }
}
