use serde::{Deserialize, Serialize};

/// Last known or freshly observed state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Up,
    Down,
    Unknown,
}

impl ServiceStatus {
    /// Parse the `service.up` column (`y` means up).
    pub fn from_db_flag(flag: &str) -> Self {
        if flag.eq_ignore_ascii_case("y") { ServiceStatus::Up } else { ServiceStatus::Down }
    }

    pub fn db_flag(self) -> &'static str {
        match self {
            ServiceStatus::Up => "y",
            ServiceStatus::Down | ServiceStatus::Unknown => "n",
        }
    }

    /// Whether moving from `self` to `next` must be reported.
    ///
    /// A service we know nothing about is presumed up, so only a first
    /// DOWN verdict is news.
    pub fn is_transition(self, next: ServiceStatus) -> bool {
        matches!(
            (self, next),
            (ServiceStatus::Up, ServiceStatus::Down)
                | (ServiceStatus::Down, ServiceStatus::Up)
                | (ServiceStatus::Unknown, ServiceStatus::Down)
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStatus::Up => write!(f, "up"),
            ServiceStatus::Down => write!(f, "down"),
            ServiceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of one checker execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Up or down; never unknown
    pub status: ServiceStatus,

    /// Short human readable diagnostic
    pub info: String,

    /// Software version announced by the service, if any
    pub version: Option<String>,
}

impl Verdict {
    pub fn up(info: impl Into<String>) -> Self {
        Self { status: ServiceStatus::Up, info: info.into(), version: None }
    }

    pub fn down(info: impl Into<String>) -> Self {
        Self { status: ServiceStatus::Down, info: info.into(), version: None }
    }

    pub fn with_version(mut self, version: Option<String>) -> Self {
        self.version = version.filter(|v| !v.trim().is_empty());
        self
    }
}
