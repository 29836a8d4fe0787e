use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{
    Layer,
    filter::EnvFilter,
    fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::LogFile;

/// Where formatted log lines end up.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stderr,
    File(LogFile),
}

pub fn init_tracing() {
    init(LogTarget::Stderr);
}

pub fn init(target: LogTarget) {
    initialize_tracing(LevelFilter::INFO, target);
}

/// Initialize tracing subscriber with default configuration.
///
/// `RUST_LOG` overrides the default level, `RUST_LOG_FORMAT=json` switches to
/// one JSON object per line. Lines written to a file keep their timestamps.
fn initialize_tracing(level: LevelFilter, target: LogTarget) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
        })
        .unwrap_or_default();

    let (writer, timestamps) = match target {
        LogTarget::Stderr => (BoxMakeWriter::new(std::io::stderr), false),
        LogTarget::File(file) => (BoxMakeWriter::new(file), true),
    };

    let log_layer = match (log_format.as_str(), timestamps) {
        ("json", _) => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(env_filter)
            .boxed(),
        (_, true) => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(env_filter)
            .boxed(),
        (_, false) => tracing_subscriber::fmt::layer()
            .compact()
            .without_time()
            .with_writer(writer)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}
