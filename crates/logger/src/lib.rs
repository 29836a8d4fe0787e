//! Tracing setup shared by the workspace binaries.

mod file;
mod subscriber;

pub use file::LogFile;
pub use subscriber::{LogTarget, init, init_tracing};
