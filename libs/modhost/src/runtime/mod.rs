//! Process-level orchestration: host runtime, runner entry point, shutdown
//! signal plumbing.

pub mod host_runtime;
pub mod runner;
pub mod shutdown;

pub use host_runtime::{HostError, HostRuntime};
pub use runner::{run, RunOptions, ShutdownOptions};
