pub mod cgroup;
pub mod config;
pub mod error;
pub mod gate;
pub mod isolated;
pub mod namespace;
pub mod rootfs;
pub mod runtime;

// Re-export main types and functions for easier testing
pub use cgroup::{CgroupLimiter, ResourceLimiter};
pub use config::{CgroupConfig, IsolationConfig, LaunchPolicy, LaunchRequest, RootSwitch};
pub use error::{GateError, IsolationError, LaunchError, LimiterError};
pub use isolated::{HostIsolation, run_isolated};
pub use runtime::{Launcher, run_container};
