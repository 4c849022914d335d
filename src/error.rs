use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::unistd::Pid;
use thiserror::Error;

/// Failures of the launcher role.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("synchronization gate: {0}")]
    Gate(#[from] GateError),

    #[error("failed to spawn isolated child: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Limiter(#[from] LimiterError),

    #[error("failed to wait for child {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("child {pid} still running after {limit:?}, killed")]
    Timeout { pid: Pid, limit: Duration },
}

impl LaunchError {
    /// Exit code the launcher reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            LaunchError::Usage(_) => 2,
            LaunchError::Timeout { .. } => 124,
            _ => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum LimiterError {
    #[error("failed to create cgroup {path}: {source}")]
    CreateGroup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write process ceiling {path}: {source}")]
    Ceiling {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to add pid {pid} to {path}: {source}")]
    Membership {
        path: PathBuf,
        pid: Pid,
        #[source]
        source: io::Error,
    },

    #[error("failed to remove cgroup {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum GateError {
    #[error("failed to create pipe: {0}")]
    Create(#[source] io::Error),

    #[error("no gate descriptor inherited on fd {0}")]
    NotInherited(RawFd),

    #[error("failed to install gate descriptor: {0}")]
    Install(#[source] nix::Error),

    #[error("gate I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures inside the isolated child. Every one of them ends the child
/// with status 1.
#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("waiting for release: {0}")]
    Gate(#[from] GateError),

    #[error("sethostname failed: {0}")]
    Hostname(#[source] nix::Error),

    #[error("failed to switch root to {path}: {source}")]
    RootSwitch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to create proc directory: {0}")]
    ProcDir(#[source] io::Error),

    #[error("failed to mount proc: {0}")]
    MountProc(#[source] nix::Error),

    #[error("exec {program} failed: {source}")]
    Exec {
        program: String,
        #[source]
        source: nix::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] std::ffi::NulError),
}
