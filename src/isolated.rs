//! The `isolated-child` role: runs inside the fresh namespaces, waits for the
//! launcher's release, finishes isolation and replaces itself with the
//! requested program.

use std::convert::Infallible;
use std::fmt;
use std::fs;
use std::path::Path;

use log::{debug, warn};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{execvp, sethostname};

use crate::config::{IsolationConfig, LaunchRequest, RootSwitch};
use crate::error::IsolationError;
use crate::gate::{GateSink, Release};
use crate::rootfs;

const PROC_DIR: &str = "/proc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitingForSignal,
    SettingHostname,
    SwitchingRoot,
    MountingProcFs,
    Exec,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::WaitingForSignal => "waiting for signal",
            Stage::SettingHostname => "setting hostname",
            Stage::SwitchingRoot => "switching root",
            Stage::MountingProcFs => "mounting proc",
            Stage::Exec => "exec",
        };
        f.write_str(name)
    }
}

/// Host operations the child performs after release.
#[cfg_attr(test, mockall::automock)]
pub trait Isolation {
    fn set_hostname(&mut self, hostname: &str) -> Result<(), IsolationError>;
    fn switch_root(&mut self, rootfs: &Path, mode: RootSwitch) -> Result<(), IsolationError>;
    fn mount_proc(&mut self) -> Result<(), IsolationError>;
    fn unmount_proc(&mut self);
    /// Replaces the process image. Only returns on failure.
    fn exec(&mut self, request: &LaunchRequest) -> IsolationError;
}

/// Isolation through the real syscalls.
#[derive(Debug, Default)]
pub struct HostIsolation;

impl Isolation for HostIsolation {
    fn set_hostname(&mut self, hostname: &str) -> Result<(), IsolationError> {
        sethostname(hostname).map_err(IsolationError::Hostname)
    }

    fn switch_root(&mut self, rootfs: &Path, mode: RootSwitch) -> Result<(), IsolationError> {
        rootfs::switch_root(rootfs, mode).map_err(|source| IsolationError::RootSwitch {
            path: rootfs.to_path_buf(),
            source,
        })
    }

    fn mount_proc(&mut self) -> Result<(), IsolationError> {
        fs::create_dir_all(PROC_DIR).map_err(IsolationError::ProcDir)?;
        mount(
            Some("proc"),
            PROC_DIR,
            Some("proc"),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(IsolationError::MountProc)
    }

    fn unmount_proc(&mut self) {
        if let Err(e) = umount2(PROC_DIR, MntFlags::MNT_DETACH) {
            warn!("failed to unmount {}: {}", PROC_DIR, e);
        }
    }

    fn exec(&mut self, request: &LaunchRequest) -> IsolationError {
        let full_args = match request.to_cstrings() {
            Ok(args) => args,
            Err(e) => return e.into(),
        };
        let Err(source) = execvp(&full_args[0], &full_args);
        IsolationError::Exec {
            program: request.program().to_string_lossy().into_owned(),
            source,
        }
    }
}

/// Runs the child side of the launch. Returns only if a step failed.
pub fn run_isolated<I: Isolation>(
    sink: GateSink,
    config: &IsolationConfig,
    request: &LaunchRequest,
    isolation: &mut I,
) -> Result<Infallible, IsolationError> {
    debug!("{}", Stage::WaitingForSignal);
    if sink.await_signal()? == Release::SourceClosed {
        warn!("launcher closed the gate without signaling, proceeding");
    }

    debug!("{}: {}", Stage::SettingHostname, config.hostname);
    isolation.set_hostname(&config.hostname)?;

    debug!("{}: {}", Stage::SwitchingRoot, config.rootfs.display());
    isolation.switch_root(&config.rootfs, config.root_switch)?;

    debug!("{}", Stage::MountingProcFs);
    isolation.mount_proc()?;

    debug!("{}: {:?}", Stage::Exec, request);
    let err = isolation.exec(request);
    isolation.unmount_proc();
    Err(err)
}
