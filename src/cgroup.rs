use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use nix::unistd::Pid;

use crate::config::CgroupConfig;
use crate::error::LimiterError;

/// Controller directory that marks a cgroup v1 hierarchy.
const V1_PIDS_CONTROLLER: &str = "pids";
const PIDS_MAX: &str = "pids.max";
const CGROUP_PROCS: &str = "cgroup.procs";

/// Caps the number of live processes of the container.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceLimiter {
    /// Creates the limiting group, writes the ceiling and adds `pid`.
    ///
    /// An `Ok` return means `pid` is a member of the group.
    fn configure(&mut self, pid: Pid, pids_max: u32) -> Result<(), LimiterError>;

    /// Removes the limiting group if one was created.
    fn cleanup(&mut self) -> Result<(), LimiterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupLayout {
    /// cgroup v1: groups live under the `pids` controller.
    Legacy(PathBuf),
    /// cgroup v2 unified hierarchy.
    Unified(PathBuf),
}

impl CgroupLayout {
    pub fn detect(root: &Path) -> Self {
        let controller = root.join(V1_PIDS_CONTROLLER);
        if controller.is_dir() {
            CgroupLayout::Legacy(controller)
        } else {
            CgroupLayout::Unified(root.to_path_buf())
        }
    }

    pub fn group_path(&self, name: &str) -> PathBuf {
        match self {
            CgroupLayout::Legacy(base) | CgroupLayout::Unified(base) => base.join(name),
        }
    }
}

/// Limiter backed by the host cgroup filesystem.
///
/// Each launch gets its own group, `<prefix>-<child pid>`.
#[derive(Debug)]
pub struct CgroupLimiter {
    config: CgroupConfig,
    group: Option<PathBuf>,
}

impl CgroupLimiter {
    pub fn new(config: CgroupConfig) -> Self {
        Self {
            config,
            group: None,
        }
    }

    pub fn group(&self) -> Option<&Path> {
        self.group.as_deref()
    }

    fn group_name(&self, pid: Pid) -> String {
        format!("{}-{}", self.config.group_prefix, pid)
    }
}

impl ResourceLimiter for CgroupLimiter {
    fn configure(&mut self, pid: Pid, pids_max: u32) -> Result<(), LimiterError> {
        let layout = CgroupLayout::detect(&self.config.root);
        let group = layout.group_path(&self.group_name(pid));
        debug!("using cgroup layout {:?}", layout);

        match fs::create_dir(&group) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(source) => return Err(LimiterError::CreateGroup { path: group, source }),
        }
        self.group = Some(group.clone());
        info!("created cgroup {}", group.display());

        let ceiling = group.join(PIDS_MAX);
        if let Err(source) = fs::write(&ceiling, pids_max.to_string()) {
            let err = LimiterError::Ceiling {
                path: ceiling,
                source,
            };
            if self.config.strict {
                return Err(err);
            }
            warn!("{}; process ceiling not enforced", err);
        }

        let procs = group.join(CGROUP_PROCS);
        fs::write(&procs, pid.to_string()).map_err(|source| LimiterError::Membership {
            path: procs,
            pid,
            source,
        })?;
        debug!("added pid {} to {}", pid, group.display());

        Ok(())
    }

    fn cleanup(&mut self) -> Result<(), LimiterError> {
        let Some(group) = self.group.take() else {
            return Ok(());
        };

        match fs::remove_dir(&group) {
            Ok(()) => {
                debug!("removed cgroup {}", group.display());
                Ok(())
            }
            Err(e) if is_ignorable_removal_error(&e) => {
                debug!("leaving cgroup {}: {}", group.display(), e);
                Ok(())
            }
            Err(source) => Err(LimiterError::Remove {
                path: group,
                source,
            }),
        }
    }
}

fn is_ignorable_removal_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(libc::ENOTEMPTY) | Some(libc::EBUSY))
}
