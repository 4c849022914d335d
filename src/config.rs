use std::ffi::{CString, NulError, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::LaunchError;

pub const DEFAULT_ROOTFS: &str = "/tmp/my-container-root";
pub const DEFAULT_HOSTNAME: &str = "container";
pub const DEFAULT_PIDS_MAX: u32 = 10;
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";
pub const GROUP_PREFIX: &str = "rocker";

/// The program to run inside the container, and its arguments.
///
/// Forwarded byte for byte across the re-exec boundary and finally to `execvp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    program: OsString,
    args: Vec<OsString>,
}

impl LaunchRequest {
    pub fn from_argv(argv: Vec<OsString>) -> Result<Self, LaunchError> {
        let mut argv = argv.into_iter();
        let program = match argv.next() {
            Some(program) if !program.is_empty() => program,
            _ => return Err(LaunchError::Usage("missing program to run".to_string())),
        };
        Ok(Self {
            program,
            args: argv.collect(),
        })
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> impl Iterator<Item = &OsStr> {
        std::iter::once(self.program.as_os_str()).chain(self.args.iter().map(OsString::as_os_str))
    }

    pub fn to_cstrings(&self) -> Result<Vec<CString>, NulError> {
        self.argv().map(|arg| CString::new(arg.as_bytes())).collect()
    }
}

/// How the child leaves the host root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootSwitch {
    #[default]
    Chroot,
    PivotRoot,
}

/// Settings the isolated child needs; rendered back to flags for the re-exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationConfig {
    pub rootfs: PathBuf,
    pub hostname: String,
    pub root_switch: RootSwitch,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            rootfs: PathBuf::from(DEFAULT_ROOTFS),
            hostname: DEFAULT_HOSTNAME.to_string(),
            root_switch: RootSwitch::Chroot,
        }
    }
}

impl IsolationConfig {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("--rootfs"),
            self.rootfs.clone().into_os_string(),
            OsString::from("--hostname"),
            OsString::from(&self.hostname),
        ];
        if self.root_switch == RootSwitch::PivotRoot {
            args.push(OsString::from("--pivot-root"));
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupConfig {
    pub root: PathBuf,
    pub group_prefix: String,
    /// Treat a failed `pids.max` write as fatal instead of a warning.
    pub strict: bool,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(CGROUP_ROOT),
            group_prefix: GROUP_PREFIX.to_string(),
            strict: false,
        }
    }
}

/// Limits the launcher applies to one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPolicy {
    pub pids_max: u32,
    /// Kill the child once this elapses; unbounded when `None`.
    pub timeout: Option<Duration>,
}

impl Default for LaunchPolicy {
    fn default() -> Self {
        Self {
            pids_max: DEFAULT_PIDS_MAX,
            timeout: None,
        }
    }
}
