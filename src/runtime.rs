use std::ffi::{CStr, CString, NulError, OsString};
use std::io;
use std::os::unix::ffi::OsStringExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sched::clone;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, execv};

use crate::cgroup::{CgroupLimiter, ResourceLimiter};
use crate::config::{CgroupConfig, IsolationConfig, LaunchPolicy, LaunchRequest};
use crate::error::LaunchError;
use crate::gate::{self, GateSink};
use crate::namespace;

const STACK_SIZE: usize = 1024 * 1024; // 1MB stack
const SELF_EXE: &str = "/proc/self/exe";
pub const CHILD_MODE: &str = "isolated-child";
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the isolated child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(Signal),
}

impl ChildExit {
    pub fn code(self) -> i32 {
        match self {
            ChildExit::Exited(code) => code,
            ChildExit::Signaled(signal) => 128 + signal as i32,
        }
    }
}

/// Starts and reaps the isolated child.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessSpawner {
    /// Starts the child in fresh namespaces with `sink` inherited. The child
    /// must stay blocked on the sink until released.
    fn spawn(&mut self, request: &LaunchRequest, sink: GateSink) -> Result<Pid, LaunchError>;

    /// Waits for the child, killing it once `timeout` elapses.
    fn wait(&mut self, pid: Pid, timeout: Option<Duration>) -> Result<ChildExit, LaunchError>;

    /// Kills and reaps a child that was never released.
    fn kill(&mut self, pid: Pid) -> Result<(), LaunchError>;
}

/// Spawns the child by cloning into new namespaces and re-executing this
/// binary in `isolated-child` mode.
#[derive(Debug)]
pub struct CloneSpawner {
    isolation: IsolationConfig,
}

impl CloneSpawner {
    pub fn new(isolation: IsolationConfig) -> Self {
        Self { isolation }
    }

    fn child_argv(&self, request: &LaunchRequest) -> Vec<OsString> {
        let mut argv = vec![
            OsString::from(env!("CARGO_PKG_NAME")),
            OsString::from(CHILD_MODE),
        ];
        argv.extend(self.isolation.to_args());
        argv.push(OsString::from("--"));
        argv.extend(request.argv().map(OsString::from));
        argv
    }
}

impl ProcessSpawner for CloneSpawner {
    fn spawn(&mut self, request: &LaunchRequest, sink: GateSink) -> Result<Pid, LaunchError> {
        let invalid =
            |e: NulError| LaunchError::Spawn(io::Error::new(io::ErrorKind::InvalidInput, e));
        let exe = CString::new(SELF_EXE).map_err(invalid)?;
        let argv = self
            .child_argv(request)
            .into_iter()
            .map(|arg| CString::new(arg.into_vec()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        let sink_fd = sink.as_raw_fd();

        let mut stack = vec![0u8; STACK_SIZE];
        let flags = namespace::container_clone_flags();

        let child_pid = unsafe {
            clone(
                Box::new(|| reexec_child(&exe, &argv, sink_fd)),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as i32),
            )
        }
        .map_err(|e| LaunchError::Spawn(e.into()))?;

        // the child holds its own copy now
        drop(sink);
        info!("spawned isolated child with host pid {}", child_pid);
        Ok(child_pid)
    }

    fn wait(&mut self, pid: Pid, timeout: Option<Duration>) -> Result<ChildExit, LaunchError> {
        let Some(limit) = timeout else {
            return wait_blocking(pid);
        };

        let deadline = Instant::now() + limit;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ChildExit::Signaled(signal)),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(source) => return Err(LaunchError::Wait { pid, source }),
            }

            if Instant::now() >= deadline {
                warn!("child {} exceeded {:?}, killing", pid, limit);
                self.kill(pid)?;
                return Err(LaunchError::Timeout { pid, limit });
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    fn kill(&mut self, pid: Pid) -> Result<(), LaunchError> {
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => return Err(LaunchError::Wait { pid, source }),
        }
        wait_blocking(pid).map(|_| ())
    }
}

fn wait_blocking(pid: Pid) -> Result<ChildExit, LaunchError> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ChildExit::Exited(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(ChildExit::Signaled(signal)),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(source) => return Err(LaunchError::Wait { pid, source }),
        }
    }
}

/// Runs in the cloned child, inside the new namespaces.
fn reexec_child(exe: &CStr, argv: &[CString], sink_fd: RawFd) -> isize {
    if let Err(e) = namespace::make_mounts_private() {
        eprintln!("failed to make mounts private: {}", e);
        return 1;
    }
    if let Err(e) = gate::install_inherited(sink_fd) {
        eprintln!("{}", e);
        return 1;
    }
    let Err(e) = execv(exe, argv);
    eprintln!("exec {:?}: {}", exe, e);
    1
}

/// Orchestrates one container launch.
///
/// The limiter's membership write always completes before the child is
/// released; a child that cannot be confined is killed without release.
pub struct Launcher<S, L> {
    spawner: S,
    limiter: L,
    policy: LaunchPolicy,
}

impl<S: ProcessSpawner, L: ResourceLimiter> Launcher<S, L> {
    pub fn new(spawner: S, limiter: L, policy: LaunchPolicy) -> Self {
        Self {
            spawner,
            limiter,
            policy,
        }
    }

    /// Returns the exit code of the contained program.
    pub fn launch(&mut self, request: &LaunchRequest) -> Result<i32, LaunchError> {
        let outcome = self.start(request);

        if let Err(e) = self.limiter.cleanup() {
            warn!("cgroup cleanup failed: {}", e);
        }
        outcome
    }

    fn start(&mut self, request: &LaunchRequest) -> Result<i32, LaunchError> {
        let (source, sink) = gate::channel()?;
        let pid = self.spawner.spawn(request, sink)?;

        if let Err(e) = self.limiter.configure(pid, self.policy.pids_max) {
            if let Err(kill_err) = self.spawner.kill(pid) {
                warn!("failed to kill unreleased child {}: {}", pid, kill_err);
            }
            drop(source);
            return Err(e.into());
        }

        debug!("child {} confined, releasing", pid);
        if let Err(e) = source.signal() {
            // the child is already gone; reap it below
            warn!("failed to release child {}: {}", pid, e);
        }

        let exit = self.spawner.wait(pid, self.policy.timeout)?;
        debug!("child {} finished: {:?}", pid, exit);
        Ok(exit.code())
    }
}

/// Launches `argv` in a new container and returns its exit code.
pub fn run_container(
    isolation: IsolationConfig,
    cgroup: CgroupConfig,
    policy: LaunchPolicy,
    argv: Vec<OsString>,
) -> Result<i32, LaunchError> {
    let request = LaunchRequest::from_argv(argv)?;
    let mut launcher = Launcher::new(
        CloneSpawner::new(isolation),
        CgroupLimiter::new(cgroup),
        policy,
    );
    launcher.launch(&request)
}
