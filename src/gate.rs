//! One-shot release channel between the launcher and the isolated child.
//!
//! The launcher keeps the write end and the child inherits the read end at
//! [`GATE_FD`]. The child blocks until the launcher writes or closes its end.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use log::debug;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::dup2;

use crate::error::GateError;

/// Descriptor slot the sink occupies in the re-executed child.
pub const GATE_FD: RawFd = 3;

const RELEASE_PAYLOAD: &[u8] = b"OK";

/// How the sink was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Signaled,
    /// The source was closed without a payload, e.g. the launcher died.
    SourceClosed,
}

/// Creates a linked source/sink pair. Both ends are close-on-exec.
pub fn channel() -> Result<(GateSource, GateSink), GateError> {
    let mut fds = [0 as RawFd; 2];

    // SAFETY: pipe2 syscall writing into a two-element array
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret != 0 {
        return Err(GateError::Create(io::Error::last_os_error()));
    }

    // SAFETY: we just created these file descriptors
    let sink = unsafe { File::from_raw_fd(fds[0]) };
    let source = unsafe { File::from_raw_fd(fds[1]) };

    Ok((GateSource { file: source }, GateSink { file: sink }))
}

#[derive(Debug)]
pub struct GateSource {
    file: File,
}

impl GateSource {
    /// Writes the release payload and closes the source.
    pub fn signal(mut self) -> Result<(), GateError> {
        self.file.write_all(RELEASE_PAYLOAD)?;
        debug!("gate signaled");
        Ok(())
    }
}

#[derive(Debug)]
pub struct GateSink {
    file: File,
}

impl GateSink {
    /// Takes ownership of the sink inherited at [`GATE_FD`].
    ///
    /// Must run before anything else in the child opens a descriptor.
    pub fn inherited() -> Result<Self, GateError> {
        fcntl(GATE_FD, FcntlArg::F_GETFD).map_err(|_| GateError::NotInherited(GATE_FD))?;

        // SAFETY: the descriptor is open and nothing else in this process owns it
        let file = unsafe { File::from_raw_fd(GATE_FD) };
        Ok(Self { file })
    }

    /// Blocks until the source writes or is closed, then closes the sink.
    pub fn await_signal(mut self) -> Result<Release, GateError> {
        let mut payload = Vec::new();
        self.file.read_to_end(&mut payload)?;

        if payload.is_empty() {
            Ok(Release::SourceClosed)
        } else {
            Ok(Release::Signaled)
        }
    }
}

impl AsRawFd for GateSink {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Places the sink at [`GATE_FD`] with close-on-exec cleared.
///
/// Called in the cloned child between `clone` and `execv`.
pub fn install_inherited(sink_fd: RawFd) -> Result<(), GateError> {
    if sink_fd == GATE_FD {
        // dup2 onto itself would keep FD_CLOEXEC
        fcntl(GATE_FD, FcntlArg::F_SETFD(FdFlag::empty())).map_err(GateError::Install)?;
    } else {
        dup2(sink_fd, GATE_FD).map_err(GateError::Install)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Spawns `sh` reading from [`GATE_FD`], running `setup` before exec.
    fn spawn_reader<F>(setup: F) -> std::process::Child
    where
        F: FnMut() -> io::Result<()> + Send + Sync + 'static,
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "cat <&3"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped());
        unsafe {
            cmd.pre_exec(setup);
        }
        cmd.spawn().unwrap()
    }

    #[test]
    fn test_signal_releases_sink() {
        let (source, sink) = channel().unwrap();
        source.signal().unwrap();
        assert_eq!(sink.await_signal().unwrap(), Release::Signaled);
    }

    #[test]
    fn test_closing_source_releases_sink() {
        let (source, sink) = channel().unwrap();
        drop(source);
        assert_eq!(sink.await_signal().unwrap(), Release::SourceClosed);
    }

    #[test]
    fn test_sink_blocks_until_signaled() {
        let (source, sink) = channel().unwrap();
        let delay = Duration::from_millis(100);

        let started = Instant::now();
        let waiter = thread::spawn(move || {
            let release = sink.await_signal().unwrap();
            (release, started.elapsed())
        });

        thread::sleep(delay);
        source.signal().unwrap();

        let (release, waited) = waiter.join().unwrap();
        assert_eq!(release, Release::Signaled);
        assert!(waited >= delay);
    }

    #[test]
    fn test_signal_fails_when_sink_is_gone() {
        let (source, sink) = channel().unwrap();
        drop(sink);
        assert!(matches!(source.signal(), Err(GateError::Io(_))));
    }

    #[test]
    fn test_channel_ends_are_close_on_exec() {
        let (_source, sink) = channel().unwrap();
        let flags = fcntl(sink.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
    }

    #[test]
    fn test_installed_sink_is_inherited_on_gate_fd() {
        let (source, sink) = channel().unwrap();
        let sink_fd = sink.as_raw_fd();

        let reader = spawn_reader(move || install_inherited(sink_fd).map_err(io::Error::other));
        drop(sink);
        source.signal().unwrap();

        let output = reader.wait_with_output().unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, RELEASE_PAYLOAD);
    }

    #[test]
    fn test_sink_already_on_gate_fd_loses_close_on_exec() {
        let (source, sink) = channel().unwrap();
        let sink_fd = sink.as_raw_fd();

        let reader = spawn_reader(move || {
            // park the sink on the gate slot with FD_CLOEXEC still set
            if sink_fd != GATE_FD {
                // SAFETY: dup3 syscall on descriptors owned by this child
                let ret = unsafe { libc::dup3(sink_fd, GATE_FD, libc::O_CLOEXEC) };
                if ret < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            install_inherited(GATE_FD).map_err(io::Error::other)
        });
        drop(sink);
        source.signal().unwrap();

        let output = reader.wait_with_output().unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, RELEASE_PAYLOAD);
    }
}
