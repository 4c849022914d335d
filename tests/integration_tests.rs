use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

fn rocker(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rocker"))
        .args(args)
        .output()
        .expect("Failed to execute rocker")
}

/// Copies `binary` and the shared libraries `ldd` reports into `rootfs`.
fn install_binary(rootfs: &Path, binary: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut files = vec![PathBuf::from(binary)];
    let ldd = Command::new("ldd").arg(binary).output()?;
    for line in String::from_utf8_lossy(&ldd.stdout).lines() {
        let path = line
            .split_whitespace()
            .find(|word| word.starts_with('/'))
            .map(PathBuf::from);
        files.extend(path);
    }

    for file in files {
        let target = rootfs.join(file.strip_prefix("/")?);
        fs::create_dir_all(target.parent().unwrap())?;
        fs::copy(&file, &target)?;
    }
    Ok(())
}

fn create_test_rootfs(temp_dir: &TempDir) -> Result<String, Box<dyn std::error::Error>> {
    let rootfs_path = temp_dir.path().join("rootfs");
    fs::create_dir_all(&rootfs_path)?;

    fs::create_dir_all(rootfs_path.join("proc"))?;
    install_binary(&rootfs_path, "/bin/echo")?;
    install_binary(&rootfs_path, "/bin/sh")?;

    Ok(rootfs_path.to_string_lossy().to_string())
}

#[test]
fn test_run_without_program_is_usage_error() {
    let output = rocker(&["run"]);

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing program"), "stderr={}", stderr);
}

#[test]
fn test_unknown_mode_is_rejected() {
    let output = rocker(&["child", "/bin/echo"]);

    assert!(!output.status.success());
    assert!(!output.stderr.is_empty(), "Expected stderr output but got none");
}

#[test]
fn test_isolated_child_without_gate_fd_fails() {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_rocker"));
    cmd.args(["isolated-child", "--", "/bin/echo", "escaped"]);
    unsafe {
        cmd.pre_exec(|| {
            // SAFETY: closing a descriptor this child does not use
            libc::close(3);
            Ok(())
        });
    }
    let output = cmd.output().expect("Failed to execute rocker");

    assert_eq!(output.status.code(), Some(1));
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no gate descriptor"), "stderr={}", stderr);
}

#[test]
fn test_help_and_usage() {
    for args in [vec!["--help"], vec!["run", "--help"]] {
        let output = rocker(&args);

        assert!(output.status.success(), "help failed for {:?}", args);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("Usage"));
        assert!(!stdout.contains("isolated-child"));
    }
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_echo_inside_container() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    let output = rocker(&["run", "--rootfs", &rootfs, "/bin/echo", "hello"]);

    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_exit_code_is_propagated() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    let output = rocker(&["run", "--rootfs", &rootfs, "/bin/sh", "-c", "exit 7"]);

    assert_eq!(output.status.code(), Some(7));
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_container_isolation_verification() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    let output = rocker(&[
        "run",
        "--rootfs",
        &rootfs,
        "--hostname",
        "sealed",
        "/bin/sh",
        "-c",
        "echo $$; read name < /proc/sys/kernel/hostname; echo $name",
    ]);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut lines = stdout.lines();
    assert_eq!(lines.next(), Some("1"), "shell should be pid 1");
    assert_eq!(lines.next(), Some("sealed"));
    assert_ne!(nix::unistd::gethostname().unwrap(), "sealed");
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_missing_program_fails_inside_container() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    let output = rocker(&["run", "--rootfs", &rootfs, "/nonexistent/command"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(!output.stderr.is_empty());
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_timeout_kills_container() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    let output = rocker(&[
        "run",
        "--rootfs",
        &rootfs,
        "--timeout",
        "1",
        "/bin/sh",
        "-c",
        "while :; do :; done",
    ]);

    assert_eq!(output.status.code(), Some(124));
}
