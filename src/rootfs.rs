use std::fs;
use std::io;
use std::path::Path;

use log::debug;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, chroot, pivot_root};

use crate::config::RootSwitch;

const OLD_ROOT: &str = ".old_root";

/// Makes `rootfs` the process root and working directory.
pub fn switch_root(rootfs: &Path, mode: RootSwitch) -> io::Result<()> {
    debug!("switching root to {} via {:?}", rootfs.display(), mode);
    match mode {
        RootSwitch::Chroot => enter_chroot(rootfs),
        RootSwitch::PivotRoot => pivot_into(rootfs),
    }
}

fn enter_chroot(rootfs: &Path) -> io::Result<()> {
    chroot(rootfs)?;
    chdir("/")?;
    Ok(())
}

/// Requires private mount propagation, which the spawner sets up.
fn pivot_into(rootfs: &Path) -> io::Result<()> {
    let rootfs = fs::canonicalize(rootfs)?;

    // pivot_root needs the new root to be a mount point
    mount(
        Some(&rootfs),
        &rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )?;

    let old_root = rootfs.join(OLD_ROOT);
    fs::create_dir_all(&old_root)?;

    pivot_root(&rootfs, &old_root)?;
    chdir("/")?;

    let old_root = Path::new("/").join(OLD_ROOT);
    umount2(&old_root, MntFlags::MNT_DETACH)?;
    fs::remove_dir(&old_root)?;

    Ok(())
}
