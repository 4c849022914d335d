use nix::mount::{MsFlags, mount};
use nix::sched::CloneFlags;

/// Namespaces the isolated child is created in: hostname, pid and mount.
pub fn container_clone_flags() -> CloneFlags {
    CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS
}

/// Stops mount events in the new mount namespace from propagating to the host.
///
/// Must run before any mount made inside the namespace.
pub fn make_mounts_private() -> nix::Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
}
