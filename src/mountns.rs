use nix::mount::MsFlags;
use nix::sched::CloneFlags;

pub fn unshare_mountns() -> std::io::Result<()> {
    nix::sched::unshare(CloneFlags::CLONE_NEWNS)?;
    Ok(())
}

/// Moves the process into its own mount namespace and stops propagation in both directions, so
/// loop mounts made from here on are invisible to the host and to other helper instances.
pub fn enter_private_mountns() -> std::io::Result<()> {
    unshare_mountns()?;
    nix::mount::mount(
        Some("none"),
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )?;
    Ok(())
}
