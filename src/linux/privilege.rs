use crate::{error::Error, linux::system, log};
use anyhow::Result;
use nix::unistd::Uid;

/// While alive, the real uid of the process is root.
///
/// The helper runs setuid-root, so the effective uid is root all along and the real uid is the one
/// of the invoking user. Mounting through loop devices, unmounting and launching systemd-nspawn
/// look at the real uid, so those steps are wrapped in a section. Dropping the section restores the
/// real uid it found on entry, which makes nested sections restore root rather than the caller.
pub struct RealRootSection {
    original_uid: Uid,
}

impl RealRootSection {
    pub fn enter() -> Result<Self> {
        let original_uid = system::getuid();
        system::setuid_root().map_err(|e| {
            Error::PrivilegeError(format!("Failed to set real user ID to root: {e}"))
        })?;
        log!("Entered real root section (uid={original_uid} -> 0)");
        Ok(Self { original_uid })
    }
}

impl Drop for RealRootSection {
    fn drop(&mut self) {
        // On failure the real uid stays 0; the effective uid has been root all along
        if let Err(e) = system::set_real_uid(self.original_uid) {
            log!(warn, "Failed to restore original user ID: {e}");
        }
        log!("uid={} euid={}", system::getuid(), system::geteuid());
    }
}

/// Runs `f` with real uid root.
pub fn as_real_root<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _section = RealRootSection::enter()?;
    f()
}
