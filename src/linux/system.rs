use crate::error::Error;
use anyhow::{bail, Context, Result};
use nix::unistd::{Gid, Uid};
use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};

pub fn umount<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    Ok(nix::mount::umount(path.as_ref())?)
}

pub fn getuid() -> Uid {
    nix::unistd::getuid()
}

pub fn geteuid() -> Uid {
    nix::unistd::geteuid()
}

pub fn setuid_root() -> std::io::Result<()> {
    Ok(nix::unistd::setuid(Uid::from_raw(0))?)
}

/// Sets the real uid only, leaving the effective uid untouched.
pub fn set_real_uid(uid: Uid) -> std::io::Result<()> {
    // nix only exposes setresuid, which would need the saved uid too; -1 keeps the effective uid
    if unsafe { nix::libc::setreuid(uid.as_raw(), u32::MAX) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Primary and supplementary groups of a user, as listed in the passwd and group databases.
pub fn groups_of(uid: Uid) -> Result<Vec<Gid>> {
    let user = nix::unistd::User::from_uid(uid)
        .with_context(|| format!("Failed to read passwd entry of uid {uid}"))?
        .with_context(|| format!("uid {uid} has no passwd entry"))?;
    let name = std::ffi::CString::new(user.name.as_bytes())
        .with_context(|| format!("User name of uid {uid} contains a NUL byte"))?;
    nix::unistd::getgrouplist(&name, user.gid)
        .with_context(|| format!("Failed to get groups of user {}", user.name))
}

/// Whether `path` is the target of an entry in /proc/self/mountinfo.
pub fn is_mounted(path: &Path) -> Result<bool> {
    if !path.is_dir() {
        return Ok(false);
    }
    let path = std::fs::canonicalize(path)
        .with_context(|| format!("Failed to resolve {path:?}"))?;
    let mountinfo = std::fs::read("/proc/self/mountinfo")
        .context("Failed to read /proc/self/mountinfo")?;
    is_mount_target(&mountinfo, &path)
}

fn is_mount_target(mountinfo: &[u8], path: &Path) -> Result<bool> {
    // Later entries shadow earlier ones, but any entry is enough to tell a mount point apart
    for line in mountinfo.split(|&c| c == b'\n').rev() {
        if line.is_empty() {
            continue;
        }
        let target = line
            .split(|&c| c == b' ')
            .nth(4)
            .context("Invalid format of /proc/self/mountinfo")?;
        if unescape_mountinfo(target) == path {
            return Ok(true);
        }
    }
    Ok(false)
}

// The kernel escapes space, tab, newline and backslash as \ooo
fn unescape_mountinfo(field: &[u8]) -> PathBuf {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        if field[i] == b'\\'
            && i + 3 < field.len()
            && field[i + 1..i + 4].iter().all(|c| (b'0'..=b'7').contains(c))
        {
            let value = field[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, c| acc * 8 + u32::from(c - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(field[i]);
            i += 1;
        }
    }
    PathBuf::from(OsString::from_vec(out))
}

/// Escapes `:` as `\:`, which systemd-nspawn uses as the field separator of --bind and --overlay.
pub fn escape_colon(path: &Path) -> String {
    String::from_utf8_lossy(path.as_os_str().as_bytes()).replace(':', "\\:")
}

/// True for relative paths without `..`, which cannot climb out of the directory they are joined to.
pub fn is_confined(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Resolves `relative` under `base`, refusing anything that ends up outside of `base` once
/// symlinks are followed.
pub fn resolve_inside(base: &Path, relative: &Path) -> Result<PathBuf> {
    let base = std::fs::canonicalize(base).with_context(|| format!("Failed to resolve {base:?}"))?;
    let path = base.join(relative);
    let resolved =
        std::fs::canonicalize(&path).with_context(|| format!("Failed to resolve {path:?}"))?;
    if !resolved.starts_with(&base) {
        bail!(Error::access_denied(path, "resolves outside of the mounted image"));
    }
    Ok(resolved)
}

/// `mkdir -p base/relative`, except that no component may be a symlink, so the directories are
/// guaranteed to be created inside `base`.
pub fn create_dir_inside(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut path = base.to_owned();
    for component in relative.components() {
        let Component::Normal(part) = component else {
            continue;
        };
        path.push(part);
        match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_symlink() => {
                bail!(Error::access_denied(path, "is a symbolic link"));
            }
            Ok(metadata) if !metadata.is_dir() => {
                bail!(Error::access_denied(path, "is not a directory"));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir(&path)
                    .map_err(|e| Error::io(format!("Failed to create {path:?}"), e))?;
            }
            Err(e) => bail!(Error::io(format!("Failed to stat {path:?}"), e)),
        }
    }
    Ok(path)
}
