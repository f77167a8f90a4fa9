//! Checks that the invoking user controls a path before root touches it.
//!
//! All checks compare against the real uid, which is the invoking user outside of a
//! [`RealRootSection`](crate::linux::privilege::RealRootSection). They must run before entering one.

use crate::{error::Error, linux::system};
use anyhow::Result;
use nix::unistd::{AccessFlags, Gid, Uid};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

const S_IWUSR: u32 = 0o200;
const S_IWGRP: u32 = 0o020;
const S_IWOTH: u32 = 0o002;

pub fn must_be_owned_by_caller(path: &Path) -> Result<()> {
    let caller = system::getuid();
    if caller.is_root() {
        return Ok(());
    }
    let metadata = std::fs::metadata(path)
        .map_err(|e| Error::io(format!("Failed to stat {path:?}"), e))?;
    if !owner_allows(caller, Uid::from_raw(metadata.uid())) {
        return Err(Error::access_denied(path, "not owned by the original user").into());
    }
    Ok(())
}

pub fn must_be_writable_by_caller(path: &Path) -> Result<()> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            return Err(
                Error::access_denied(path, "does not exist or is not a regular file").into(),
            );
        }
    };

    let file_uid = Uid::from_raw(metadata.uid());
    let file_gid = Gid::from_raw(metadata.gid());
    let mode = metadata.mode();

    let mut caller = system::getuid();
    if caller.is_root() {
        caller = file_uid;
    }

    if caller == file_uid && mode & S_IWUSR != 0 {
        return Ok(());
    }

    // Group membership only matters if the group may write at all; skip the lookup otherwise
    let groups = if mode & S_IWGRP != 0 {
        system::groups_of(caller)
            .map_err(|e| Error::LookupFailure(format!("groups of uid {caller}: {e:#}")))?
    } else {
        Vec::new()
    };

    if mode_allows(caller, file_uid, file_gid, mode, &groups) {
        Ok(())
    } else {
        Err(Error::access_denied(path, "not writable by the original user or their groups").into())
    }
}

/// `access(2)` evaluates against the real uid, which is exactly the caller here.
pub fn must_be_readable_by_caller(path: &Path) -> Result<()> {
    nix::unistd::access(path, AccessFlags::R_OK)
        .map_err(|_| Error::access_denied(path, "not readable by the original user"))?;
    Ok(())
}

fn owner_allows(caller: Uid, owner: Uid) -> bool {
    caller.is_root() || caller == owner
}

fn mode_allows(caller: Uid, file_uid: Uid, file_gid: Gid, mode: u32, groups: &[Gid]) -> bool {
    (caller == file_uid && mode & S_IWUSR != 0)
        || (mode & S_IWGRP != 0 && groups.contains(&file_gid))
        || mode & S_IWOTH != 0
}
