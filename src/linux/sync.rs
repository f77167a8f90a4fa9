//! Makes a subtree of one image mirror a list of paths taken from another image.
//!
//! The destination is pruned first: every file, symlink and directory that the manifest neither
//! names nor needs as an ancestor goes away. rsync then copies the listed files, so unchanged files
//! are not rewritten.

use crate::{
    error::Error,
    linux::{
        access,
        running::{self, Environment},
        scratch::{ScratchFile, ScratchMount},
        session::Session,
        system,
    },
    log,
};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::io::{BufRead, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

/// Paths that must survive in the destination, parsed from the caller's file list.
#[derive(Debug, Default)]
pub struct SyncManifest {
    desired: BTreeSet<PathBuf>,
}

impl SyncManifest {
    /// Parses a newline-separated list, copying every accepted line verbatim to `list`.
    ///
    /// Blank lines and `#` comments are skipped. An entry with a `.` or `..` segment keeps none of
    /// its paths, but the line itself still goes to `list`.
    pub fn read(input: impl BufRead, list: &mut impl Write) -> Result<Self> {
        let mut manifest = Self::default();
        for line in input.split(b'\n') {
            let line = line.map_err(|e| Error::io("Failed to read file list", e))?;
            if line.is_empty() || line[0] == b'#' {
                continue;
            }

            list.write_all(&line)
                .and_then(|()| list.write_all(b"\n"))
                .map_err(|e| Error::io("Failed to write to temporary file for file list", e))?;

            log!("Processing file: {}", String::from_utf8_lossy(&line));
            manifest.add(&line);
        }
        list.flush()
            .map_err(|e| Error::io("Failed to write to temporary file for file list", e))?;
        Ok(manifest)
    }

    fn add(&mut self, line: &[u8]) {
        if line
            .split(|&c| c == b'/')
            .any(|segment| segment == b"." || segment == b"..")
        {
            log!(
                warn,
                "Invalid path in file list: {}",
                String::from_utf8_lossy(line)
            );
            return;
        }

        let mut current = PathBuf::new();
        for component in Path::new(OsStr::from_bytes(line)).components() {
            // rsync --relative treats /a/b like a/b
            if let Component::Normal(part) = component {
                current.push(part);
                self.desired.insert(current.clone());
            }
        }
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.desired.contains(relative)
    }

    pub fn len(&self) -> usize {
        self.desired.len()
    }
}

/// What has to go from a destination subtree before copying.
#[derive(Debug, Default)]
pub struct PrunePlan {
    pub files: Vec<PathBuf>,
    pub dirs: Vec<PathBuf>,
}

impl PrunePlan {
    /// Walks `root` without following symlinks and marks everything the manifest does not keep.
    pub fn scan(root: &Path, manifest: &SyncManifest) -> Result<Self> {
        let mut plan = Self::default();
        plan.scan_dir(root, root, manifest)?;
        // Longer paths first, so children are handled before their parents
        plan.dirs.sort_by(|a, b| {
            b.as_os_str()
                .len()
                .cmp(&a.as_os_str().len())
                .then_with(|| a.cmp(b))
        });
        Ok(plan)
    }

    fn scan_dir(&mut self, root: &Path, dir: &Path, manifest: &SyncManifest) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).map_err(|e| Error::io(format!("Failed to read {dir:?}"), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(format!("Failed to read {dir:?}"), e))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .map_err(|e| Error::io(format!("Failed to stat {path:?}"), e))?;
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{path:?} escaped {root:?}"))?;
            let keep = manifest.contains(relative);

            if file_type.is_dir() {
                if !keep {
                    self.dirs.push(path.clone());
                }
                self.scan_dir(root, &path, manifest)?;
            } else if !keep && (file_type.is_file() || file_type.is_symlink()) {
                self.files.push(path);
            }
        }
        Ok(())
    }

    /// Removes marked files, then marked directories that are empty by the time they come up.
    /// Failures are reported and skipped.
    pub fn apply(&self) {
        for file in &self.files {
            match std::fs::remove_file(file) {
                Ok(()) => {
                    log!("Removed file: {file:?}");
                }
                Err(e) => {
                    log!(warn, "Failed to remove file {file:?}: {e}");
                }
            }
        }

        for dir in &self.dirs {
            match is_empty_dir(dir) {
                Ok(true) => match std::fs::remove_dir(dir) {
                    Ok(()) => {
                        log!("Removed empty directory: {dir:?}");
                    }
                    Err(e) => {
                        log!(warn, "Failed to remove directory {dir:?}: {e}");
                    }
                },
                Ok(false) => {
                    log!("Directory not empty, skipping removal: {dir:?}");
                }
                Err(e) => {
                    log!(warn, "Failed to read directory {dir:?}: {e}");
                }
            }
        }
    }
}

fn is_empty_dir(dir: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

/// Rejects destination subdirectories that could point outside the mounted image.
fn validate_dst_dir(dst_dir: &Path) -> Result<()> {
    if !system::is_confined(dst_dir) {
        return Err(Error::ArgumentError(format!(
            "Destination directory {dst_dir:?} must be relative and must not contain '..'"
        ))
        .into());
    }
    Ok(())
}

/// Prunes `target` against the manifest read from `input`, recording the accepted lines in `list`.
pub fn reconcile(
    target: &Path,
    input: impl BufRead,
    list: &mut impl Write,
) -> Result<SyncManifest> {
    let manifest = SyncManifest::read(input, list)?;
    std::fs::create_dir_all(target)
        .map_err(|e| Error::io(format!("Failed to create {target:?}"), e))?;
    let plan = PrunePlan::scan(target, &manifest)?;
    log!(
        "{} desired paths; removing up to {} files and {} directories",
        manifest.len(),
        plan.files.len(),
        plan.dirs.len()
    );
    plan.apply();
    Ok(manifest)
}

/// Mounts both images, prunes `dst_dir` in the destination, and copies the listed files into it.
/// Returns rsync's exit status.
pub fn copy(
    session: &Session,
    src_img: &Path,
    dst_img: &Path,
    dst_dir: &Path,
    input: impl BufRead,
) -> Result<i32> {
    validate_dst_dir(dst_dir)?;

    access::must_be_owned_by_caller(src_img)?;
    let mut src = ScratchMount::create()?;
    src.attach(src_img, "ext4")?;

    access::must_be_owned_by_caller(dst_img)?;
    let mut dst = ScratchMount::create()?;
    dst.attach(dst_img, "ext4")?;

    let target = system::create_dir_inside(dst.path(), dst_dir)?;
    let (list, mut list_file) = ScratchFile::create()?;
    reconcile(&target, input, &mut list_file)?;
    drop(list_file);

    let argv = [
        "rsync".to_owned(),
        session.rsync_flags().to_owned(),
        format!("--files-from={}", path_arg(list.path())?),
        "--relative".to_owned(),
        format!("{}/", path_arg(src.path())?),
        path_arg(&target)?.to_owned(),
    ];
    Ok(running::run(&argv, None, Environment::System))
}

fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Path {path:?} is not UTF-8"))
}
