use crate::{
    error::Error,
    linux::{
        access,
        privilege::as_real_root,
        running::{self, Environment},
        system,
    },
    log,
};
use anyhow::{Context, Result};
use rand::{distributions::Alphanumeric, Rng};
use std::fs::{DirBuilder, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

// Not $TMPDIR: the environment belongs to the invoking user
const SCRATCH_BASE: &str = "/tmp";
const SCRATCH_PREFIX: &str = "genpack-helper.";

fn scratch_path(base: &Path) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    base.join(format!("{SCRATCH_PREFIX}{suffix}"))
}

// Retries on name collisions, like mkdtemp(3) and mkstemp(3)
fn create_unique<T>(
    base: &Path,
    what: &str,
    mut create: impl FnMut(&Path) -> std::io::Result<T>,
) -> Result<(PathBuf, T)> {
    for _ in 0..100 {
        let path = scratch_path(base);
        match create(&path) {
            Ok(value) => return Ok((path, value)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(Error::io(format!("Failed to create temporary {what}"), e).into()),
        }
    }
    Err(Error::io(
        format!("Failed to create temporary {what}"),
        std::io::Error::from(ErrorKind::AlreadyExists),
    )
    .into())
}

struct LoopMount {
    source: PathBuf,
    fs_type: String,
}

/// A private scratch directory that an image can be loop-mounted on.
///
/// Dropping it unmounts whatever is mounted there and removes the directory. If unmounting fails,
/// the directory is left alone, since removing it recursively would wipe the mounted image.
pub struct ScratchMount {
    path: PathBuf,
    mount: Option<LoopMount>,
}

impl ScratchMount {
    pub fn create() -> Result<Self> {
        Self::create_in(Path::new(SCRATCH_BASE))
    }

    pub fn create_in(base: &Path) -> Result<Self> {
        let (path, ()) = create_unique(base, "directory", |path| {
            DirBuilder::new().mode(0o700).create(path)
        })?;
        log!("Temporary directory created: {path:?}");
        Ok(Self { path, mount: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loop-mounts `source` on the scratch directory with relatime semantics.
    ///
    /// `source` must be a regular file the caller may write to.
    pub fn attach(&mut self, source: &Path, fs_type: &str) -> Result<()> {
        if let Some(mount) = &self.mount {
            return Err(Error::MountError(format!(
                "{:?} already has {:?} ({}) mounted on it",
                self.path, mount.source, mount.fs_type
            ))
            .into());
        }

        access::must_be_writable_by_caller(source)?;

        let source_arg = source
            .to_str()
            .with_context(|| format!("Image path {source:?} is not UTF-8"))?;
        let target_arg = self
            .path
            .to_str()
            .with_context(|| format!("Scratch path {:?} is not UTF-8", self.path))?;
        let argv = [
            "mount",
            "-t",
            fs_type,
            "-o",
            "loop,relatime",
            "--",
            source_arg,
            target_arg,
        ];

        let status = as_real_root(|| Ok(running::run(&argv, None, Environment::System)))?;
        if status != 0 {
            return Err(Error::MountError(format!(
                "Failed to mount {source:?} on {:?} as {fs_type} (mount exited with {status})",
                self.path
            ))
            .into());
        }

        log!("Mounted {source:?} on {:?}", self.path);
        self.mount = Some(LoopMount {
            source: source.to_owned(),
            fs_type: fs_type.to_owned(),
        });
        Ok(())
    }

    fn unmount(&self) -> Result<()> {
        log!("Unmounting temporary directory: {:?}", self.path);
        as_real_root(|| {
            system::umount(&self.path)
                .map_err(|e| Error::MountError(format!("Failed to unmount {:?}: {e}", self.path)))?;
            Ok(())
        })
    }
}

impl Drop for ScratchMount {
    fn drop(&mut self) {
        // Ask the kernel rather than trusting self.mount: an attach that failed half-way may still
        // have left something mounted
        let mounted = match system::is_mounted(&self.path) {
            Ok(mounted) => mounted,
            Err(e) => {
                log!(
                    impossible,
                    "Cannot tell whether {:?} is mounted, leaving it in place: {e:#}",
                    self.path
                );
                return;
            }
        };
        if mounted {
            if let Err(e) = self.unmount() {
                log!(warn, "{e:#}. Leaving {:?} for manual cleanup", self.path);
                return;
            }
        }

        log!("Removing temporary directory: {:?}", self.path);
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            log!(warn, "Error removing temporary directory {:?}: {e}", self.path);
        }
    }
}

/// A private scratch file, removed on drop.
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub fn create() -> Result<(Self, File)> {
        Self::create_in(Path::new(SCRATCH_BASE))
    }

    pub fn create_in(base: &Path) -> Result<(Self, File)> {
        let (path, file) = create_unique(base, "file", |path| {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(path)
        })?;
        log!("Temporary file created: {path:?}");
        Ok((Self { path }, file))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log!(warn, "Error removing temporary file {:?}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn scratch_directory_is_private_and_removed() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let scratch = ScratchMount::create_in(base.path()).unwrap();
            let path = scratch.path().to_owned();
            assert!(path.is_dir());
            assert!(path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with(SCRATCH_PREFIX));
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
            std::fs::write(path.join("leftover"), b"x").unwrap();
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn scratch_directories_are_unique() {
        let base = tempfile::tempdir().unwrap();
        let a = ScratchMount::create_in(base.path()).unwrap();
        let b = ScratchMount::create_in(base.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn missing_base_is_an_io_error() {
        let base = tempfile::tempdir().unwrap();
        let err = ScratchMount::create_in(&base.path().join("missing"))
            .err()
            .unwrap();
        assert!(matches!(kind_of(&err), Some(Error::Io { .. })));
    }

    #[test]
    fn attach_rejects_unwritable_source_and_still_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let mut scratch = ScratchMount::create_in(base.path()).unwrap();
            let err = scratch
                .attach(&base.path().join("missing.img"), "ext4")
                .unwrap_err();
            assert!(matches!(kind_of(&err), Some(Error::AccessDenied { .. })));
            scratch.path().to_owned()
        };
        assert!(!path.exists());
    }

    #[test]
    fn mounted_scratch_directory_is_unmounted_then_removed() {
        if !system::getuid().is_root() {
            return;
        }
        let base = tempfile::tempdir().unwrap();
        let scratch = ScratchMount::create_in(base.path()).unwrap();
        let path = scratch.path().to_owned();
        let mounted = nix::mount::mount(
            Some("tmpfs"),
            path.as_path(),
            Some("tmpfs"),
            nix::mount::MsFlags::empty(),
            None::<&str>,
        );
        match mounted {
            Ok(()) => {}
            // Root without CAP_SYS_ADMIN, as in unprivileged containers
            Err(nix::errno::Errno::EPERM) => return,
            Err(e) => panic!("Failed to mount tmpfs on {path:?}: {e}"),
        }
        assert!(system::is_mounted(&path).unwrap());
        std::fs::write(path.join("inside-the-mount"), b"x").unwrap();

        drop(scratch);

        assert!(!path.exists());
        let mountinfo = std::fs::read_to_string("/proc/self/mountinfo").unwrap();
        assert!(!mountinfo.contains(path.to_str().unwrap()));
    }

    #[test]
    fn scratch_file_is_removed() {
        let base = tempfile::tempdir().unwrap();
        let path = {
            let (scratch, mut file) = ScratchFile::create_in(base.path()).unwrap();
            file.write_all(b"a/b.txt\n").unwrap();
            assert_eq!(std::fs::read(scratch.path()).unwrap(), b"a/b.txt\n");
            scratch.path().to_owned()
        };
        assert!(!path.exists());
    }
}
