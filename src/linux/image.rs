use crate::{
    error::Error,
    linux::{
        access,
        privilege::RealRootSection,
        running::{self, Environment},
        scratch::ScratchMount,
        session::Session,
        system,
    },
    log,
};
use anyhow::{Context, Result};
use std::path::Path;

const LOWER_FS_TYPE: &str = "ext4";

/// Unpacks a stage3 tarball into a freshly formatted lower image.
pub fn stage3(session: &Session, lower_img: &Path, archive_tar: &Path) -> Result<()> {
    access::must_be_readable_by_caller(archive_tar)?;

    let mut root = ScratchMount::create()?;
    root.attach(lower_img, LOWER_FS_TYPE)?;

    let archive = archive_tar
        .to_str()
        .with_context(|| format!("Archive path {archive_tar:?} is not UTF-8"))?;
    let target = root
        .path()
        .to_str()
        .with_context(|| format!("Scratch path {:?} is not UTF-8", root.path()))?;

    let flags = if session.debug { "xvpf" } else { "xpf" };
    let status = running::run(&["tar", flags, archive, "-C", target], None, Environment::System);
    if status != 0 {
        return Err(Error::SubprocessFailure {
            command: format!("Extracting stage3 archive {archive_tar:?}"),
            status,
        }
        .into());
    }
    Ok(())
}

/// Runs `command` chrooted into the lower image, as real root. Returns its exit status.
pub fn lower<S: AsRef<str>>(lower_img: &Path, command: &[S]) -> Result<i32> {
    if command.is_empty() {
        let message = "No command given to run in the lower image".to_owned();
        return Err(Error::ArgumentError(message).into());
    }

    let mut root = ScratchMount::create()?;
    root.attach(lower_img, LOWER_FS_TYPE)?;
    log!("Lower image {lower_img:?} is mounted on {:?}", root.path());

    let _section = RealRootSection::enter()?;
    log!("uid={} euid={}", system::getuid(), system::geteuid());
    Ok(running::run(command, Some(root.path()), Environment::Inherited))
}
