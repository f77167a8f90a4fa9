//! Running commands in a lower image under systemd-nspawn.

use crate::{
    error::Error,
    linux::{
        access,
        privilege::RealRootSection,
        running::{self, Environment},
        scratch::ScratchMount,
        system,
    },
    log,
};
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const NSPAWN: &str = "systemd-nspawn";
const MACHINE_PREFIX: &str = "genpack-";
// Portage's network sandbox needs CAP_NET_ADMIN
const CAPABILITIES: &str = "CAP_MKNOD,CAP_SYS_ADMIN,CAP_NET_ADMIN";

const HOST_GUEST_DIR: &str = "/mnt/host";
const BINPKGS_GUEST_DIR: &str = "/var/cache/binpkgs";
const DOWNLOAD_GUEST_DIR: &str = "/var/cache/download";
const GENPACK_OVERLAY_GUEST_DIR: &str = "/var/db/repos/genpack-overlay";
const EXTRA_IMAGE_GUEST_DIR: &str = "/mnt/extra";

const IMAGE_FS_TYPE: &str = "ext4";

/// An image whose subdirectory is layered over the guest's root.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayImage {
    pub image: PathBuf,
    pub subdir: PathBuf,
}

impl FromStr for OverlayImage {
    type Err = Error;

    fn from_str(arg: &str) -> std::result::Result<Self, Self::Err> {
        let (image, subdir) = arg.split_once(':').ok_or_else(|| {
            Error::ArgumentError(format!(
                "--overlay-image must be in the format <image>:<subdir>, got {arg:?}"
            ))
        })?;
        let subdir = PathBuf::from(subdir);
        if !system::is_confined(&subdir) {
            return Err(Error::ArgumentError(format!(
                "Overlay subdirectory {subdir:?} must be relative and must not contain '..'"
            )));
        }
        Ok(Self {
            image: PathBuf::from(image),
            subdir,
        })
    }
}

/// Parses `KEY=VALUE` pairs. Later assignments to the same key win.
pub fn parse_env(args: &[String]) -> Result<BTreeMap<String, String>, Error> {
    let mut env = BTreeMap::new();
    for arg in args {
        let (key, value) = arg.split_once('=').ok_or_else(|| {
            Error::ArgumentError(format!("Invalid environment variable format: {arg}"))
        })?;
        env.insert(key.to_owned(), value.to_owned());
    }
    Ok(env)
}

/// What to attach to the guest on top of the lower image.
#[derive(Clone, Debug, Default)]
pub struct LaunchSpec {
    pub env: BTreeMap<String, String>,
    pub console: Option<String>,
    pub genpack_overlay_dir: Option<PathBuf>,
    pub binpkgs_dir: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub overlay_image: Option<OverlayImage>,
    pub extra_image: Option<PathBuf>,
}

impl LaunchSpec {
    /// Every host path the launch would expose, in the order they are checked.
    fn host_paths(&self) -> impl Iterator<Item = &Path> {
        [
            self.binpkgs_dir.as_deref(),
            self.download_dir.as_deref(),
            self.genpack_overlay_dir.as_deref(),
            self.overlay_image.as_ref().map(|overlay| overlay.image.as_path()),
            self.extra_image.as_deref(),
        ]
        .into_iter()
        .flatten()
    }
}

/// Where the images requested by a [`LaunchSpec`] ended up on the host.
#[derive(Debug, Default)]
pub struct MountedImages<'a> {
    /// Overlay image subdirectory to layer over `/`.
    pub overlay_root: Option<&'a Path>,
    pub extra_root: Option<&'a Path>,
}

/// Builds the systemd-nspawn command line.
pub struct NspawnCommand {
    argv: Vec<String>,
    idmap: bool,
}

impl NspawnCommand {
    /// `idmap` maps the caller's files to root in the guest; it is needed whenever the caller is
    /// not root.
    pub fn new(lower_img: &Path, machine_id: u32, idmap: bool) -> Self {
        let mut command = Self {
            argv: vec![
                NSPAWN.to_owned(),
                "-q".to_owned(),
                "--suppress-sync=true".to_owned(),
                "--as-pid2".to_owned(),
                "-M".to_owned(),
                format!("{MACHINE_PREFIX}{machine_id}"),
                format!("--image={}", lower_img.display()),
                "--tmpfs=/var/tmp".to_owned(),
                format!("--capability={CAPABILITIES}"),
            ],
            idmap,
        };
        command.argv.push(if idmap {
            format!("--bind=.:{HOST_GUEST_DIR}:rootidmap")
        } else {
            format!("--bind=.:{HOST_GUEST_DIR}")
        });
        command
    }

    fn bind(&mut self, host: &Path, guest: &str, idmap: bool) -> &mut Self {
        let mut arg = format!("--bind={}:{guest}", system::escape_colon(host));
        if idmap {
            arg.push_str(":rootidmap");
        }
        self.argv.push(arg);
        self
    }

    pub fn cache_bind(&mut self, host: &Path, guest: &str) -> &mut Self {
        self.bind(host, guest, self.idmap)
    }

    /// Binds without idmapping; the guest must see the true ownership.
    pub fn plain_bind(&mut self, host: &Path, guest: &str) -> &mut Self {
        self.bind(host, guest, false)
    }

    pub fn setenv(&mut self, key: &str, value: &str) -> &mut Self {
        self.argv.push(format!("--setenv={key}={value}"));
        self
    }

    pub fn console(&mut self, mode: &str) -> &mut Self {
        self.argv.push(format!("--console={mode}"));
        self
    }

    pub fn overlay_root(&mut self, upper: &Path) -> &mut Self {
        self.argv
            .push(format!("--overlay=+/:{}:/", system::escape_colon(upper)));
        self
    }

    pub fn command<S: AsRef<str>>(mut self, command: &[S]) -> Vec<String> {
        self.argv
            .extend(command.iter().map(|arg| arg.as_ref().to_owned()));
        self.argv
    }
}

/// Assembles the full command line for a launch whose images are already mounted.
pub fn compose<S: AsRef<str>>(
    lower_img: &Path,
    spec: &LaunchSpec,
    mounted: &MountedImages,
    machine_id: u32,
    idmap: bool,
    command: &[S],
) -> Vec<String> {
    let mut nspawn = NspawnCommand::new(lower_img, machine_id, idmap);
    if let Some(dir) = &spec.binpkgs_dir {
        nspawn.cache_bind(dir, BINPKGS_GUEST_DIR);
    }
    if let Some(dir) = &spec.download_dir {
        nspawn.cache_bind(dir, DOWNLOAD_GUEST_DIR);
    }
    if let Some(dir) = &spec.genpack_overlay_dir {
        nspawn.plain_bind(dir, GENPACK_OVERLAY_GUEST_DIR);
    }
    for (key, value) in &spec.env {
        nspawn.setenv(key, value);
    }
    if let Some(mode) = &spec.console {
        nspawn.console(mode);
    }
    if let Some(upper) = mounted.overlay_root {
        nspawn.overlay_root(upper);
    }
    if let Some(root) = mounted.extra_root {
        nspawn.plain_bind(root, EXTRA_IMAGE_GUEST_DIR);
    }
    nspawn.command(command)
}

/// Runs `command` in the lower image under systemd-nspawn. Returns its exit status.
pub fn nspawn<S: AsRef<str>>(
    lower_img: &Path,
    spec: &LaunchSpec,
    command: &[S],
) -> Result<i32> {
    // Everything the guest gets to see must belong to the caller, checked before anything is
    // mounted
    access::must_be_owned_by_caller(Path::new("."))?;
    access::must_be_owned_by_caller(lower_img)?;
    for path in spec.host_paths() {
        access::must_be_owned_by_caller(path)?;
    }

    let overlay_mount = match &spec.overlay_image {
        Some(overlay) => {
            let mut mount = ScratchMount::create()?;
            mount.attach(&overlay.image, IMAGE_FS_TYPE)?;
            let upper = system::resolve_inside(mount.path(), &overlay.subdir)?;
            Some((mount, upper))
        }
        None => None,
    };

    let extra_mount = match &spec.extra_image {
        Some(image) => {
            let mut mount = ScratchMount::create()?;
            mount.attach(image, IMAGE_FS_TYPE)?;
            Some(mount)
        }
        None => None,
    };

    let mounted = MountedImages {
        overlay_root: overlay_mount.as_ref().map(|(_, upper)| upper.as_path()),
        extra_root: extra_mount.as_ref().map(ScratchMount::path),
    };
    let idmap = !system::getuid().is_root();
    let argv = compose(lower_img, spec, &mounted, std::process::id(), idmap, command);

    log!("nspawn command line: {}", argv.join(" "));

    let _section = RealRootSection::enter()?;
    Ok(running::run(&argv, None, Environment::System))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    const BASE: [&str; 10] = [
        "systemd-nspawn",
        "-q",
        "--suppress-sync=true",
        "--as-pid2",
        "-M",
        "genpack-4242",
        "--image=/work/lower.img",
        "--tmpfs=/var/tmp",
        "--capability=CAP_MKNOD,CAP_SYS_ADMIN,CAP_NET_ADMIN",
        "--bind=.:/mnt/host:rootidmap",
    ];

    fn compose_simple(spec: &LaunchSpec, mounted: &MountedImages, idmap: bool) -> Vec<String> {
        compose(
            Path::new("/work/lower.img"),
            spec,
            mounted,
            4242,
            idmap,
            &["emerge", "-uDN", "@world"],
        )
    }

    #[test]
    fn minimal_launch() {
        let argv = compose_simple(&LaunchSpec::default(), &MountedImages::default(), true);
        let mut expected: Vec<&str> = BASE.to_vec();
        expected.extend(["emerge", "-uDN", "@world"]);
        assert_eq!(argv, expected);
    }

    #[test]
    fn root_caller_gets_no_idmap() {
        let spec = LaunchSpec {
            binpkgs_dir: Some("/cache/binpkgs".into()),
            ..Default::default()
        };
        let argv = compose_simple(&spec, &MountedImages::default(), false);
        assert!(argv.contains(&"--bind=.:/mnt/host".to_owned()));
        assert!(argv.contains(&"--bind=/cache/binpkgs:/var/cache/binpkgs".to_owned()));
        assert!(!argv.iter().any(|arg| arg.contains("rootidmap")));
    }

    #[test]
    fn full_launch_order() {
        let spec = LaunchSpec {
            env: parse_env(&["USE=-X".to_owned(), "FEATURES=buildpkg".to_owned()]).unwrap(),
            console: Some("pipe".to_owned()),
            genpack_overlay_dir: Some("/src/genpack-overlay".into()),
            binpkgs_dir: Some("/cache/binpkgs".into()),
            download_dir: Some("/cache/distfiles".into()),
            overlay_image: Some("/work/upper.img:upper".parse().unwrap()),
            extra_image: Some("/work/extra.img".into()),
        };
        let mounted = MountedImages {
            overlay_root: Some(Path::new("/tmp/genpack-helper.AAAAAA/upper")),
            extra_root: Some(Path::new("/tmp/genpack-helper.BBBBBB")),
        };
        let argv = compose_simple(&spec, &mounted, true);
        assert_eq!(
            &argv[BASE.len()..],
            [
                "--bind=/cache/binpkgs:/var/cache/binpkgs:rootidmap",
                "--bind=/cache/distfiles:/var/cache/download:rootidmap",
                "--bind=/src/genpack-overlay:/var/db/repos/genpack-overlay",
                "--setenv=FEATURES=buildpkg",
                "--setenv=USE=-X",
                "--console=pipe",
                "--overlay=+/:/tmp/genpack-helper.AAAAAA/upper:/",
                "--bind=/tmp/genpack-helper.BBBBBB:/mnt/extra",
                "emerge",
                "-uDN",
                "@world",
            ]
        );
    }

    #[test]
    fn colons_in_host_paths_are_escaped() {
        let spec = LaunchSpec {
            binpkgs_dir: Some("/cache/a:b".into()),
            genpack_overlay_dir: Some("/src/c:d".into()),
            ..Default::default()
        };
        let mounted = MountedImages {
            overlay_root: Some(Path::new("/tmp/x:y/upper")),
            extra_root: Some(Path::new("/tmp/e:f")),
        };
        let argv = compose_simple(&spec, &mounted, true);
        for expected in [
            "--bind=/cache/a\\:b:/var/cache/binpkgs:rootidmap",
            "--bind=/src/c\\:d:/var/db/repos/genpack-overlay",
            "--overlay=+/:/tmp/x\\:y/upper:/",
            "--bind=/tmp/e\\:f:/mnt/extra",
        ] {
            assert!(argv.contains(&expected.to_owned()), "{expected} in {argv:?}");
        }
    }

    #[test]
    fn env_values_may_contain_equals_signs() {
        let env = parse_env(&["A=b=c".to_owned(), "EMPTY=".to_owned(), "A=d".to_owned()]).unwrap();
        assert_eq!(env["A"], "d");
        assert_eq!(env["EMPTY"], "");
    }

    #[test]
    fn env_without_equals_is_rejected() {
        let err = parse_env(&["NOVALUE".to_owned()]).unwrap_err();
        assert!(matches!(err, Error::ArgumentError(_)));
    }

    #[test]
    fn overlay_image_argument() {
        let overlay: OverlayImage = "/work/upper.img:upper".parse().unwrap();
        assert_eq!(overlay.image, Path::new("/work/upper.img"));
        assert_eq!(overlay.subdir, Path::new("upper"));

        for bad in ["/work/upper.img", "/work/upper.img:/etc", "/work/upper.img:../x"] {
            assert!(
                matches!(bad.parse::<OverlayImage>(), Err(Error::ArgumentError(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn foreign_binpkgs_dir_is_rejected_before_mounting() {
        if system::getuid().is_root() {
            return;
        }
        let spec = LaunchSpec {
            binpkgs_dir: Some("/".into()),
            // Would fail with a mount error if the check did not come first
            overlay_image: Some("/nonexistent.img:upper".parse().unwrap()),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let lower = dir.path().join("lower.img");
        std::fs::write(&lower, b"").unwrap();

        let err = nspawn(&lower, &spec, &["true"]).unwrap_err();
        assert!(
            matches!(kind_of(&err), Some(Error::AccessDenied { .. })),
            "unexpected error {err:?}"
        );
    }
}
