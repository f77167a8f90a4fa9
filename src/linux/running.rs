use crate::log;
use std::ffi::{OsStr, OsString};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Reported when the child could not be started, or did not exit on its own.
pub const FAILURE: i32 = -1;

/// Search path for the helper's own tools. Never taken from the caller.
pub const SYSTEM_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

// Passed through to system tools so that interactive consoles keep working
const PASSED_THROUGH: [&str; 1] = ["TERM"];

/// What a child gets to see of the caller's environment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Environment {
    /// A tool of the helper itself: looked up in [`SYSTEM_PATH`], started with an environment
    /// holding only `PATH` and the terminal type.
    System,
    /// A command chosen by the caller: started with the caller's environment, looked up in the
    /// caller's `PATH` after the optional chroot.
    Inherited,
}

/// Runs `argv` to completion and returns its exit code.
///
/// Standard streams are inherited.
pub fn run<S: AsRef<str>>(argv: &[S], root: Option<&Path>, env: Environment) -> i32 {
    let caller: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    run_with_caller_env(argv, root, env, &caller)
}

fn run_with_caller_env<S: AsRef<str>>(
    argv: &[S],
    root: Option<&Path>,
    env: Environment,
    caller: &[(OsString, OsString)],
) -> i32 {
    let Some((program, args)) = argv.split_first() else {
        log!(warn, "Refusing to run an empty command");
        return FAILURE;
    };

    let mut command = match env {
        Environment::System => {
            let Some(path) = find_program(program.as_ref(), SYSTEM_PATH) else {
                log!(warn, "{} was not found in {SYSTEM_PATH}", program.as_ref());
                return FAILURE;
            };
            let mut command = Command::new(path);
            let passed = caller
                .iter()
                .filter(|(key, _)| PASSED_THROUGH.iter().any(|name| key == OsStr::new(name)))
                .map(|(key, value)| (key, value));
            command.env_clear().env("PATH", SYSTEM_PATH).envs(passed);
            command
        }
        Environment::Inherited => {
            let mut command = Command::new(program.as_ref());
            command.env_clear().envs(caller.iter().cloned());
            command
        }
    };
    command.args(args.iter().map(AsRef::as_ref));

    if let Some(root) = root {
        log!("Running `{}` chrooted into {root:?}", command_line(argv));
        let root = root.to_owned();
        unsafe {
            command.pre_exec(move || {
                nix::unistd::chdir(&root)?;
                nix::unistd::chroot(&root)?;
                Ok(())
            });
        }
    } else {
        log!("Running `{}`", command_line(argv));
    }

    let status = match command.status() {
        Ok(status) => status,
        Err(e) => {
            log!(warn, "Failed to start {}: {e}", program.as_ref());
            return FAILURE;
        }
    };

    match status.code() {
        Some(code) => code,
        None => {
            log!(
                warn,
                "{} was terminated by signal {}",
                program.as_ref(),
                status.signal().unwrap_or_default()
            );
            FAILURE
        }
    }
}

/// First executable regular file called `name` in the colon-separated `search_path`.
fn find_program(name: &str, search_path: &str) -> Option<PathBuf> {
    if name.is_empty() || name.as_bytes().contains(&b'/') {
        return None;
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| {
            std::fs::metadata(candidate).is_ok_and(|metadata| {
                metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
            })
        })
}

fn command_line<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(" ")
}
