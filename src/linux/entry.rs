use crate::{
    entry,
    linux::{image, nspawn, running, session::Session, sync, system},
    log,
    log::LogLevel,
    mountns,
};
use anyhow::{bail, Result};
use std::str::FromStr;

const SETUID_REQUIRED: &str = "This program's setuid bit must be set to run with root privileges.";

/// Checks that must pass before the command line is even looked at.
pub fn sanity_checks() -> Result<()> {
    if !system::geteuid().is_root() {
        bail!(SETUID_REQUIRED);
    }

    // With suid_dumpable = 1, a core dump of this process is readable by the invoking user
    if let Ok(suid_dumpable) = std::fs::read_to_string("/proc/sys/fs/suid_dumpable") {
        if suid_dumpable == "1\n" {
            log!(warn, "suid_dumpable is set to 1; a crash may leak privileged memory");
        }
    }
    Ok(())
}

pub fn main(cli_args: entry::CLIArgs) -> i32 {
    let log_level = if cli_args.debug {
        LogLevel::Notice
    } else {
        match std::env::var("GENPACK_HELPER_LOG") {
            Ok(name) => match LogLevel::parse(&name) {
                Some(level) => level,
                None => {
                    eprintln!("Unknown log level {name}");
                    return 1;
                }
            },
            Err(_) => LogLevel::Warn,
        }
    };
    log::enable_diagnostics("genpack-helper", log_level);

    let session = Session::new(cli_args.debug);

    if let Err(e) = mountns::enter_private_mountns() {
        eprintln!("Failed to enter a private mount namespace: {e}");
        return 1;
    }

    let name = cli_args.command.name();
    match execute(&session, cli_args.command) {
        Ok(status) => exit_code(status),
        Err(e) => {
            if session.debug {
                eprintln!("{e:?}");
            } else {
                eprintln!("Error occurred while executing subcommand '{name}': {e:#}");
            }
            1
        }
    }
}

fn execute(session: &Session, command: entry::CLICommand) -> Result<i32> {
    match command {
        entry::CLICommand::Ping => Ok(0),
        entry::CLICommand::Stage3(command) => {
            image::stage3(session, &command.lower_img, &command.archive_tar)?;
            Ok(0)
        }
        entry::CLICommand::Lower(command) => {
            image::lower(&command.lower_img, &command.command)
        }
        entry::CLICommand::Nspawn(command) => {
            let spec = launch_spec(&command)?;
            nspawn::nspawn(&command.lower_img, &spec, &command.command)
        }
        entry::CLICommand::Copy(command) => sync::copy(
            session,
            &command.src_img,
            &command.dst_img,
            &command.dst_dir,
            std::io::stdin().lock(),
        ),
    }
}

fn launch_spec(command: &entry::CLINspawnCommand) -> Result<nspawn::LaunchSpec> {
    let overlay_image = command
        .overlay_image
        .as_deref()
        .map(nspawn::OverlayImage::from_str)
        .transpose()?;
    Ok(nspawn::LaunchSpec {
        env: nspawn::parse_env(&command.setenv)?,
        console: command.console.clone(),
        genpack_overlay_dir: command.genpack_overlay_dir.clone(),
        binpkgs_dir: command.binpkgs_dir.clone(),
        download_dir: command.download_dir.clone(),
        overlay_image,
        extra_image: command.extra_image.clone(),
    })
}

// Statuses that are not a plain exit code (signals, spawn failures) are reported as failure
fn exit_code(status: i32) -> i32 {
    if status == running::FAILURE || !(0..=255).contains(&status) {
        1
    } else {
        status
    }
}
