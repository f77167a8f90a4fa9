use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "genpack-helper", author, version, about, long_about = None)]
pub struct CLIArgs {
    /// Trace mounts, removals and uid changes, and report errors unabridged
    #[arg(short = 'g', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: CLICommand,
}

#[derive(Subcommand)]
pub enum CLICommand {
    /// Check if the program is properly installed
    Ping,

    /// Extract a stage3 archive into a lower image
    Stage3(CLIStage3Command),

    /// Execute a command in the lower image
    Lower(CLILowerCommand),

    /// Run a command in a lower image using systemd-nspawn
    Nspawn(CLINspawnCommand),

    /// Copy files between two images according to a file list read from stdin
    Copy(CLICopyCommand),
}

impl CLICommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Stage3(_) => "stage3",
            Self::Lower(_) => "lower",
            Self::Nspawn(_) => "nspawn",
            Self::Copy(_) => "copy",
        }
    }
}

#[derive(Args)]
pub struct CLIStage3Command {
    /// Path to the formatted lower image file
    pub lower_img: PathBuf,

    /// Path to the stage3 archive file (tar.xz)
    pub archive_tar: PathBuf,
}

#[derive(Args)]
pub struct CLILowerCommand {
    /// Path to the formatted lower image file
    pub lower_img: PathBuf,

    /// Command to execute in the lower image
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct CLINspawnCommand {
    /// Path to the formatted lower image file
    pub lower_img: PathBuf,

    /// Set an environment variable for the command
    #[arg(short = 'E', long = "setenv", value_name = "KEY=VALUE")]
    pub setenv: Vec<String>,

    /// Console mode (see systemd-nspawn(1))
    #[arg(long, value_name = "MODE")]
    pub console: Option<String>,

    /// Directory for binary packages, bound at /var/cache/binpkgs
    #[arg(short = 'B', long, value_name = "DIR")]
    pub binpkgs_dir: Option<PathBuf>,

    /// Directory for downloaded files, bound at /var/cache/download
    #[arg(short = 'D', long, value_name = "DIR")]
    pub download_dir: Option<PathBuf>,

    /// Override the genpack overlay directory
    #[arg(short = 'O', long, value_name = "DIR")]
    pub genpack_overlay_dir: Option<PathBuf>,

    /// Image and subdirectory to layer over the guest's root
    #[arg(short = 'I', long, value_name = "IMAGE:SUBDIR")]
    pub overlay_image: Option<String>,

    /// Extra image to bind at /mnt/extra
    #[arg(short = 'X', long, value_name = "IMAGE")]
    pub extra_image: Option<PathBuf>,

    /// Command to run in the lower image
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct CLICopyCommand {
    /// Path to the source image file
    pub src_img: PathBuf,

    /// Path to the destination image file
    pub dst_img: PathBuf,

    /// Destination directory inside the destination image
    #[arg(short = 'd', long, default_value = "", value_name = "DIR")]
    pub dst_dir: PathBuf,
}

#[cfg(target_os = "linux")]
pub fn main() {
    if let Err(e) = crate::linux::entry::sanity_checks() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let cli_args = match CLIArgs::try_parse() {
        Ok(cli_args) => cli_args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };
    std::process::exit(crate::linux::entry::main(cli_args));
}
