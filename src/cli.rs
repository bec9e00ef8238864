use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Environment variable carrying the archive password.
pub const ENV_PASS: &str = "ARKIV_PASS";

#[derive(Parser)]
#[command(name = "arkiv")]
#[command(about = "Immutable, deduplicated, compressed and encrypted archives")]
#[command(author, version, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an archive from the given paths
    #[command(visible_alias = "c")]
    Create {
        /// Destination archive file
        archive: PathBuf,

        /// Paths to store; directories are walked without following symlinks
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// List entries matching optional prefixes
    #[command(name = "ls", visible_alias = "l")]
    Ls {
        /// Archive file to read
        archive: PathBuf,

        /// Escaped-path prefixes to select; empty selects everything
        prefixes: Vec<String>,
    },

    /// Restore entries under a destination directory
    #[command(visible_alias = "x")]
    Extract {
        /// Archive file to read
        archive: PathBuf,

        /// Directory to restore into
        dest: PathBuf,

        /// Escaped-path prefixes to select; empty selects everything
        prefixes: Vec<String>,
    },
}

// clap subcommands cannot start with a dash, so the historical spellings
// are rewritten onto their subcommand names before parsing.
pub fn normalize_args(args: impl Iterator<Item = OsString>) -> Vec<OsString> {
    args.enumerate()
        .map(|(at, arg)| {
            if at != 1 {
                return arg;
            }
            match arg.to_str() {
                Some("-c") | Some("--create") => OsString::from("create"),
                Some("-l") | Some("--ls") => OsString::from("ls"),
                Some("-x") | Some("--extract") => OsString::from("extract"),
                Some("h") => OsString::from("help"),
                _ => arg,
            }
        })
        .collect()
}
