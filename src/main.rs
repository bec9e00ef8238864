use std::env;
use std::process::ExitCode;

use clap::Parser;
use zeroize::Zeroizing;

use arkiv::cli::{self, Cli, Commands, ENV_PASS};
use arkiv::{ArchiveError, ArchiveReader, ArchiveWriter};

fn main() -> ExitCode {
    env_logger::init();

    let args = cli::normalize_args(env::args_os());
    let cli = Cli::parse_from(args);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), ArchiveError> {
    let password = password_from_env()?;

    match cli.command {
        Commands::Create { archive, paths } => {
            ArchiveWriter::new(archive, password.to_vec()).create(&paths)
        }
        Commands::Ls { archive, prefixes } => {
            let mut reader = ArchiveReader::new(archive, password.to_vec());
            for line in reader.list(&prefixes)? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Extract {
            archive,
            dest,
            prefixes,
        } => ArchiveReader::new(archive, password.to_vec()).extract(&dest, &prefixes),
    }
}

fn password_from_env() -> Result<Zeroizing<Vec<u8>>, ArchiveError> {
    use std::os::unix::ffi::OsStringExt;

    match env::var_os(ENV_PASS) {
        Some(value) if !value.is_empty() => Ok(Zeroizing::new(value.into_vec())),
        _ => Err(ArchiveError::MissingPassword(ENV_PASS)),
    }
}
