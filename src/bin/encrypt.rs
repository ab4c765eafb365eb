//! Encrypt a file with the built-in Blowfish file key.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use lobbynet::encryption::FileCipher;

#[derive(Parser)]
#[command(name = "encrypt", about = "Encrypt a file with the built-in key")]
struct Args {
    /// File to encrypt.
    input: PathBuf,

    /// Where to write the encrypted file.
    output: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<()> {
    FileCipher::default_keys().encrypt_file(&args.input, &args.output)
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("encrypt: {e:#}");
            ExitCode::FAILURE
        }
    }
}
