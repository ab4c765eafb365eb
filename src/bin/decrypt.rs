//! Decrypt a Blowfish encrypted file.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use lobbynet::encryption::FileCipher;

#[derive(Parser)]
#[command(name = "decrypt", about = "Decrypt a file with the built-in key")]
struct Args {
    /// Encrypted file to read.
    input: PathBuf,

    /// Where to write the decrypted contents.
    output: PathBuf,
}

fn run(args: &Args) -> anyhow::Result<()> {
    let data = FileCipher::default_keys().decrypt_file(&args.input)?;
    std::fs::write(&args.output, data)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("decrypt: {e:#}");
            ExitCode::FAILURE
        }
    }
}
