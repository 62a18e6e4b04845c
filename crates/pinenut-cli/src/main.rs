//! The Pinenut command line tool: key generation and log parsing.

use std::path::PathBuf;
use std::process::ExitCode;

use base64::{prelude::BASE64_STANDARD, Engine};
use clap::{Args, Parser, Subcommand};

use pinenut_log::{parse_to_file, DefaultFormatter, SecretKey};

#[derive(Parser)]
#[command(name = "pinenut", about = "The Pinenut command line tool.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generates an ECDH key pair for log encryption.
    GenKeys(GenKeys),
    /// Parses a binary log file into a readable text file.
    Parse(Parse),
}

#[derive(Args)]
struct GenKeys;

impl GenKeys {
    fn run(self) -> Result<(), String> {
        let (secret_key, public_key) = pinenut_log::gen_key_pair();
        println!("ECDH Keys:");
        println!("-----------");
        println!("Secret Key: {}", BASE64_STANDARD.encode(secret_key));
        println!("Public Key: {}", BASE64_STANDARD.encode(public_key));
        Ok(())
    }
}

#[derive(Args)]
struct Parse {
    /// Path to the log file.
    path: PathBuf,

    /// Path to the destination file. Defaults to the input path with `.log`
    /// appended.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Base64 secret key for encrypted logs.
    #[arg(short, long)]
    secret_key: Option<String>,
}

impl Parse {
    fn run(self) -> Result<(), String> {
        let output = self.output.unwrap_or_else(|| {
            let mut path = self.path.clone().into_os_string();
            path.push(".log");
            PathBuf::from(path)
        });

        let secret_key = match self.secret_key {
            None => None,
            Some(encoded) => Some(decode_secret_key(&encoded)?),
        };

        parse_to_file(&self.path, &output, secret_key, DefaultFormatter)
            .map_err(|err| err.to_string())?;
        println!("Parsed into {}", output.display());
        Ok(())
    }
}

fn decode_secret_key(encoded: &str) -> Result<SecretKey, String> {
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| "the secret key is not valid base64".to_string())?;
    bytes
        .try_into()
        .map_err(|_| "the secret key has the wrong length".to_string())
}

impl Command {
    fn run(self) -> Result<(), String> {
        match self {
            Self::GenKeys(gen_keys) => gen_keys.run(),
            Self::Parse(parse) => parse.run(),
        }
    }
}

fn main() -> ExitCode {
    match Cli::parse().command.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("Error: {message}");
            ExitCode::FAILURE
        }
    }
}
