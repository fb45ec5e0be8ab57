use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::diff::DiffMode;
use crate::phar::{Compression, SignatureAlgorithm};

#[derive(Parser, Debug)]
#[command(name = "runphar")]
#[command(version)]
#[command(about = "Build, inspect, verify, extract and compare PHAR archives", long_about = None)]
#[command(after_help = "Examples:\n  \
  runphar compile src -o app.phar --compression gz --signature sha256\n  \
  runphar info -l https://example.com/tool.phar   list entries of a remote archive\n  \
  runphar diff old.phar new.phar --mode checksum")]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Package a directory into a PHAR archive
    Compile(CompileArgs),
    /// Show archive information
    Info(InfoArgs),
    /// Check the archive signature
    Verify(VerifyArgs),
    /// Extract all entries
    Extract(ExtractArgs),
    /// Compare two archives (exit code 1 when they differ)
    Diff(DiffArgs),
}

#[derive(clap::Args, Debug)]
pub struct CompileArgs {
    /// Directory to package
    #[arg(value_name = "DIR")]
    pub source: PathBuf,

    /// Output archive path
    #[arg(short = 'o', long, value_name = "OUT")]
    pub output: PathBuf,

    /// Stub file; a loader stub is generated when omitted
    #[arg(long, value_name = "FILE")]
    pub stub: Option<PathBuf>,

    /// Entry script required by the generated stub
    #[arg(long, value_name = "PATH", conflicts_with = "stub")]
    pub index: Option<String>,

    /// Archive alias (defaults to the output file name)
    #[arg(long)]
    pub alias: Option<String>,

    /// Per-entry compression: none, gz or bz2
    #[arg(long, default_value = "none")]
    pub compression: Compression,

    /// Whole-archive compression: none, gz or bz2
    #[arg(long, default_value = "none")]
    pub archive_compression: Compression,

    /// md5, sha1, sha256, sha512, openssl, openssl-sha256 or openssl-sha512
    #[arg(long)]
    pub signature: Option<SignatureAlgorithm>,

    /// PEM private key for OpenSSL signatures
    #[arg(long, value_name = "PEM")]
    pub key: Option<PathBuf>,

    /// Passphrase of the private key
    #[arg(long, env = "RUNPHAR_KEY_PASS", hide_env_values = true)]
    pub key_pass: Option<String>,

    /// Exclude paths matching a glob, prefix or file name
    #[arg(short = 'x', long, value_name = "GLOB")]
    pub exclude: Vec<String>,

    /// File whose bytes are stored as archive metadata
    #[arg(long, value_name = "FILE")]
    pub metadata: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct InfoArgs {
    /// PHAR file path or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// List entries with size, compression ratio and date
    #[arg(short = 'l', long)]
    pub list: bool,
}

#[derive(clap::Args, Debug)]
pub struct VerifyArgs {
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Treat an unsigned archive as invalid
    #[arg(long)]
    pub require_signature: bool,

    /// Public key for OpenSSL signatures (default: <FILE>.pubkey)
    #[arg(long, value_name = "PEM")]
    pub public_key: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
pub struct ExtractArgs {
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Extract files into DIR
    #[arg(short = 'd', value_name = "DIR", default_value = ".")]
    pub extract_dir: PathBuf,

    /// Extract even if DIR already holds this archive
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(clap::Args, Debug)]
pub struct DiffArgs {
    #[arg(value_name = "A")]
    pub left: String,

    #[arg(value_name = "B")]
    pub right: String,

    /// file-name, checksum, git or gnu
    #[arg(long, default_value = "file-name")]
    pub mode: DiffMode,
}

impl Cli {
    /// Default tracing directive for the chosen verbosity.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }
}
