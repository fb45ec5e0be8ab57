//! Main entry point for the runphar CLI application.
//!
//! Builds PHAR archives from directories and inspects, verifies, extracts
//! or compares archives from the local filesystem or HTTP URLs.

use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runphar::cli::{Command, CompileArgs, DiffArgs, ExtractArgs, InfoArgs, VerifyArgs};
use runphar::phar::{format_size, stub, PrivateKey};
use runphar::{
    diff, BuildOptions, Cli, DiffContext, ExtractOptions, FileCollector, PharArchive,
    PharBuilder, PharExtractor, ReadAt, Verification,
};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match cli.command {
        Command::Compile(args) => compile(args).await,
        Command::Info(args) => show_info(args).await,
        Command::Verify(args) => verify(args).await,
        Command::Extract(args) => extract(args).await,
        Command::Diff(args) => compare(args).await,
    }
}

async fn compile(args: CompileArgs) -> Result<ExitCode> {
    if !args.source.is_dir() {
        bail!("'{}' is not a directory", args.source.display());
    }

    let alias = args.alias.clone().unwrap_or_else(|| {
        args.output
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "app.phar".to_string())
    });

    let stub = match &args.stub {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read stub '{}'", path.display()))?,
        None => {
            let index = args.index.clone().or_else(|| {
                args.source
                    .join("index.php")
                    .is_file()
                    .then(|| "index.php".to_string())
            });
            stub::generate(&alias, index.as_deref(), true)
        }
    };

    let metadata = match &args.metadata {
        Some(path) => Some(
            tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read metadata '{}'", path.display()))?,
        ),
        None => None,
    };

    let private_key = match (&args.key, args.signature) {
        (Some(path), Some(algorithm)) if algorithm.is_openssl() => {
            Some(PrivateKey::load(path, args.key_pass.clone())?)
        }
        (Some(_), _) => {
            warn!("--key is only used with OpenSSL signatures, ignoring it");
            None
        }
        (None, _) => None,
    };

    let mut collector = FileCollector::new(&args.source)
        .compression(args.compression)
        .skip(&args.output);
    for pattern in &args.exclude {
        collector = collector.exclude(pattern.as_str());
    }
    let entries = collector.collect()?;
    if entries.is_empty() {
        bail!("no files to package in '{}'", args.source.display());
    }

    let phar = PharBuilder::new(stub)
        .with_options(BuildOptions {
            alias: Some(alias),
            metadata,
            signature: args.signature,
            private_key,
            timestamp: None,
            archive_compression: args.archive_compression,
        })
        .build(entries)
        .await?;
    phar.write_to(&args.output).await?;

    let size = tokio::fs::metadata(&args.output).await?.len();
    println!(
        "{}: {} entries ({})",
        args.output.display(),
        phar.manifest().entries.len(),
        format_size(size)
    );
    if let Some(signature) = phar.signature() {
        println!("{} signature: {}", signature.algorithm().name(), signature.hash());
    }
    Ok(ExitCode::SUCCESS)
}

async fn show_info(args: InfoArgs) -> Result<ExitCode> {
    let archive = open(&args.file).await?;
    let info = archive.info().await?;

    println!("{}", info.name);
    for line in info.summary_lines() {
        println!("  {line}");
    }

    if args.list {
        println!();
        list_entries(archive.extractor());
    }
    Ok(ExitCode::SUCCESS)
}

/// Print entries as a table with size, compression ratio and date.
fn list_entries(extractor: &PharExtractor<dyn ReadAt>) {
    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  Name",
        "Length", "Size", "Cmpr", "Date", "Time"
    );
    println!("{}", "-".repeat(70));

    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in extractor.entries() {
        let uncompressed = u64::from(entry.uncompressed_size);
        let compressed = u64::from(entry.compressed_size);
        let (date, time) = match entry.modified() {
            Some(dt) => (
                dt.format("%Y-%m-%d").to_string(),
                dt.format("%H:%M").to_string(),
            ),
            None => ("-".to_string(), "-".to_string()),
        };

        println!(
            "{:>10}  {:>10}  {}  {:>10}  {:>5}  {}",
            uncompressed,
            compressed,
            ratio(uncompressed, compressed),
            date,
            time,
            entry.path
        );

        if !entry.is_directory() {
            total_uncompressed += uncompressed;
            total_compressed += compressed;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(70));
    println!(
        "{:>10}  {:>10}  {}  {:>17}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_uncompressed, total_compressed),
        "",
        file_count
    );
}

/// Space saved, as a right-aligned percentage.
fn ratio(uncompressed: u64, compressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

async fn verify(args: VerifyArgs) -> Result<ExitCode> {
    let archive = open(&args.file).await?;
    let public_key = match &args.public_key {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read public key '{}'", path.display()))?,
        ),
        None => None,
    };

    match archive
        .verify(public_key.as_deref(), args.require_signature)
        .await?
    {
        Verification::Unsigned => {
            println!("{}: not signed", archive.name());
            Ok(ExitCode::SUCCESS)
        }
        Verification::Valid(signature) => {
            println!(
                "{}: {} signature OK ({})",
                archive.name(),
                signature.algorithm().name(),
                signature.hash()
            );
            Ok(ExitCode::SUCCESS)
        }
        Verification::Invalid(signature) => {
            eprintln!(
                "{}: {} signature does NOT match",
                archive.name(),
                signature.algorithm().name()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn extract(args: ExtractArgs) -> Result<ExitCode> {
    let archive = open(&args.file).await?;
    let options = ExtractOptions {
        use_cache: !args.no_cache,
        ..Default::default()
    };
    let dir = archive
        .extractor()
        .extract(&args.extract_dir, &options)
        .await
        .with_context(|| format!("failed to extract '{}'", archive.name()))?;

    info!(archive = archive.name(), "extracted");
    println!(
        "{}: {} entries extracted to {}",
        archive.name(),
        archive.extractor().entries().len(),
        dir.display()
    );
    Ok(ExitCode::SUCCESS)
}

async fn compare(args: DiffArgs) -> Result<ExitCode> {
    let left = open(&args.left).await?;
    let right = open(&args.right).await?;
    let ctx = DiffContext::new();

    let report = diff(&left, &right, args.mode, &ctx).await?;
    print!("{}", report.render());
    Ok(if report.has_differences() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn open(location: &str) -> Result<PharArchive> {
    if !runphar::io::is_http_url(location) && !Path::new(location).exists() {
        bail!("'{location}' does not exist");
    }
    PharArchive::open(location)
        .await
        .with_context(|| format!("failed to open '{location}'"))
}
