//! # mediagrid CLI
//!
//! Administration interface for mediagrid CDN data: integrity checks,
//! manual deposits, lookups, and on-demand scaling.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use mediagrid_config::logging::{init_logging, LogLevel};
use mediagrid_config::Config;
use mediagrid_store::{CdnData, ContentType, ResourceId, Version};

/// mediagrid - content-addressed media storage for a CDN
#[derive(Parser)]
#[command(name = "mediagrid")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// CDN data root directory (overrides configuration)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a runtime integrity check and print every issue found
    Fsck,

    /// Deposit a file as a new resource (or find a byte-equal existing one)
    Deposit {
        /// File to deposit
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Declared MIME type, e.g. image/jpeg; guessed from the extension
        /// when omitted
        #[arg(short = 't', long = "type")]
        mime: Option<String>,
    },

    /// Print the versions of a resource
    Lookup {
        /// Resource identifier, 16 lower-case hex characters
        #[arg(value_name = "ID")]
        id: String,
    },

    /// Derive a scaled version of a resource's original
    Scale {
        /// Resource identifier, 16 lower-case hex characters
        #[arg(value_name = "ID")]
        id: String,

        /// Target width in pixels
        #[arg(short = 'W', long)]
        width: Option<u32>,

        /// Target height in pixels
        #[arg(short = 'H', long)]
        height: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    });

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("unable to load config from {}", path.display()))?,
        None => Config::load().context("unable to load config")?,
    };
    if let Some(root) = cli.root {
        config.root = root;
    }

    match cli.command {
        Commands::Fsck => fsck(&config),
        Commands::Deposit { file, mime } => deposit(&config, &file, mime.as_deref()),
        Commands::Lookup { id } => lookup(&config, &id),
        Commands::Scale { id, width, height } => scale(&config, &id, width, height),
    }
}

fn open(config: &Config, uploader: bool) -> Result<CdnData> {
    CdnData::open(&config.root, config.csync2_group(), uploader)
        .with_context(|| format!("unable to open CDN data at {}", config.root.display()))
}

fn fsck(config: &Config) -> Result<()> {
    let cdn = open(config, false)?;
    let report = cdn.fsck();
    for (path, issue) in report.iter() {
        println!("{}: {issue}", path.display());
    }
    println!(
        "{} issue(s), {} severe",
        report.len(),
        report.severe_count()
    );
    if report.severe_count() > 0 {
        bail!("fsck found severe issues");
    }
    Ok(())
}

fn content_type_for(file: &Path, mime: Option<&str>) -> Result<ContentType> {
    match mime {
        Some(mime) => Ok(ContentType::for_mime(mime)?),
        None => {
            let extension = file
                .extension()
                .and_then(|e| e.to_str())
                .context("file has no extension; pass --type")?;
            Ok(ContentType::for_extension(extension)?)
        }
    }
}

fn deposit(config: &Config, file: &Path, mime: Option<&str>) -> Result<()> {
    let content_type = content_type_for(file, mime)?;
    let cdn = open(config, true)?;
    let upload_file = cdn.uploads()?.create_upload_file(content_type)?;
    let temp_file = upload_file
        .temp_file()
        .context("upload file already consumed")?;
    fs::copy(file, &temp_file)
        .with_context(|| format!("unable to copy {} into uploads", file.display()))?;
    let version = cdn.find_or_add(&upload_file)?;
    println!(
        "{} -> {}/{}",
        file.display(),
        version.resource().id(),
        version.filename()
    );
    Ok(())
}

fn lookup(config: &Config, id: &str) -> Result<()> {
    let id: ResourceId = id.parse()?;
    let cdn = open(config, false)?;
    let Some(resource) = cdn.resources().get(id)? else {
        bail!("resource {id} not found");
    };
    let original = resource.original()?;
    for version in resource.versions(None)? {
        let marker = if version == original { " (original)" } else { "" };
        println!("{}{marker}", version.filename());
    }
    Ok(())
}

fn scale(config: &Config, id: &str, width: Option<u32>, height: Option<u32>) -> Result<()> {
    let id: ResourceId = id.parse()?;
    let cdn = open(config, false)?;
    let Some(resource) = cdn.resources().get(id)? else {
        bail!("resource {id} not found");
    };
    let Version::Image(original) = resource.original()?;
    let scaled = original.scale(width, height)?;
    println!(
        "{}x{} -> {}",
        scaled.width(),
        scaled.height(),
        scaled.file().display()
    );
    Ok(())
}
