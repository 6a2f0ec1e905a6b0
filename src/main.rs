//! dnsfs - DNS filtering sinkhole.
//!
//! `dnsfs serve` runs the resolver; the other subcommands inspect and
//! maintain the rule directory.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use dnsfs::config::{Config, DEFAULT_CONFIG_PATH, LogSettings};
use dnsfs::dns::normalize_name;
use dnsfs::rules::convert::{self, ListFormat};
use dnsfs::rules::remote::RuleDownloader;
use dnsfs::rules::{RuleSet, loader};
use dnsfs::server::Server;

#[derive(Debug, Parser)]
#[command(name = "dnsfs", version, about = "Local DNS filtering sinkhole")]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "DNSFS_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the resolver until interrupted (default).
    Serve,
    /// List the loaded rules per file.
    Rules,
    /// Show whether a domain would be sunk or forwarded.
    Dig { domain: String },
    /// Fetch a rule file into the rule directory.
    Download { url: String, file_name: String },
    /// Convert a third-party list read from stdin into rule lines.
    Convert {
        #[arg(value_enum)]
        format: ListFormat,
    },
}

/// Read the configuration, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!(path = ?path, "configuration file not found, using defaults");
        return Ok(Config::default());
    }
    Config::load(path).with_context(|| format!("failed to load configuration from {path:?}"))
}

/// Log to stdout and append to the configured log file.
///
/// A log file that cannot be opened leaves stdout as the only output.
fn init_server_logging(settings: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, file_error) = match open_log_file(&settings.path) {
        Ok(file) => (
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    if let Some(err) = file_error {
        warn!(path = ?settings.path, error = %err, "cannot open log file, logging to stdout only");
    }
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
}

/// Utilities keep stdout for their output and log warnings to stderr.
fn init_cli_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config: Config) -> Result<()> {
    dnsfs::metrics::init(&config.metrics).context("failed to initialize metrics")?;
    if config.metrics.enabled {
        info!(listen = %config.metrics.listen, "metrics enabled");
    }

    info!(
        forwards = ?config.dns.forwards,
        cache_ttl_seconds = config.cache.ttl_seconds,
        "starting dnsfs"
    );

    let (server, mut errors) = Server::start(&config)
        .await
        .context("failed to start server")?;

    let consumer = tokio::spawn(async move {
        while let Some(err) = errors.recv().await {
            error!(error = %err, "query failed");
        }
    });

    wait_for_signal().await;
    info!("shutting down");

    server.shutdown().await;
    if let Err(err) = consumer.await {
        warn!(error = %err, "error consumer ended abnormally");
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => warn!(error = %err, "cannot listen for SIGTERM"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for Ctrl-C");
    }
}

async fn list_rules(config: &Config) -> Result<()> {
    let files = loader::load_directory(&config.rules.directory)
        .await
        .context("failed to load rules")?;

    let mut out = BufWriter::new(std::io::stdout().lock());
    let mut total = 0;
    for file in &files {
        writeln!(out, "{} ({} rules)", file.path.display(), file.rules.len())?;
        for rule in &file.rules {
            writeln!(out, "  {rule}")?;
        }
        total += file.rules.len();
    }

    let unique = RuleSet::from_files(&files).len();
    writeln!(
        out,
        "{total} rules ({unique} unique) in {} files",
        files.len()
    )?;
    out.flush()?;
    Ok(())
}

async fn dig(config: &Config, domain: &str) -> Result<()> {
    let files = loader::load_directory(&config.rules.directory)
        .await
        .context("failed to load rules")?;
    let rules = RuleSet::from_files(&files);

    let name = normalize_name(domain);
    let started = Instant::now();
    let sink = rules.test(&name);
    let elapsed = started.elapsed();

    let verdict = if sink { "SINK" } else { "FORWARD" };
    println!("{name}: {verdict} (evaluated {} rules in {elapsed:?})", rules.len());
    Ok(())
}

async fn download(config: &Config, url: &str, file_name: &str) -> Result<()> {
    let downloader = RuleDownloader::new(config.rules.directory.clone())?;
    let file = downloader
        .download(url, file_name)
        .await
        .with_context(|| format!("failed to download {url}"))?;

    println!(
        "saved {} rules to {}",
        file.rules.len(),
        file.path.display()
    );
    Ok(())
}

fn convert_list(format: ListFormat) -> Result<()> {
    let rules = convert::convert(format, &mut std::io::stdin().lock())
        .with_context(|| format!("failed to convert {format} list"))?;

    let mut out = BufWriter::new(std::io::stdout().lock());
    writeln!(out, "# Converted from a {format} list by dnsfs")?;
    for rule in &rules {
        writeln!(out, "{rule}")?;
    }
    out.flush()?;
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            // The log destination comes from the configuration, so nothing
            // can be logged before it is read.
            let missing = !cli.config.exists();
            let config = if missing {
                Config::default()
            } else {
                Config::load(&cli.config).with_context(|| {
                    format!("failed to load configuration from {:?}", cli.config)
                })?
            };

            init_server_logging(&config.log);
            if missing {
                warn!(path = ?cli.config, "configuration file not found, using defaults");
            }
            serve(config).await
        }
        Command::Rules => {
            init_cli_logging();
            list_rules(&load_config(&cli.config)?).await
        }
        Command::Dig { domain } => {
            init_cli_logging();
            dig(&load_config(&cli.config)?, &domain).await
        }
        Command::Download { url, file_name } => {
            init_cli_logging();
            download(&load_config(&cli.config)?, &url, &file_name).await
        }
        Command::Convert { format } => {
            init_cli_logging();
            convert_list(format)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
