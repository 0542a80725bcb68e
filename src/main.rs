#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::uninlined_format_args
)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use switchyard::security::parse_path;
use switchyard::{Access, Command, Config, RulesEngine};
use tracing_subscriber::{fmt, EnvFilter};

/// `switchyard` - per-channel queue delivery with access rules.
#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(version)]
#[command(about = "Inspect and validate a switchyard broker configuration.", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.switchyard/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Schema output must stay stdout-only, so it skips config and logging.
    if let Command::Schema = &cli.command {
        let schema = serde_json::to_string_pretty(&Config::json_schema())
            .context("Failed to serialize JSON schema")?;
        println!("{schema}");
        return Ok(());
    }

    let config = Config::load_or_default(cli.config.as_deref()).await?;

    // RUST_LOG wins over the configured level.
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    match cli.command {
        Command::Check => check(&config),
        Command::Access {
            client,
            path,
            write,
        } => access(&config, &client, &path, write),
        Command::Schema => Ok(()),
    }
}

fn check(config: &Config) -> Result<()> {
    let rules = RulesEngine::new(&config.rules)?;
    tracing::debug!(?rules, "Access rules compiled");

    println!("Config:        {}", config.config_path.display());
    println!("Counters:      {}", config.observability.backend);
    println!("Channels:      {}", config.channels.len());
    for channel in &config.channels {
        let ttl = channel
            .queue
            .ttl_secs
            .map_or_else(|| "none".to_string(), |secs| format!("{secs}s"));
        println!(
            "  {:<20} prefetch={} ttl={} max_items_in_queue={} requeue_limit={} requeue_interval={}s fields={}",
            channel.name(),
            channel.queue.prefetch,
            ttl,
            channel.max_items_in_queue,
            channel.requeue_limit,
            channel.requeue_interval_secs,
            channel.queue.map.len(),
        );
    }
    println!("Rules:         {}", config.rules.len());
    for rule in &config.rules {
        println!(
            "  {:<20} read={:?} write={:?}",
            rule.client, rule.read, rule.write
        );
    }
    println!("OK");
    Ok(())
}

fn access(config: &Config, client: &str, raw_path: &str, write: bool) -> Result<()> {
    let rules = RulesEngine::new(&config.rules)?;
    let path = parse_path(raw_path)?;
    let access = Access::from_is_read(!write);
    let [endpoint, version, id] = &path;
    let allowed = rules.is_allowed(client, [endpoint, version, id], access);

    println!(
        "{} {client} {access} {}",
        if allowed { "ALLOW" } else { "DENY" },
        path.join("/")
    );
    Ok(())
}
