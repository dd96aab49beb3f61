use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, info_span};
use tracing_subscriber::EnvFilter;

use tallyman::config::{LoggingConfig, TallymanConfig};
use tallyman::context::{create_pool, RedisRateLimitBackendContextFactory};
use tallyman::RateLimitPolicy;

/// Fixed-window rate limiting against a shared Redis.
#[derive(Debug, Parser)]
#[command(name = "tallyman", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Client name attached to store telemetry
    #[arg(long, global = true, default_value = "ratelimit")]
    name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume from a key's allowance and print the decision
    Consume {
        /// Logical key to charge
        #[arg(short, long)]
        key: String,

        /// Amount to consume
        #[arg(short, long, default_value_t = 1)]
        amount: i64,

        /// Named limit from the configuration file
        #[arg(short, long, conflicts_with_all = ["allowance", "interval"])]
        limit: Option<String>,

        /// Allowance per window
        #[arg(long, requires = "interval")]
        allowance: Option<i64>,

        /// Window length in seconds
        #[arg(long, requires = "allowance")]
        interval: Option<i64>,
    },
    /// Give back quota consumed in the current window
    Refund {
        /// Logical key to credit
        #[arg(short, long)]
        key: String,

        /// Amount to give back
        #[arg(short, long)]
        amount: i64,

        /// Window length in seconds
        #[arg(long)]
        interval: i64,
    },
}

#[derive(Debug, Serialize)]
struct ConsumeOutput<'a> {
    key: &'a str,
    amount: i64,
    allowance: i64,
    interval: i64,
    admitted: bool,
}

#[derive(Debug, Serialize)]
struct RefundOutput<'a> {
    key: &'a str,
    amount: i64,
    remaining: i64,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_policy(
    config: &TallymanConfig,
    limit: Option<&str>,
    allowance: Option<i64>,
    interval: Option<i64>,
) -> anyhow::Result<RateLimitPolicy> {
    match (limit, allowance, interval) {
        (Some(name), _, _) => config
            .limit(name)
            .copied()
            .with_context(|| format!("no limit named {:?} in configuration", name)),
        (None, Some(allowance), Some(interval)) => Ok(RateLimitPolicy::new(allowance, interval)?),
        _ => anyhow::bail!("either --limit or both --allowance and --interval are required"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = TallymanConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        path = ?cli.config,
        store = %config.store.url,
        prefix = %config.rate_limiting.key_prefix,
        "Configuration loaded"
    );

    let pool = create_pool(&config.store)?;
    let factory =
        RedisRateLimitBackendContextFactory::with_prefix(pool, config.rate_limiting.key_prefix.clone());

    let span = info_span!("tallyman.command");
    let limiter = factory.new_backend(&cli.name, &span).await?;

    match cli.command {
        Command::Consume {
            key,
            amount,
            limit,
            allowance,
            interval,
        } => {
            let policy = resolve_policy(&config, limit.as_deref(), allowance, interval)?;
            let admitted = limiter
                .consume(&key, amount, policy.allowance, policy.interval)
                .await?;

            let output = ConsumeOutput {
                key: &key,
                amount,
                allowance: policy.allowance,
                interval: policy.interval,
                admitted,
            };
            println!("{}", serde_json::to_string(&output)?);
        }
        Command::Refund {
            key,
            amount,
            interval,
        } => {
            let remaining = limiter.refund(&key, amount, interval).await?;
            let output = RefundOutput {
                key: &key,
                amount,
                remaining,
            };
            println!("{}", serde_json::to_string(&output)?);
        }
    }

    Ok(())
}
