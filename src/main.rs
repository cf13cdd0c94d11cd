//! Reverse Copy-Trading Engine
//!
//! Mirrors a leader account onto a follower that takes the opposite side at a
//! fixed size multiplier, streaming leader signals over an in-process bus.

mod api;
mod bot;
mod bus;
mod feed;
mod models;
mod trading;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::api::{Credentials, VenueConfig, DEFAULT_MODEL, DEFAULT_RPC_ENDPOINT};
use crate::bot::{SessionConfig, Session};
use crate::feed::FeedConfig;
use crate::trading::{EngineConfig, ReplicationPolicy};

/// Reverse copy-trading engine CLI.
#[derive(Parser)]
#[command(name = "revcopier")]
#[command(about = "Mirror a leader account with an inverted, scaled follower", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    session: SessionArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SessionArgs {
    /// Signal bus channel
    #[arg(long, default_value = "reverse_copy_bridge")]
    channel: String,

    /// Follower private key (hex)
    #[arg(long, env = "FOLLOWER_PRIVATE_KEY", hide_env_values = true)]
    follower_key: Option<String>,

    /// RPC endpoint used for follower orders
    #[arg(long, env = "ARBITRUM_RPC", default_value = DEFAULT_RPC_ENDPOINT)]
    rpc_endpoint: String,

    /// Leader account to watch
    #[arg(long, env = "LEADER_ADDRESS")]
    leader_address: Option<String>,

    /// Strategy advisory API key
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    advisor_key: Option<String>,

    /// Strategy advisory model
    #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_MODEL)]
    advisor_model: String,

    /// Seconds spent retrying one advisory request
    #[arg(long, default_value = "10")]
    advisory_retry_secs: u64,

    /// Follower size = leader size * multiplier
    #[arg(long, default_value = "5")]
    size_multiplier: Decimal,

    /// Copy the leader's side instead of taking the opposite one
    #[arg(long)]
    no_invert: bool,

    /// Number of follower engines
    #[arg(long, default_value = "1")]
    followers: usize,

    /// Starting BTC price
    #[arg(long, default_value = "64250.50")]
    initial_price: Decimal,

    /// Price tick interval in milliseconds
    #[arg(long, default_value = "1000")]
    tick_ms: u64,

    /// Advisory refresh interval in seconds (0 disables)
    #[arg(long, default_value = "45")]
    advisory_secs: u64,

    /// Simulated venue latency in milliseconds
    #[arg(long, default_value = "800")]
    latency_ms: u64,

    /// Upper bound on a single venue call in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Probability (0.0 to 1.0) of injected venue rejections
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a live session with the operator console
    Run,

    /// Run the scripted reverse round trip and print both sides
    Scenario,

    /// Show the effective configuration
    Config,
}

impl SessionArgs {
    fn to_config(&self) -> Result<SessionConfig> {
        if self.size_multiplier <= Decimal::ZERO {
            bail!(
                "--size-multiplier must be positive, got {}",
                self.size_multiplier
            );
        }

        Ok(SessionConfig {
            channel: self.channel.clone(),
            followers: self.followers.max(1),
            feed: FeedConfig {
                initial_price: self.initial_price,
                tick_interval: Duration::from_millis(self.tick_ms.max(1)),
                ..FeedConfig::default()
            },
            engine: EngineConfig {
                policy: ReplicationPolicy {
                    size_multiplier: self.size_multiplier,
                    inverted: !self.no_invert,
                },
                execution_timeout: Duration::from_secs(self.timeout_secs.max(1)),
                ..EngineConfig::default()
            },
            venue: VenueConfig {
                latency: Duration::from_millis(self.latency_ms),
                failure_rate: self.failure_rate,
            },
            credentials: Credentials::new(
                self.follower_key.clone().unwrap_or_default(),
                self.rpc_endpoint.clone(),
            ),
            leader_address: self.leader_address.clone(),
            advisor_key: self.advisor_key.clone(),
            advisor_model: self.advisor_model.clone(),
            advisory_retry_budget: Duration::from_secs(self.advisory_retry_secs),
            advisory_interval: Duration::from_secs(self.advisory_secs),
            ..SessionConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(cli.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.session.to_config()?;

    match cli.command {
        Commands::Run => {
            info!(
                channel = %config.channel,
                followers = config.followers,
                multiplier = %config.engine.policy.size_multiplier,
                inverted = config.engine.policy.inverted,
                "Starting reverse copy session"
            );

            println!("\n=== Reverse Copy-Trading Engine ===");
            println!("Channel:          {}", config.channel);
            println!("Leader:           {}", config.leader_address.as_deref().unwrap_or("unassigned"));
            println!("Followers:        {}", config.followers);
            println!(
                "Policy:           {}x {}",
                config.engine.policy.size_multiplier.normalize(),
                if config.engine.policy.inverted { "reverse" } else { "copy" }
            );
            println!(
                "Credential:       {}",
                if config.credentials.is_configured() {
                    "configured"
                } else {
                    "MISSING (set FOLLOWER_PRIVATE_KEY or use 'key <secret>')"
                }
            );
            println!("\nPress Ctrl+C or type 'quit' to stop.\n");

            let session = Session::start(config)?;
            let report = bot::run_console(session).await?;
            println!("\n{}", report);
        }

        Commands::Scenario => {
            let mut config = config;
            if !config.credentials.is_configured() {
                // Throwaway key so the simulated venue can sign.
                let key = format!("0x{}", hex::encode(rand::random::<[u8; 32]>()));
                config.credentials = Credentials::new(key, config.credentials.rpc_endpoint.clone());
                info!("No follower key configured, using an ephemeral key");
            }

            println!("\n=== Reverse Replication Scenario ===");
            println!(
                "Leader LONG 0.1 @ ${:.2}, price +50, leader close\n",
                config.feed.initial_price
            );

            let report = bot::run_scenario(config)
                .await
                .context("Scenario failed")?;
            println!("\n{}", report);
        }

        Commands::Config => {
            let policy = &config.engine.policy;

            println!("\n=== Session Configuration ===\n");
            println!("Bus:");
            println!("  Channel:              {}", config.channel);
            println!("  Followers:            {}", config.followers);

            println!("\nReplication Policy:");
            println!("  Size Multiplier:      {}x", policy.size_multiplier.normalize());
            println!("  Inverted:             {}", policy.inverted);
            println!("  Follower Leverage:    {}x", policy.leverage());
            println!("  Execution Timeout:    {}s", config.engine.execution_timeout.as_secs());
            println!("  Log Capacity:         {}", config.engine.log_capacity);

            println!("\nVenue:");
            println!("  Follower Key:         {}", config.credentials.redacted_key());
            println!("  RPC Endpoint:         {}", config.credentials.rpc_endpoint);
            println!("  Latency:              {}ms", config.venue.latency.as_millis());
            println!("  Failure Rate:         {:.0}%", config.venue.failure_rate * 100.0);

            println!("\nLeader:");
            println!(
                "  Watch Address:        {}",
                config.leader_address.as_deref().unwrap_or("unassigned")
            );

            println!("\nMarket:");
            println!("  Initial Price:        ${:.2}", config.feed.initial_price);
            println!("  Tick Interval:        {}ms", config.feed.tick_interval.as_millis());

            println!("\nAdvisory:");
            println!(
                "  API Key:              {}",
                if config.advisor_key.as_deref().is_some_and(|k| !k.trim().is_empty()) {
                    "configured"
                } else {
                    "not set"
                }
            );
            println!("  Model:                {}", config.advisor_model);
            println!("  Interval:             {}s", config.advisory_interval.as_secs());
            println!("  Retry Budget:         {}s", config.advisory_retry_budget.as_secs());
        }
    }

    Ok(())
}
