//! Command-line and environment configuration for the courier server.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::fanout::{FanoutPolicy, RetryPolicy};

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_RECEIPT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECEIPT_RETRY_MS: u64 = 100;

/// Message delivery and presence backend.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "courier", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// HTTP bind address [env: COURIER_BIND] [default: 127.0.0.1:8080]
    #[arg(long, short = 'b', global = true)]
    pub bind: Option<String>,

    /// SQLite database file [env: COURIER_DB] [default: ~/.courier/courier.db]
    #[arg(long, short = 'd', global = true)]
    pub db: Option<PathBuf>,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long, global = true)]
    pub ephemeral: bool,

    /// Push gateway URL; notifications are only logged when unset [env: COURIER_PUSH_URL]
    #[arg(long, global = true)]
    pub push_url: Option<String>,

    /// Attempts before a receipt gives up on write conflicts [env: COURIER_RECEIPT_MAX_ATTEMPTS] [default: 5]
    #[arg(long, global = true)]
    pub receipt_max_attempts: Option<u32>,

    /// Delay between receipt retries in milliseconds [env: COURIER_RECEIPT_RETRY_MS] [default: 100]
    #[arg(long, global = true)]
    pub receipt_retry_ms: Option<u64>,

    /// Update the sender's summary even when a message reached no device [env: COURIER_SUMMARY_WITHOUT_DELIVERY]
    #[arg(long, global = true)]
    pub summary_without_delivery: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the HTTP/WebSocket server (the default)
    Serve,
    /// Register a verified device and print a session token for it
    Seed {
        user_id: String,
        device_id: String,
        /// Profile name used as the push title for this user's messages
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        phone: Option<String>,
    },
    /// Invalidate a session token issued by `seed`
    Revoke { token: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseLocation {
    File(PathBuf),
    InMemory,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind_addr: String,
    pub database: DatabaseLocation,
    pub push_url: Option<String>,
    pub receipt_max_attempts: u32,
    pub receipt_retry: Duration,
    pub summary_without_delivery: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Config {
    pub fn from_cli_and_env(cli: &Cli) -> Self {
        Self::from_sources(cli, |key| std::env::var(key).ok())
    }

    /// Resolve configuration with an explicit environment lookup.
    pub fn from_sources(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = cli
            .bind
            .clone()
            .or_else(|| env("COURIER_BIND"))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let database = if cli.ephemeral {
            DatabaseLocation::InMemory
        } else {
            let path = cli
                .db
                .clone()
                .or_else(|| env("COURIER_DB").map(PathBuf::from))
                .unwrap_or_else(|| {
                    let home = env("HOME")
                        .map(|h| PathBuf::from(h).join(".courier"))
                        .unwrap_or_else(|| PathBuf::from(".courier"));
                    crate::storage::db_path(&home)
                });
            DatabaseLocation::File(path)
        };

        let push_url = cli
            .push_url
            .clone()
            .or_else(|| env("COURIER_PUSH_URL"))
            .filter(|url| !url.is_empty());

        let receipt_max_attempts = cli
            .receipt_max_attempts
            .or_else(|| env("COURIER_RECEIPT_MAX_ATTEMPTS").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_RECEIPT_MAX_ATTEMPTS)
            .max(1);

        let receipt_retry_ms = cli
            .receipt_retry_ms
            .or_else(|| env("COURIER_RECEIPT_RETRY_MS").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_RECEIPT_RETRY_MS);

        let summary_without_delivery = cli.summary_without_delivery
            || env("COURIER_SUMMARY_WITHOUT_DELIVERY")
                .map(|v| parse_flag(&v))
                .unwrap_or(false);

        Self {
            bind_addr,
            database,
            push_url,
            receipt_max_attempts,
            receipt_retry: Duration::from_millis(receipt_retry_ms),
            summary_without_delivery,
        }
    }

    pub fn fanout_policy(&self) -> FanoutPolicy {
        FanoutPolicy {
            summary_without_delivery: self.summary_without_delivery,
            message_retry: RetryPolicy::surface(),
            receipt_retry: RetryPolicy::bounded(self.receipt_max_attempts, self.receipt_retry),
        }
    }
}
