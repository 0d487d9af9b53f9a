use std::{collections::HashSet, time::Duration};

use clap::Parser;
use tracing_subscriber::{fmt::format, prelude::__tracing_subscriber_field_MakeExt, EnvFilter};

use crate::api::rate_limit::{BucketConfig, RateLimitConfig};

#[derive(Debug, Clone, Parser)]
pub struct Config {
    #[clap(long, required = true, env)]
    pub database_url: String,
    #[clap(long, default_value = "", env)]
    pub env: String,
    #[clap(long, default_value = "nats://localhost:4222", env)]
    pub nats_url: String,
    #[clap(long, default_value = "10", env)]
    pub max_connections: u32,
    /// Upper bound for every storage call, also used as the Postgres lock timeout.
    #[clap(long, default_value = "5000", env)]
    pub storage_timeout_ms: u64,

    // Rate limiting
    #[clap(long, default_value = "20", env)]
    pub bar_bucket_capacity: f64,
    #[clap(long, default_value = "1", env)]
    pub bar_refill_per_sec: f64,
    #[clap(long, default_value = "50", env)]
    pub client_bucket_capacity: f64,
    #[clap(long, default_value = "5", env)]
    pub client_refill_per_sec: f64,
    #[clap(long, default_value = "600", env)]
    pub bucket_idle_secs: u64,
    #[clap(long, default_value = "60", env)]
    pub sweep_interval_secs: u64,
    /// Bars exempt from the per-bar bucket.
    #[clap(long, env, value_delimiter = ',')]
    pub rate_limit_allowlist: Vec<String>,

    #[clap(long, default_value = "1024", env)]
    pub event_buffer: usize,
    /// Apply the bundled schema before serving.
    #[clap(long, env)]
    pub migrate: bool,
}

impl Config {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            bar: BucketConfig {
                capacity: self.bar_bucket_capacity,
                refill_per_sec: self.bar_refill_per_sec,
            },
            client: BucketConfig {
                capacity: self.client_bucket_capacity,
                refill_per_sec: self.client_refill_per_sec,
            },
            allowlist: self
                .rate_limit_allowlist
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<HashSet<_>>(),
            idle: Duration::from_secs(self.bucket_idle_secs),
        }
    }
}

pub fn configure_tracing() {
    let formatter =
        format::debug_fn(|writer, field, value| write!(writer, "{}={:?}", field, value))
            .delimited(" ");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .fmt_fields(formatter)
        .init();
}
