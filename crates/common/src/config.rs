use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the admin API binds to (default: 3000)
    pub api_port: u16,

    /// Telegram bot token used by the message gateway
    pub telegram_bot_token: Option<String>,

    /// Telegram Bot API base URL (overridable for tests and proxies)
    pub telegram_api_base: String,

    /// Per-request timeout for gateway calls in seconds (default: 15)
    pub telegram_timeout_secs: u64,

    /// Broadcast engine tuning
    pub broadcast: BroadcastSettings,
}

/// Tuning knobs for the broadcast delivery engine.
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastSettings {
    /// Interval between "process queue" ticks in seconds (default: 20)
    pub tick_interval_secs: u64,
    /// Deliveries claimed per batch (default: 25)
    pub batch_size: usize,
    /// Concurrent gateway sends within one batch (default: 4)
    pub concurrency: usize,
    /// Upper bound on batches processed in one tick (default: 10)
    pub max_batches_per_tick: usize,
    /// Attempts before a retryable failure becomes permanent (default: 5)
    pub max_attempts: i32,
    /// Run lease duration in seconds (default: 120)
    pub run_lease_secs: u64,
    /// Delivery lease duration in seconds (default: 60)
    pub delivery_lease_secs: u64,
    /// Grace period past lease expiry before an in-flight delivery is
    /// declared UNKNOWN (default: 300)
    pub stale_grace_secs: u64,
    /// Terminal runs older than this are purged (default: 30)
    pub retention_days: u64,
    /// Completed orders required to count as VIP (default: 3)
    pub vip_min_orders: i64,
    /// Rows per bulk INSERT statement at enqueue time (default: 500)
    pub insert_chunk_size: usize,
    /// Maximum message length in characters
    pub max_message_chars: usize,
    /// Maximum number of distinct user ids for a USERS target
    pub max_target_users: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 20,
            batch_size: 25,
            concurrency: 4,
            max_batches_per_tick: 10,
            max_attempts: 5,
            run_lease_secs: 120,
            delivery_lease_secs: 60,
            stale_grace_secs: 300,
            retention_days: 30,
            vip_min_orders: 3,
            insert_chunk_size: 500,
            max_message_chars: 4000,
            max_target_users: 5000,
        }
    }
}

impl BroadcastSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    pub fn run_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.run_lease_secs as i64)
    }

    pub fn delivery_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.delivery_lease_secs as i64)
    }

    pub fn stale_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_grace_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days as i64)
    }

    fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            tick_interval_secs: env_or("BROADCAST_TICK_INTERVAL_SECS", defaults.tick_interval_secs)?,
            batch_size: env_or("BROADCAST_BATCH_SIZE", defaults.batch_size)?,
            concurrency: env_or("BROADCAST_CONCURRENCY", defaults.concurrency)?,
            max_batches_per_tick: env_or(
                "BROADCAST_MAX_BATCHES_PER_TICK",
                defaults.max_batches_per_tick,
            )?,
            max_attempts: env_or("BROADCAST_MAX_ATTEMPTS", defaults.max_attempts)?,
            run_lease_secs: env_or("BROADCAST_RUN_LEASE_SECS", defaults.run_lease_secs)?,
            delivery_lease_secs: env_or(
                "BROADCAST_DELIVERY_LEASE_SECS",
                defaults.delivery_lease_secs,
            )?,
            stale_grace_secs: env_or("BROADCAST_STALE_GRACE_SECS", defaults.stale_grace_secs)?,
            retention_days: env_or("BROADCAST_RETENTION_DAYS", defaults.retention_days)?,
            vip_min_orders: env_or("BROADCAST_VIP_MIN_ORDERS", defaults.vip_min_orders)?,
            insert_chunk_size: env_or("BROADCAST_INSERT_CHUNK_SIZE", defaults.insert_chunk_size)?,
            ..defaults
        })
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20)?,
            api_port: env_or("API_PORT", 3000)?,
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
            telegram_api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| DEFAULT_TELEGRAM_API_BASE.to_string()),
            telegram_timeout_secs: env_or("TELEGRAM_TIMEOUT_SECS", 15)?,
            broadcast: BroadcastSettings::from_env()?,
        })
    }
}

/// Read `key` from the environment, falling back to `default` when unset.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
