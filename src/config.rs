use anyhow::{anyhow, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct AppConfig {
    pub(crate) database: DatabaseConfig,
    pub(crate) api: ApiConfig,
    pub(crate) exchange: ExchangeConfig,
    pub(crate) scheduler: SchedulerConfig,
    pub(crate) maintenance: MaintenanceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct DatabaseConfig {
    pub(crate) url: String,
    pub(crate) min_pool_size: u32,
    pub(crate) max_pool_size: u32,
    pub(crate) max_lifetime_seconds: u64,
    pub(crate) acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ApiConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cors_origins: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct ExchangeConfig {
    /// Cut retained from the seller's proceeds on every sale, as a fraction.
    pub(crate) tax_rate: f64,
    /// Refundable listing deposit as a fraction of the asking price. 0 = off.
    pub(crate) deposit_rate: f64,
    /// Fixed floor for the minimum bid increment, in gold.
    pub(crate) bid_increment_floor: i64,
    /// Default percent-of-current-bid increment when a listing omits one.
    pub(crate) default_min_increment_pct: f64,
    pub(crate) min_duration_minutes: i64,
    pub(crate) max_duration_minutes: i64,
    pub(crate) max_quantity: i64,
    pub(crate) max_price: i64,
    pub(crate) max_active_per_seller: usize,
    /// Conditional-write retry budget for bids and buyouts.
    pub(crate) write_retry_budget: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct SchedulerConfig {
    pub(crate) interval_ms: u64,
    pub(crate) lock_ttl_ms: i64,
    pub(crate) lock_name: String,
    /// Max listings resolved per expiration pass before yielding.
    pub(crate) max_per_pass: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub(crate) struct MaintenanceConfig {
    pub(crate) snapshot_interval_ms: u64,
    /// Skip the snapshot when fewer than this many events were journaled.
    pub(crate) snapshot_min_events: i64,
    pub(crate) op_status_ttl_ms: i64,
    pub(crate) read_cache_tick_ms: u64,
    pub(crate) perf_dump_interval_ms: u64,
}

pub(crate) fn load_config() -> Result<AppConfig> {
    let scheduler_interval = env_u64("SETTLE_INTERVAL_MS", 30_000);
    let cfg = AppConfig {
        database: DatabaseConfig {
            url: env_required("DATABASE_URL")?,
            min_pool_size: env_u32("DB_MIN_POOL_SIZE", 10),
            max_pool_size: env_u32("DB_MAX_POOL_SIZE", 80),
            max_lifetime_seconds: env_u64("DB_MAX_LIFETIME_SECONDS", 1800),
            acquire_timeout_seconds: env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30),
        },
        api: ApiConfig {
            host: env_string("API_HOST", "0.0.0.0"),
            port: env_u16("API_PORT", 8100),
            cors_origins: env_list("CORS_ORIGINS", &["*"]),
        },
        exchange: ExchangeConfig {
            tax_rate: env_f64("EXCHANGE_TAX_RATE", 0.05),
            deposit_rate: env_f64("EXCHANGE_DEPOSIT_RATE", 0.0),
            bid_increment_floor: env_i64("BID_INCREMENT_FLOOR", 1),
            default_min_increment_pct: env_f64("DEFAULT_MIN_INCREMENT_PCT", 0.05),
            min_duration_minutes: env_i64("LISTING_MIN_DURATION_MINUTES", 15),
            max_duration_minutes: env_i64("LISTING_MAX_DURATION_MINUTES", 2880),
            max_quantity: env_i64("LISTING_MAX_QUANTITY", 1000),
            max_price: env_i64("LISTING_MAX_PRICE", 1_000_000_000_000),
            max_active_per_seller: env_u32("LISTING_MAX_ACTIVE_PER_SELLER", 50) as usize,
            write_retry_budget: env_u32("WRITE_RETRY_BUDGET", 3),
        },
        scheduler: SchedulerConfig {
            interval_ms: scheduler_interval,
            // A crashed holder's claim lapses before the next scheduled run.
            lock_ttl_ms: env_i64("SETTLE_LOCK_TTL_MS", (scheduler_interval / 2) as i64),
            lock_name: env_string("SETTLE_LOCK_NAME", "exchange.settlement"),
            max_per_pass: env_u32("SETTLE_MAX_PER_PASS", 256) as usize,
        },
        maintenance: MaintenanceConfig {
            snapshot_interval_ms: env_u64("SNAPSHOT_INTERVAL_MS", 60_000),
            snapshot_min_events: env_i64("SNAPSHOT_MIN_EVENTS", 1),
            op_status_ttl_ms: env_i64("OP_STATUS_TTL_MS", 30_000),
            read_cache_tick_ms: env_u64("READ_CACHE_TICK_MS", 1_000),
            perf_dump_interval_ms: env_u64("PERF_DUMP_INTERVAL_MS", 10_000),
        },
    };
    if cfg.exchange.tax_rate < 0.0 || cfg.exchange.tax_rate >= 1.0 {
        return Err(anyhow!("EXCHANGE_TAX_RATE must be in [0, 1)"));
    }
    if cfg.exchange.deposit_rate < 0.0 || cfg.exchange.deposit_rate >= 1.0 {
        return Err(anyhow!("EXCHANGE_DEPOSIT_RATE must be in [0, 1)"));
    }
    if cfg.exchange.min_duration_minutes < 1
        || cfg.exchange.max_duration_minutes < cfg.exchange.min_duration_minutes
    {
        return Err(anyhow!("listing duration bounds are inverted"));
    }
    if cfg.scheduler.lock_ttl_ms <= 0 {
        return Err(anyhow!("SETTLE_LOCK_TTL_MS must be positive"));
    }
    Ok(cfg)
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| anyhow!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(v) => parse_list_value(&v)
            .unwrap_or_else(|| default.iter().map(|s| (*s).to_string()).collect()),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}

fn parse_list_value(raw: &str) -> Option<Vec<String>> {
    if let Ok(v) = serde_json::from_str::<Vec<String>>(raw) {
        return Some(v.into_iter().filter(|s| !s.trim().is_empty()).collect());
    }
    let parts: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts)
    }
}
