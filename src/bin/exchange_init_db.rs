use std::fs;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;

/// Journal event codes. Must stay in sync with the engine's event enum.
const EVENT_CODES: &[&str] = &[
    "listing_created",
    "bid_placed",
    "reservation_refunded",
    "reservation_consumed",
    "listing_sold",
    "listing_expired",
    "listing_cancelled",
    "tax_rate_changed",
];

fn split_sql_statements(input: &str) -> Vec<String> {
    // Simple splitter suitable for our schema.sql (no functions / dollar-quoting).
    // Skips comments/whitespace-only segments.
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if !in_single && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_single = !in_single;
                    cur.push(ch);
                }
                ';' if !in_single => {
                    let s = cur.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(ch),
            }
        }
        cur.push('\n');
    }
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let max = env_u32("DB_MAX_POOL_SIZE", 5).max(1);
    let acquire = env_u64("DB_ACQUIRE_TIMEOUT_SECONDS", 30).max(5);
    let schema_path = std::env::var("SCHEMA_PATH").unwrap_or_else(|_| "schema.sql".to_string());
    let tax_rate = env_f64("EXCHANGE_TAX_RATE", 0.05);

    let db = PgPoolOptions::new()
        .max_connections(max)
        .acquire_timeout(Duration::from_secs(acquire))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    // Hard reset (clean schema). The compose user is a superuser in dev.
    sqlx::query("DROP SCHEMA IF EXISTS public CASCADE")
        .execute(&db)
        .await
        .context("drop public schema")?;
    sqlx::query("CREATE SCHEMA public")
        .execute(&db)
        .await
        .context("create public schema")?;

    let schema_sql =
        fs::read_to_string(&schema_path).with_context(|| format!("read {schema_path}"))?;
    for stmt in split_sql_statements(&schema_sql) {
        sqlx::query(&stmt).execute(&db).await.with_context(|| {
            format!(
                "exec schema stmt: {}",
                stmt.lines().next().unwrap_or("<empty>")
            )
        })?;
    }

    for code in EVENT_CODES {
        sqlx::query("INSERT INTO event_types (code) VALUES ($1) ON CONFLICT (code) DO NOTHING")
            .bind(code)
            .execute(&db)
            .await?;
    }

    // Pin the starting tax rate in the journal so replay agrees with config.
    let ppm = (tax_rate * 1_000_000.0).round() as i64;
    let tax_type: i16 =
        sqlx::query_scalar("SELECT id FROM event_types WHERE code = 'tax_rate_changed'")
            .fetch_one(&db)
            .await
            .context("fetch event type tax_rate_changed")?;
    sqlx::query(
        "INSERT INTO events (event_type_id, listing_id, payload, created_ms) VALUES ($1, $2, $3, $4)",
    )
    .bind(tax_type)
    .bind(0i64)
    .bind(serde_json::json!({ "kind": "tax_rate_changed", "ppm": ppm }))
    .bind(now_epoch_ms())
    .execute(&db)
    .await
    .context("insert tax_rate_changed event")?;

    println!(
        "initialized: event_types={}, tax_rate_ppm={}",
        EVENT_CODES.len(),
        ppm
    );

    Ok(())
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
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

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
