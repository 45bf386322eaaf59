use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::{Pool, Postgres};
use tokio::sync::{mpsc, RwLock};

use crate::config::AppConfig;
use crate::engine::{now_epoch_ms, ExchangeState, ItemId, ListingId, PlayerId};
use crate::history::PriceSuggestion;
use crate::lock::SchedulerLock;
use crate::services::{CurrencyService, InventoryService, NotificationService};

pub(crate) const LATENCY_BUCKET_BOUNDS_MS: [u64; 12] =
    [0, 1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];
pub(crate) const BATCH_BUCKET_BOUNDS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

fn hist_bucket_idx(v: u64, bounds: &[u64]) -> usize {
    for (i, b) in bounds.iter().enumerate() {
        if v <= *b {
            return i;
        }
    }
    bounds.len()
}

/// Work item for the async submit lane. Bids and buyouts can be accepted
/// over HTTP before the engine write happens; the job carries everything
/// the worker needs to run the flow and record the outcome under `op_token`.
#[derive(Debug, Clone)]
pub(crate) struct ExchangeJob {
    pub(crate) op_token: uuid::Uuid,
    pub(crate) received_ms: i64,
    pub(crate) op: ExchangeOp,
}

#[derive(Debug, Clone)]
pub(crate) enum ExchangeOp {
    Bid {
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
    },
    Buyout {
        listing_id: ListingId,
        buyer_id: PlayerId,
    },
}

impl ExchangeOp {
    pub(crate) fn listing_id(&self) -> ListingId {
        match self {
            ExchangeOp::Bid { listing_id, .. } => *listing_id,
            ExchangeOp::Buyout { listing_id, .. } => *listing_id,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum OpStatus {
    Received {
        listing_id: ListingId,
        created_at_ms: i64,
    },
    Confirmed {
        listing_id: ListingId,
        outcome: serde_json::Value,
        created_at_ms: i64,
    },
    Failed {
        listing_id: ListingId,
        error: String,
        created_at_ms: i64,
    },
}

impl OpStatus {
    pub(crate) fn created_at_ms(&self) -> i64 {
        match self {
            OpStatus::Received { created_at_ms, .. }
            | OpStatus::Confirmed { created_at_ms, .. }
            | OpStatus::Failed { created_at_ms, .. } => *created_at_ms,
        }
    }
}

pub(crate) struct PerfCounters {
    pub(crate) bid_received: AtomicU64,
    pub(crate) bid_accepted: AtomicU64,
    pub(crate) bid_rejected: AtomicU64,
    pub(crate) buyout_received: AtomicU64,
    pub(crate) buyout_confirmed: AtomicU64,
    pub(crate) buyout_rejected: AtomicU64,
    pub(crate) listings_created: AtomicU64,
    pub(crate) listings_cancelled: AtomicU64,
    pub(crate) contention_retries: AtomicU64,
    pub(crate) contention_failures: AtomicU64,
    pub(crate) submit_rejected_queue_full: AtomicU64,
    pub(crate) submit_failed_db: AtomicU64,
    pub(crate) job_queue_len: AtomicI64,
    pub(crate) settle_passes: AtomicU64,
    pub(crate) settle_lock_busy: AtomicU64,
    pub(crate) settle_sold: AtomicU64,
    pub(crate) settle_expired: AtomicU64,
    pub(crate) settle_refunds: AtomicU64,
    pub(crate) settle_inconsistencies: AtomicU64,
    pub(crate) settle_errors: AtomicU64,
    pub(crate) snapshot_saves: AtomicU64,
    pub(crate) bid_apply_lock_wait_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    pub(crate) settle_lock_wait_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    pub(crate) settle_batch_hist: [AtomicU64; BATCH_BUCKET_BOUNDS.len() + 1],
    pub(crate) read_cache_build_hist: [AtomicU64; LATENCY_BUCKET_BOUNDS_MS.len() + 1],
    pub(crate) read_cache_ticks: AtomicU64,
    pub(crate) read_cache_updates: AtomicU64,
    pub(crate) read_cache_engine_busy: AtomicU64,
    pub(crate) read_cache_tick_ms: AtomicU64,
}

impl PerfCounters {
    pub(crate) fn new() -> Self {
        Self {
            bid_received: AtomicU64::new(0),
            bid_accepted: AtomicU64::new(0),
            bid_rejected: AtomicU64::new(0),
            buyout_received: AtomicU64::new(0),
            buyout_confirmed: AtomicU64::new(0),
            buyout_rejected: AtomicU64::new(0),
            listings_created: AtomicU64::new(0),
            listings_cancelled: AtomicU64::new(0),
            contention_retries: AtomicU64::new(0),
            contention_failures: AtomicU64::new(0),
            submit_rejected_queue_full: AtomicU64::new(0),
            submit_failed_db: AtomicU64::new(0),
            job_queue_len: AtomicI64::new(0),
            settle_passes: AtomicU64::new(0),
            settle_lock_busy: AtomicU64::new(0),
            settle_sold: AtomicU64::new(0),
            settle_expired: AtomicU64::new(0),
            settle_refunds: AtomicU64::new(0),
            settle_inconsistencies: AtomicU64::new(0),
            settle_errors: AtomicU64::new(0),
            snapshot_saves: AtomicU64::new(0),
            bid_apply_lock_wait_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            settle_lock_wait_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            settle_batch_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            read_cache_build_hist: std::array::from_fn(|_| AtomicU64::new(0)),
            read_cache_ticks: AtomicU64::new(0),
            read_cache_updates: AtomicU64::new(0),
            read_cache_engine_busy: AtomicU64::new(0),
            read_cache_tick_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn observe_bid_apply_lock_wait_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.bid_apply_lock_wait_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_settle_lock_wait_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.settle_lock_wait_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_settle_batch_size(&self, n: usize) {
        let idx = hist_bucket_idx(n as u64, &BATCH_BUCKET_BOUNDS);
        self.settle_batch_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_read_cache_build_ms(&self, ms: u64) {
        let idx = hist_bucket_idx(ms, &LATENCY_BUCKET_BOUNDS_MS);
        self.read_cache_build_hist[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot_json(&self) -> serde_json::Value {
        serde_json::json!({
            "bids": {
                "received": self.bid_received.load(Ordering::Relaxed),
                "accepted": self.bid_accepted.load(Ordering::Relaxed),
                "rejected": self.bid_rejected.load(Ordering::Relaxed),
                "contention_retries": self.contention_retries.load(Ordering::Relaxed),
                "contention_failures": self.contention_failures.load(Ordering::Relaxed),
            },
            "buyouts": {
                "received": self.buyout_received.load(Ordering::Relaxed),
                "confirmed": self.buyout_confirmed.load(Ordering::Relaxed),
                "rejected": self.buyout_rejected.load(Ordering::Relaxed),
            },
            "listings": {
                "created": self.listings_created.load(Ordering::Relaxed),
                "cancelled": self.listings_cancelled.load(Ordering::Relaxed),
            },
            "submit": {
                "rejected_queue_full": self.submit_rejected_queue_full.load(Ordering::Relaxed),
                "failed_db": self.submit_failed_db.load(Ordering::Relaxed),
                "job_queue_len": self.job_queue_len.load(Ordering::Relaxed),
            },
            "settlement": {
                "passes": self.settle_passes.load(Ordering::Relaxed),
                "lock_busy": self.settle_lock_busy.load(Ordering::Relaxed),
                "sold": self.settle_sold.load(Ordering::Relaxed),
                "expired": self.settle_expired.load(Ordering::Relaxed),
                "refunds": self.settle_refunds.load(Ordering::Relaxed),
                "inconsistencies": self.settle_inconsistencies.load(Ordering::Relaxed),
                "errors": self.settle_errors.load(Ordering::Relaxed),
            },
            "snapshots": {
                "saves": self.snapshot_saves.load(Ordering::Relaxed),
            },
            "read_cache": {
                "tick_ms": self.read_cache_tick_ms.load(Ordering::Relaxed),
                "ticks": self.read_cache_ticks.load(Ordering::Relaxed),
                "updates": self.read_cache_updates.load(Ordering::Relaxed),
                "engine_busy": self.read_cache_engine_busy.load(Ordering::Relaxed),
            }
        })
    }
}

/// One browse row. Built from engine state on the read-cache tick so that
/// GET /listings never waits behind the engine write path.
#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct BoardRow {
    pub(crate) listing_id: ListingId,
    pub(crate) seller_id: PlayerId,
    pub(crate) quantity: i64,
    pub(crate) listing_type: &'static str,
    pub(crate) buyout_price: Option<i64>,
    pub(crate) current_bid: Option<i64>,
    pub(crate) min_next_bid: Option<i64>,
    pub(crate) bid_count: usize,
    pub(crate) expires_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct ItemBoard {
    pub(crate) item_id: ItemId,
    pub(crate) active: usize,
    /// Lowest per-unit buyout among active rows, when any row has one.
    pub(crate) buyout_floor_unit: Option<i64>,
    pub(crate) rows: Vec<BoardRow>,
    pub(crate) updated_at_ms: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct ExchangeSummary {
    pub(crate) active_listings: usize,
    pub(crate) auction_listings: usize,
    pub(crate) buyout_listings: usize,
    pub(crate) tracked_items: usize,
    pub(crate) tax_collected_total: i64,
    pub(crate) updated_at_ms: i64,
}

impl ExchangeSummary {
    pub(crate) fn empty() -> Self {
        Self {
            active_listings: 0,
            auction_listings: 0,
            buyout_listings: 0,
            tracked_items: 0,
            tax_collected_total: 0,
            updated_at_ms: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct CachedSuggestion {
    pub(crate) suggestion: PriceSuggestion,
    pub(crate) cached_at_ms: i64,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cfg: Arc<AppConfig>,
    pub(crate) db: Pool<Postgres>,
    pub(crate) engine: Arc<RwLock<ExchangeState>>,
    pub(crate) event_type_ids: Arc<RwLock<HashMap<String, i16>>>,
    pub(crate) currency: Arc<dyn CurrencyService>,
    pub(crate) inventory: Arc<dyn InventoryService>,
    pub(crate) notifier: Arc<dyn NotificationService>,
    pub(crate) sched_lock: Arc<dyn SchedulerLock>,
    pub(crate) lock_owner: String,
    pub(crate) job_tx: mpsc::Sender<ExchangeJob>,
    pub(crate) op_status: Arc<DashMap<uuid::Uuid, OpStatus>>,
    pub(crate) suggestion_cache: Arc<DashMap<ItemId, CachedSuggestion>>,
    pub(crate) item_board_cache: Arc<DashMap<ItemId, ItemBoard>>,
    pub(crate) summary_cache: Arc<RwLock<ExchangeSummary>>,
    pub(crate) perf: Arc<PerfCounters>,
    pub(crate) engine_ready: Arc<AtomicBool>,
}

const LOCK_PROFILE_WARN_MS: u128 = 500;
const LOCK_PROFILE_COOLDOWN_MS: i64 = 1000;
static LOCK_LOG_LAST_MS: Lazy<DashMap<&'static str, i64>> = Lazy::new(DashMap::new);

fn should_emit_lock_log(label: &'static str) -> bool {
    let now = now_epoch_ms();
    if let Some(mut last) = LOCK_LOG_LAST_MS.get_mut(label) {
        if now - *last < LOCK_PROFILE_COOLDOWN_MS {
            return false;
        }
        *last = now;
        true
    } else {
        LOCK_LOG_LAST_MS.insert(label, now);
        true
    }
}

pub(crate) struct ProfiledReadGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockReadGuard<'a, T>,
}

impl<'a, T> Deref for ProfiledReadGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> Drop for ProfiledReadGuard<'a, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=read label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) struct ProfiledWriteGuard<'a, T> {
    label: &'static str,
    wait_ms: u128,
    acquired_at: Instant,
    guard: tokio::sync::RwLockWriteGuard<'a, T>,
}

impl<'a, T> ProfiledWriteGuard<'a, T> {
    pub(crate) fn wait_ms(&self) -> u128 {
        self.wait_ms
    }
}

impl<'a, T> Deref for ProfiledWriteGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl<'a, T> DerefMut for ProfiledWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl<'a, T> Drop for ProfiledWriteGuard<'a, T> {
    fn drop(&mut self) {
        let hold_ms = self.acquired_at.elapsed().as_millis();
        if (self.wait_ms >= LOCK_PROFILE_WARN_MS || hold_ms >= LOCK_PROFILE_WARN_MS)
            && should_emit_lock_log(self.label)
        {
            eprintln!(
                "[lock] kind=write label={} wait_ms={} hold_ms={}",
                self.label, self.wait_ms, hold_ms
            );
        }
    }
}

pub(crate) async fn lock_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledReadGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.read().await;
    ProfiledReadGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}

pub(crate) async fn lock_write<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> ProfiledWriteGuard<'a, T> {
    let wait_started = Instant::now();
    let guard = lock.write().await;
    ProfiledWriteGuard {
        label,
        wait_ms: wait_started.elapsed().as_millis(),
        acquired_at: Instant::now(),
        guard,
    }
}

pub(crate) fn try_lock_read<'a, T>(
    lock: &'a RwLock<T>,
    label: &'static str,
) -> Option<ProfiledReadGuard<'a, T>> {
    let guard = lock.try_read().ok()?;
    Some(ProfiledReadGuard {
        label,
        wait_ms: 0,
        acquired_at: Instant::now(),
        guard,
    })
}

impl AppState {
    pub(crate) fn op_received(&self, token: uuid::Uuid, listing_id: ListingId) {
        self.op_status.insert(
            token,
            OpStatus::Received {
                listing_id,
                created_at_ms: now_epoch_ms(),
            },
        );
    }

    pub(crate) fn op_confirmed(
        &self,
        token: uuid::Uuid,
        listing_id: ListingId,
        outcome: serde_json::Value,
    ) {
        self.op_status.insert(
            token,
            OpStatus::Confirmed {
                listing_id,
                outcome,
                created_at_ms: now_epoch_ms(),
            },
        );
    }

    pub(crate) fn op_failed(&self, token: uuid::Uuid, listing_id: ListingId, error: String) {
        self.op_status.insert(
            token,
            OpStatus::Failed {
                listing_id,
                error,
                created_at_ms: now_epoch_ms(),
            },
        );
    }

    /// Drops finished op records older than the TTL. Received entries are
    /// kept regardless of age; the worker still owes them an outcome.
    pub(crate) fn prune_op_status(&self, ttl_ms: i64) -> usize {
        let cutoff = now_epoch_ms().saturating_sub(ttl_ms);
        let before = self.op_status.len();
        self.op_status.retain(|_, st| match st {
            OpStatus::Received { .. } => true,
            _ => st.created_at_ms() >= cutoff,
        });
        before.saturating_sub(self.op_status.len())
    }

    pub(crate) fn invalidate_item_caches(&self, item_id: ItemId) {
        self.item_board_cache.remove(&item_id);
        self.suggestion_cache.remove(&item_id);
    }
}
