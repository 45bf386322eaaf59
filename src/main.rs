use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Request, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

mod config;
mod engine;
mod error;
mod history;
mod lock;
mod services;
mod state;
mod store;
mod tasks;

use crate::config::load_config;
use crate::engine::{
    now_epoch_ms, rate_to_ppm, ExchangeEvent, ExchangeState, ItemId, Listing, ListingId,
    ListingStatus, PlayerId, SettlementRecord,
};
use crate::error::ApiError;
use crate::history::{PriceSuggestion, MS_PER_DAY};
use crate::lock::{lock_owner_id, PgSchedulerLock, SchedulerLock};
use crate::services::{LogNotifier, VaultCurrency, VaultInventory};
use crate::state::{
    lock_read, lock_write, try_lock_read, AppState, ExchangeJob, ExchangeOp, ExchangeSummary,
    ItemBoard, PerfCounters,
};
use crate::store::{
    build_item_board, buy_now_flow, cancel_listing_flow, create_listing_flow, journal_events,
    load_event_type_ids, place_bid_flow, price_suggestion, replay_from_db, settle_once,
    BidOutcome, BuyoutOutcome, CreateListingRequest, SettleStats,
};
use crate::tasks::start_background_tasks;

// Async submit (202) queue.
const JOB_QUEUE_CAP: usize = 50_000;
const MAX_PLAYER_ROWS: usize = 200;

#[derive(Debug, Deserialize)]
struct BidBody {
    bidder_id: PlayerId,
    amount: i64,
}

#[derive(Debug, Deserialize)]
struct BuyoutBody {
    buyer_id: PlayerId,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    seller_id: PlayerId,
}

#[derive(Debug, Deserialize)]
struct TaxRateBody {
    tax_rate: f64,
}

fn listing_json(l: &Listing, increment_floor: i64, now_ms: i64, with_history: bool) -> serde_json::Value {
    let min_next_bid = if l.status == ListingStatus::Active && l.listing_type.supports_bids() {
        Some(l.min_accepted_bid(increment_floor))
    } else {
        None
    };
    let mut v = serde_json::json!({
        "id": l.id,
        "seller_id": l.seller_id,
        "item_id": l.item_id,
        "quantity": l.quantity,
        "listing_type": l.listing_type.as_str(),
        "buyout_price": l.buyout_price,
        "starting_bid": l.starting_bid,
        "current_bid": l.current_bid,
        "current_bidder_id": l.current_bidder_id,
        "min_increment_ppm": l.min_increment_ppm,
        "min_next_bid": min_next_bid,
        "status": l.status.as_str(),
        "created_ms": l.created_ms,
        "expires_ms": l.expires_ms,
        "time_left_ms": (l.expires_ms - now_ms).max(0),
        "bid_count": l.bid_history.len(),
        "version": l.version,
    });
    if with_history {
        v["bid_history"] = serde_json::json!(l.bid_history);
    }
    v
}

// ===== HTTP handlers =====

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|e| ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("db error: {e}")))?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "database": "connected",
        "engine_ready": state.engine_ready.load(Ordering::Acquire)
    })))
}

async fn require_engine_ready(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !state.engine_ready.load(Ordering::Acquire) {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "engine warming up",
        ));
    }
    Ok(next.run(req).await)
}

async fn get_exchange_summary(
    State(state): State<AppState>,
) -> Result<Json<ExchangeSummary>, ApiError> {
    let summary = lock_read(&state.summary_cache, "main.get_exchange_summary.summary_read")
        .await
        .clone();
    Ok(Json(summary))
}

async fn create_listing(
    State(state): State<AppState>,
    Json(req): Json<CreateListingRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (listing, events) = create_listing_flow(&state, &req).await?;
    journal_events(&state, &events).await;
    let body = listing_json(
        &listing,
        state.cfg.exchange.bid_increment_floor,
        now_epoch_ms(),
        false,
    );
    Ok((StatusCode::CREATED, Json(body)))
}

async fn get_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let eng = lock_read(&state.engine, "main.get_listing.engine_read").await;
    let l = eng
        .listings
        .get(&listing_id)
        .ok_or_else(|| ApiError::not_found("listing_not_found"))?;
    Ok(Json(listing_json(
        l,
        state.cfg.exchange.bid_increment_floor,
        now_epoch_ms(),
        true,
    )))
}

async fn place_bid(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<BidBody>,
) -> Result<Json<BidOutcome>, ApiError> {
    let (outcome, events) = place_bid_flow(&state, listing_id, req.bidder_id, req.amount).await?;
    journal_events(&state, &events).await;
    Ok(Json(outcome))
}

async fn place_bid_async(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<BidBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.bidder_id <= 0 {
        return Err(ApiError::validation("player_id_invalid"));
    }
    if req.amount <= 0 {
        return Err(ApiError::validation("bid_amount_invalid"));
    }
    let op = ExchangeOp::Bid {
        listing_id,
        bidder_id: req.bidder_id,
        amount: req.amount,
    };
    enqueue_op(&state, op).await
}

async fn buy_now(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<BuyoutBody>,
) -> Result<Json<BuyoutOutcome>, ApiError> {
    let (outcome, events) = buy_now_flow(&state, listing_id, req.buyer_id).await?;
    journal_events(&state, &events).await;
    Ok(Json(outcome))
}

async fn buy_now_async(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<BuyoutBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    if req.buyer_id <= 0 {
        return Err(ApiError::validation("player_id_invalid"));
    }
    let op = ExchangeOp::Buyout {
        listing_id,
        buyer_id: req.buyer_id,
    };
    enqueue_op(&state, op).await
}

/// Shared 202 path: register the token, queue the job, reject loudly when
/// the queue is full so the client retries instead of waiting forever.
async fn enqueue_op(
    state: &AppState,
    op: ExchangeOp,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let listing_id = op.listing_id();
    let op_token = Uuid::new_v4();
    state.op_received(op_token, listing_id);
    let job = ExchangeJob {
        op_token,
        received_ms: now_epoch_ms(),
        op,
    };
    state.perf.job_queue_len.fetch_add(1, Ordering::Relaxed);
    if state.job_tx.try_send(job).is_err() {
        state.perf.job_queue_len.fetch_sub(1, Ordering::Relaxed);
        state
            .perf
            .submit_rejected_queue_full
            .fetch_add(1, Ordering::Relaxed);
        state.op_failed(op_token, listing_id, "submit queue full".to_string());
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "submit unavailable, please retry",
        ));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "op_token": op_token,
            "listing_id": listing_id,
            "status": "RECEIVED"
        })),
    ))
}

async fn get_op_status(
    State(state): State<AppState>,
    Path(op_token): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Some(status) = state.op_status.get(&op_token) else {
        return Err(ApiError::not_found("op_not_found"));
    };
    Ok(Json(serde_json::json!({
        "op_token": op_token,
        "status": status.value()
    })))
}

async fn cancel_listing(
    State(state): State<AppState>,
    Path(listing_id): Path<ListingId>,
    Json(req): Json<CancelBody>,
) -> Result<Json<SettlementRecord>, ApiError> {
    let (record, events) = cancel_listing_flow(&state, listing_id, req.seller_id).await?;
    journal_events(&state, &events).await;
    Ok(Json(record))
}

async fn get_item_board(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> Result<Json<ItemBoard>, ApiError> {
    if let Some(board) = state.item_board_cache.get(&item_id) {
        return Ok(Json(board.value().clone()));
    }
    // Cache miss; build inline but never queue behind the write path.
    let Some(eng) = try_lock_read(&state.engine, "main.get_item_board.engine_try_read") else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "exchange busy, please retry",
        ));
    };
    let board = build_item_board(
        &eng,
        item_id,
        state.cfg.exchange.bid_increment_floor,
        now_epoch_ms(),
    );
    drop(eng);
    state.item_board_cache.insert(item_id, board.clone());
    Ok(Json(board))
}

async fn get_price(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> Result<Json<PriceSuggestion>, ApiError> {
    match price_suggestion(&state, item_id, now_epoch_ms()).await {
        Some(s) => Ok(Json(s)),
        None => Err(ApiError::not_found("no_sales_recorded")),
    }
}

async fn get_price_history(
    State(state): State<AppState>,
    Path(item_id): Path<ItemId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let eng = lock_read(&state.engine, "main.get_price_history.engine_read").await;
    let days: Vec<serde_json::Value> = eng
        .history
        .day_buckets(item_id)
        .iter()
        .map(|b| {
            let date = DateTime::<Utc>::from_timestamp_millis(b.day * MS_PER_DAY)
                .map(|d| d.date_naive().to_string())
                .unwrap_or_default();
            serde_json::json!({
                "date": date,
                "sales_count": b.sales_count,
                "quantity": b.quantity,
                "total_value": b.total_value,
                "min_unit": b.min_unit,
                "max_unit": b.max_unit,
                "avg_unit": if b.quantity > 0 { b.total_value / b.quantity } else { 0 },
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "item_id": item_id, "days": days })))
}

async fn get_player_listings(
    State(state): State<AppState>,
    Path(player_id): Path<PlayerId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let floor = state.cfg.exchange.bid_increment_floor;
    let now_ms = now_epoch_ms();
    let eng = lock_read(&state.engine, "main.get_player_listings.engine_read").await;
    let ids = eng.seller_index.get(&player_id).cloned().unwrap_or_default();
    let rows: Vec<serde_json::Value> = ids
        .iter()
        .rev()
        .take(MAX_PLAYER_ROWS)
        .filter_map(|id| eng.listings.get(id))
        .map(|l| listing_json(l, floor, now_ms, false))
        .collect();
    Ok(Json(serde_json::json!({
        "player_id": player_id,
        "listings": rows
    })))
}

async fn get_player_bids(
    State(state): State<AppState>,
    Path(player_id): Path<PlayerId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let floor = state.cfg.exchange.bid_increment_floor;
    let now_ms = now_epoch_ms();
    let eng = lock_read(&state.engine, "main.get_player_bids.engine_read").await;
    let ids = eng.bidder_index.get(&player_id).cloned().unwrap_or_default();
    let rows: Vec<serde_json::Value> = ids
        .iter()
        .rev()
        .take(MAX_PLAYER_ROWS)
        .filter_map(|id| eng.listings.get(id))
        .map(|l| {
            let hold = eng.ledger.get(&(l.id, player_id)).map(|e| {
                serde_json::json!({ "amount_held": e.amount_held, "state": e.state })
            });
            serde_json::json!({
                "listing": listing_json(l, floor, now_ms, false),
                "leading": l.current_bidder_id == Some(player_id),
                "hold": hold,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({
        "player_id": player_id,
        "bids": rows
    })))
}

async fn get_tax_rate(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let eng = lock_read(&state.engine, "main.get_tax_rate.engine_read").await;
    Ok(Json(serde_json::json!({
        "tax_rate_ppm": eng.tax_rate_ppm,
        "tax_rate": eng.tax_rate_ppm as f64 / 1_000_000.0,
        "tax_collected_total": eng.tax_collected_total
    })))
}

async fn set_tax_rate(
    State(state): State<AppState>,
    Json(req): Json<TaxRateBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !(0.0..1.0).contains(&req.tax_rate) {
        return Err(ApiError::validation("tax_rate_out_of_range: 0.0..1.0"));
    }
    let ppm = rate_to_ppm(req.tax_rate);
    {
        let mut eng = lock_write(&state.engine, "main.set_tax_rate.engine_write").await;
        eng.set_tax_rate_ppm(ppm);
    }
    journal_events(&state, &[ExchangeEvent::TaxRateChanged { ppm }]).await;
    Ok(Json(serde_json::json!({ "tax_rate_ppm": ppm })))
}

/// Manual settlement trigger. Takes the same distributed lock the scheduler
/// uses so a pass never runs twice concurrently.
async fn run_settlement_now(
    State(state): State<AppState>,
) -> Result<Json<SettleStats>, ApiError> {
    let now_ms = now_epoch_ms();
    let lock_name = &state.cfg.scheduler.lock_name;
    // Fresh claim id per invocation. Reusing the background loop's id would
    // ride its same-owner TTL refresh and let two passes overlap.
    let owner = lock_owner_id();
    let acquired = state
        .sched_lock
        .try_acquire(lock_name, &owner, state.cfg.scheduler.lock_ttl_ms, now_ms)
        .await
        .map_err(ApiError::from)?;
    if !acquired {
        return Err(ApiError::conflict("settlement_pass_running"));
    }
    let (stats, events) = settle_once(&state, now_ms).await;
    journal_events(&state, &events).await;
    if let Err(e) = state.sched_lock.release(lock_name, &owner).await {
        eprintln!("[settle] lock_release_failed name={} err={:#}", lock_name, e);
    }
    Ok(Json(stats))
}

async fn get_perf(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(state.perf.snapshot_json()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let (job_tx, job_rx) = mpsc::channel::<ExchangeJob>(JOB_QUEUE_CAP);

    let state = AppState {
        cfg: cfg.clone(),
        db: db.clone(),
        engine: Arc::new(RwLock::new(ExchangeState::new(
            cfg.exchange.tax_rate,
            cfg.exchange.deposit_rate,
        ))),
        event_type_ids: Arc::new(RwLock::new(HashMap::new())),
        currency: Arc::new(VaultCurrency::new()),
        inventory: Arc::new(VaultInventory::new()),
        notifier: Arc::new(LogNotifier),
        sched_lock: Arc::new(PgSchedulerLock::new(db.clone())),
        lock_owner: lock_owner_id(),
        job_tx,
        op_status: Arc::new(DashMap::new()),
        suggestion_cache: Arc::new(DashMap::new()),
        item_board_cache: Arc::new(DashMap::new()),
        summary_cache: Arc::new(RwLock::new(ExchangeSummary::empty())),
        perf: Arc::new(PerfCounters::new()),
        engine_ready: Arc::new(AtomicBool::new(false)),
    };

    load_event_type_ids(&state).await?;

    let allowed_headers = [CONTENT_TYPE, ACCEPT];
    let allowed_methods = [Method::GET, Method::POST, Method::PUT, Method::OPTIONS];
    let cors = if cfg.api.cors_origins.iter().any(|x| x == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    // Serve immediately; replay runs in the background and flips readiness
    // when the engine is caught up.
    let s_boot = state.clone();
    tokio::spawn(async move {
        match replay_from_db(&s_boot).await {
            Ok(()) => {
                start_background_tasks(s_boot.clone(), job_rx);
                s_boot.engine_ready.store(true, Ordering::Release);
                eprintln!("[startup] engine_ready=true");
            }
            Err(e) => {
                eprintln!("[startup] replay_failed err={e:#}");
            }
        }
    });

    let protected_api = Router::new()
        .route("/summary", get(get_exchange_summary))
        .route("/listings", post(create_listing))
        .route("/listings/{listing_id}", get(get_listing))
        .route("/listings/{listing_id}/bids", post(place_bid))
        .route("/listings/{listing_id}/bids/async", post(place_bid_async))
        .route("/listings/{listing_id}/buyout", post(buy_now))
        .route("/listings/{listing_id}/buyout/async", post(buy_now_async))
        .route("/listings/{listing_id}/cancel", post(cancel_listing))
        .route("/items/{item_id}/listings", get(get_item_board))
        .route("/items/{item_id}/price", get(get_price))
        .route("/items/{item_id}/history", get(get_price_history))
        .route("/players/{player_id}/listings", get(get_player_listings))
        .route("/players/{player_id}/bids", get(get_player_bids))
        .route("/ops/{op_token}", get(get_op_status))
        .route("/admin/tax-rate", get(get_tax_rate).put(set_tax_rate))
        .route("/admin/settle", post(run_settlement_now))
        .route("/admin/perf", get(get_perf))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_engine_ready,
        ));

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(protected_api)
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port).parse()?;
    println!("Exchange API listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
