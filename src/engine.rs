use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::history::PriceHistory;

pub(crate) type PlayerId = i64;
pub(crate) type ItemId = i64;
pub(crate) type ListingId = i64;

pub(crate) const PPM_SCALE: i64 = 1_000_000;

pub(crate) fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub(crate) fn rate_to_ppm(rate: f64) -> i64 {
    (rate * PPM_SCALE as f64).round() as i64
}

/// Tax or deposit cut in ppm, widened to avoid overflow on large lots.
pub(crate) fn checked_cut(amount: i64, ppm: i64) -> Option<i64> {
    if amount < 0 || ppm < 0 {
        return None;
    }
    let v = (amount as i128).checked_mul(ppm as i128)? / PPM_SCALE as i128;
    i64::try_from(v).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ListingType {
    Buyout,
    Auction,
    Both,
}

impl ListingType {
    pub(crate) fn supports_bids(self) -> bool {
        matches!(self, ListingType::Auction | ListingType::Both)
    }
    pub(crate) fn supports_buyout(self) -> bool {
        matches!(self, ListingType::Buyout | ListingType::Both)
    }
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "buyout" => Some(ListingType::Buyout),
            "auction" => Some(ListingType::Auction),
            "both" => Some(ListingType::Both),
            _ => None,
        }
    }
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ListingType::Buyout => "buyout",
            ListingType::Auction => "auction",
            ListingType::Both => "both",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ListingStatus {
    Active,
    Sold,
    Expired,
    Cancelled,
}

impl ListingStatus {
    pub(crate) fn is_terminal(self) -> bool {
        !matches!(self, ListingStatus::Active)
    }
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::Expired => "expired",
            ListingStatus::Cancelled => "cancelled",
        }
    }
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ListingStatus::Active),
            "sold" => Some(ListingStatus::Sold),
            "expired" => Some(ListingStatus::Expired),
            "cancelled" => Some(ListingStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct BidRecord {
    pub(crate) bidder_id: PlayerId,
    pub(crate) amount: i64,
    pub(crate) placed_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Listing {
    pub(crate) id: ListingId,
    pub(crate) seller_id: PlayerId,
    pub(crate) item_id: ItemId,
    pub(crate) quantity: i64,
    pub(crate) listing_type: ListingType,
    pub(crate) buyout_price: Option<i64>,
    pub(crate) starting_bid: Option<i64>,
    pub(crate) current_bid: Option<i64>,
    pub(crate) current_bidder_id: Option<PlayerId>,
    pub(crate) min_increment_ppm: i64,
    pub(crate) status: ListingStatus,
    pub(crate) created_ms: i64,
    pub(crate) expires_ms: i64,
    pub(crate) bid_history: Vec<BidRecord>,
    // Bumped on every accepted mutation; all writers gate on it.
    pub(crate) version: u64,
    pub(crate) deposit_held: i64,
}

impl Listing {
    /// Lowest amount the next bid must reach. First bid enters at the
    /// starting price; raises must clear the current bid by
    /// max(fixed floor, current * increment ppm).
    pub(crate) fn min_accepted_bid(&self, increment_floor: i64) -> i64 {
        match self.current_bid {
            None => self.starting_bid.unwrap_or(1).max(1),
            Some(cur) => {
                let pct = checked_cut(cur, self.min_increment_ppm).unwrap_or(i64::MAX);
                cur.saturating_add(pct.max(increment_floor.max(1)))
            }
        }
    }
}

/// Why a reservation is still on the books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum HoldState {
    /// Live hold backing the bidder's outstanding bid.
    Held,
    /// Displaced or superseded; release attempted inline, reconciliation
    /// completes it if that attempt failed.
    PendingRefund,
    /// Winner's hold awaiting the consume+payout currency call.
    PendingConsume,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReservationEntry {
    pub(crate) listing_id: ListingId,
    pub(crate) bidder_id: PlayerId,
    pub(crate) amount_held: i64,
    pub(crate) state: HoldState,
    pub(crate) updated_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SettlementOutcome {
    Sold,
    Expired,
    Cancelled,
}

impl SettlementOutcome {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            SettlementOutcome::Sold => "sold",
            SettlementOutcome::Expired => "expired",
            SettlementOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SettlementRecord {
    pub(crate) listing_id: ListingId,
    pub(crate) generation: u64,
    pub(crate) outcome: SettlementOutcome,
    pub(crate) winner_id: Option<PlayerId>,
    pub(crate) final_price: Option<i64>,
    pub(crate) tax_collected: i64,
    pub(crate) settled_ms: i64,
}

impl SettlementRecord {
    pub(crate) fn idempotency_key(&self) -> String {
        format!("{}:{}", self.listing_id, self.generation)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct ExpiryItem {
    at_ms: i64,
    listing_id: ListingId,
}

impl Ord for ExpiryItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at_ms.cmp(&other.at_ms).then(self.listing_id.cmp(&other.listing_id))
    }
}

impl PartialOrd for ExpiryItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Journal payloads. Replay applies these mechanically; every variant carries
/// the resulting facts, never inputs that would need re-deciding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum ExchangeEvent {
    ListingCreated {
        listing: Listing,
    },
    BidPlaced {
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
        prev_bidder: Option<PlayerId>,
        prev_amount: Option<i64>,
        version: u64,
        at_ms: i64,
    },
    ReservationRefunded {
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
        at_ms: i64,
    },
    ReservationConsumed {
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
        at_ms: i64,
    },
    ListingSold {
        record: SettlementRecord,
        item_id: ItemId,
        quantity: i64,
        version: u64,
        /// Auction resolution keeps the winner's hold for consumption; a
        /// buyout refunds every hold including the buyer's own.
        won_by_bid: bool,
    },
    ListingExpired {
        record: SettlementRecord,
        version: u64,
    },
    ListingCancelled {
        record: SettlementRecord,
        version: u64,
    },
    TaxRateChanged {
        ppm: i64,
    },
}

impl ExchangeEvent {
    pub(crate) fn code(&self) -> &'static str {
        match self {
            ExchangeEvent::ListingCreated { .. } => "listing_created",
            ExchangeEvent::BidPlaced { .. } => "bid_placed",
            ExchangeEvent::ReservationRefunded { .. } => "reservation_refunded",
            ExchangeEvent::ReservationConsumed { .. } => "reservation_consumed",
            ExchangeEvent::ListingSold { .. } => "listing_sold",
            ExchangeEvent::ListingExpired { .. } => "listing_expired",
            ExchangeEvent::ListingCancelled { .. } => "listing_cancelled",
            ExchangeEvent::TaxRateChanged { .. } => "tax_rate_changed",
        }
    }

    pub(crate) fn listing_id(&self) -> ListingId {
        match self {
            ExchangeEvent::ListingCreated { listing } => listing.id,
            ExchangeEvent::BidPlaced { listing_id, .. }
            | ExchangeEvent::ReservationRefunded { listing_id, .. }
            | ExchangeEvent::ReservationConsumed { listing_id, .. } => *listing_id,
            ExchangeEvent::ListingSold { record, .. }
            | ExchangeEvent::ListingExpired { record, .. }
            | ExchangeEvent::ListingCancelled { record, .. } => record.listing_id,
            ExchangeEvent::TaxRateChanged { .. } => 0,
        }
    }

    pub(crate) const CODES: &'static [&'static str] = &[
        "listing_created",
        "bid_placed",
        "reservation_refunded",
        "reservation_consumed",
        "listing_sold",
        "listing_expired",
        "listing_cancelled",
        "tax_rate_changed",
    ];
}

#[derive(Debug)]
pub(crate) enum BidApply {
    Applied {
        new_version: u64,
        new_current_bid: i64,
        /// Displaced leader now marked PendingRefund, with the amount owed.
        prev_hold: Option<(PlayerId, i64)>,
        /// Amount the bidder's own slot held before this write replaced it.
        /// Its backing now counts toward the new hold, whatever state the
        /// old entry was in.
        superseded_hold: i64,
    },
    /// Stored version moved past the caller's read. Re-read and re-evaluate.
    StaleVersion { current: u64 },
}

#[derive(Debug)]
pub(crate) enum BuyoutApply {
    Applied {
        record: SettlementRecord,
        seller_id: PlayerId,
        item_id: ItemId,
        quantity: i64,
        deposit_refund: i64,
        /// Every auction hold on the listing, superseded in full.
        refunds: Vec<(PlayerId, i64)>,
        new_version: u64,
    },
    StaleVersion { current: u64 },
}

#[derive(Debug)]
pub(crate) enum CancelApply {
    Applied {
        record: SettlementRecord,
        item_id: ItemId,
        quantity: i64,
        deposit_refund: i64,
        new_version: u64,
    },
    StaleVersion { current: u64 },
}

#[derive(Debug)]
pub(crate) enum ResolutionApply {
    NotDue,
    AlreadySettled,
    SoldToBidder {
        record: SettlementRecord,
        seller_id: PlayerId,
        item_id: ItemId,
        quantity: i64,
        deposit_refund: i64,
        winner_id: PlayerId,
        price: i64,
        tax: i64,
        /// Non-winner holds still on the books at resolution time.
        refunds: Vec<(PlayerId, i64)>,
        new_version: u64,
    },
    ExpiredNoBids {
        record: SettlementRecord,
        seller_id: PlayerId,
        item_id: ItemId,
        quantity: i64,
        deposit_refund: i64,
        new_version: u64,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ReconCandidate {
    pub(crate) listing_id: ListingId,
    pub(crate) bidder_id: PlayerId,
    pub(crate) amount: i64,
    pub(crate) state: HoldState,
    /// Held under a terminal listing: a hold the request path should have
    /// transitioned but did not. Logged before healing.
    pub(crate) inconsistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExchangeSnapshot {
    pub(crate) last_event_id: i64,
    pub(crate) next_listing_id: i64,
    pub(crate) tax_rate_ppm: i64,
    pub(crate) tax_collected_total: i64,
    pub(crate) deposit_rate_ppm: i64,
    pub(crate) resolution_generation: u64,
    pub(crate) listings: Vec<Listing>,
    pub(crate) ledger: Vec<ReservationEntry>,
    pub(crate) settlements: Vec<SettlementRecord>,
    pub(crate) history: PriceHistory,
}

#[derive(Debug)]
pub(crate) struct ExchangeState {
    pub(crate) last_event_id: i64,
    next_listing_id: i64,
    pub(crate) tax_rate_ppm: i64,
    pub(crate) tax_collected_total: i64,
    pub(crate) deposit_rate_ppm: i64,
    pub(crate) resolution_generation: u64,
    pub(crate) listings: HashMap<ListingId, Listing>,
    /// One entry per (listing, bidder); holds only outstanding money.
    pub(crate) ledger: HashMap<(ListingId, PlayerId), ReservationEntry>,
    pub(crate) settlements: HashMap<ListingId, SettlementRecord>,
    pub(crate) history: PriceHistory,
    pub(crate) seller_index: HashMap<PlayerId, Vec<ListingId>>,
    pub(crate) bidder_index: HashMap<PlayerId, Vec<ListingId>>,
    expiry_heap: BinaryHeap<Reverse<ExpiryItem>>,
    pub(crate) active_count: i64,
}

impl ExchangeState {
    pub(crate) fn new(tax_rate: f64, deposit_rate: f64) -> Self {
        Self {
            last_event_id: 0,
            next_listing_id: 1,
            tax_rate_ppm: rate_to_ppm(tax_rate),
            tax_collected_total: 0,
            deposit_rate_ppm: rate_to_ppm(deposit_rate),
            resolution_generation: 0,
            listings: HashMap::new(),
            ledger: HashMap::new(),
            settlements: HashMap::new(),
            history: PriceHistory::new(),
            seller_index: HashMap::new(),
            bidder_index: HashMap::new(),
            expiry_heap: BinaryHeap::new(),
            active_count: 0,
        }
    }

    pub(crate) fn active_for_seller(&self, seller_id: PlayerId) -> usize {
        self.seller_index
            .get(&seller_id)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        self.listings
                            .get(id)
                            .map(|l| l.status == ListingStatus::Active)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0)
    }

    fn index_for_seller(&mut self, seller_id: PlayerId, listing_id: ListingId) {
        let list = self.seller_index.entry(seller_id).or_default();
        if list.last().copied() != Some(listing_id) && !list.contains(&listing_id) {
            list.push(listing_id);
        }
    }

    fn index_for_bidder(&mut self, bidder_id: PlayerId, listing_id: ListingId) {
        let list = self.bidder_index.entry(bidder_id).or_default();
        if list.last().copied() != Some(listing_id) && !list.contains(&listing_id) {
            list.push(listing_id);
        }
    }

    pub(crate) fn rebuild_player_indexes(&mut self) {
        self.seller_index.clear();
        self.bidder_index.clear();
        let mut rows: Vec<(i64, ListingId, PlayerId)> = self
            .listings
            .values()
            .map(|l| (l.created_ms, l.id, l.seller_id))
            .collect();
        rows.sort_unstable();
        for (_, listing_id, seller_id) in rows {
            self.seller_index.entry(seller_id).or_default().push(listing_id);
        }
        let mut bids: Vec<(i64, ListingId, PlayerId)> = Vec::new();
        for l in self.listings.values() {
            for b in &l.bid_history {
                bids.push((b.placed_ms, l.id, b.bidder_id));
            }
        }
        bids.sort_unstable();
        for (_, listing_id, bidder_id) in bids {
            let list = self.bidder_index.entry(bidder_id).or_default();
            if !list.contains(&listing_id) {
                list.push(listing_id);
            }
        }
    }

    /// Registers a new listing. Caller has already validated inputs and
    /// escrowed the item; the listing enters Active at version 1.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_listing(
        &mut self,
        seller_id: PlayerId,
        item_id: ItemId,
        quantity: i64,
        listing_type: ListingType,
        buyout_price: Option<i64>,
        starting_bid: Option<i64>,
        min_increment_ppm: i64,
        duration_ms: i64,
        deposit_held: i64,
        now_ms: i64,
    ) -> Listing {
        let id = self.next_listing_id;
        self.next_listing_id += 1;
        let listing = Listing {
            id,
            seller_id,
            item_id,
            quantity,
            listing_type,
            buyout_price,
            starting_bid,
            current_bid: None,
            current_bidder_id: None,
            min_increment_ppm,
            status: ListingStatus::Active,
            created_ms: now_ms,
            expires_ms: now_ms + duration_ms,
            bid_history: Vec::new(),
            version: 1,
            deposit_held,
        };
        self.expiry_heap.push(Reverse(ExpiryItem { at_ms: listing.expires_ms, listing_id: id }));
        self.index_for_seller(seller_id, id);
        self.listings.insert(id, listing.clone());
        self.active_count += 1;
        listing
    }

    /// Pins the bidder's hold at `amount` and returns whatever amount sat in
    /// the slot before (0 for a fresh entry). The prior amount's backing
    /// folds into the new hold; the caller settles any surplus.
    fn ledger_hold(&mut self, listing_id: ListingId, bidder_id: PlayerId, amount: i64, now_ms: i64) -> i64 {
        let e = self
            .ledger
            .entry((listing_id, bidder_id))
            .or_insert(ReservationEntry {
                listing_id,
                bidder_id,
                amount_held: 0,
                state: HoldState::Held,
                updated_ms: now_ms,
            });
        let prior = e.amount_held;
        e.amount_held = amount;
        e.state = HoldState::Held;
        e.updated_ms = now_ms;
        prior
    }

    fn ledger_mark(&mut self, listing_id: ListingId, bidder_id: PlayerId, state: HoldState, now_ms: i64) -> Option<i64> {
        let e = self.ledger.get_mut(&(listing_id, bidder_id))?;
        e.state = state;
        e.updated_ms = now_ms;
        Some(e.amount_held)
    }

    /// Removes an entry once its money has actually moved (refund landed or
    /// the consume+payout call succeeded).
    pub(crate) fn take_reservation(&mut self, listing_id: ListingId, bidder_id: PlayerId) -> Option<ReservationEntry> {
        self.ledger.remove(&(listing_id, bidder_id))
    }

    /// Puts back a claimed hold whose currency call failed, so the next
    /// reconciliation pass retries it. Refuses to clobber a newer hold that
    /// took the slot in the meantime; returns false in that case.
    pub(crate) fn reinstate_hold(
        &mut self,
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
        state: HoldState,
        now_ms: i64,
    ) -> bool {
        match self.ledger.entry((listing_id, bidder_id)) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(ReservationEntry {
                    listing_id,
                    bidder_id,
                    amount_held: amount,
                    state,
                    updated_ms: now_ms,
                });
                true
            }
        }
    }

    pub(crate) fn reservation(&self, listing_id: ListingId, bidder_id: PlayerId) -> Option<&ReservationEntry> {
        self.ledger.get(&(listing_id, bidder_id))
    }

    /// Flip every outstanding hold on a listing (minus `except`) to
    /// PendingRefund and report who is owed what.
    fn sweep_holds_to_pending_refund(
        &mut self,
        listing_id: ListingId,
        except: Option<PlayerId>,
        now_ms: i64,
    ) -> Vec<(PlayerId, i64)> {
        let mut out = Vec::new();
        for e in self.ledger.values_mut() {
            if e.listing_id != listing_id {
                continue;
            }
            if Some(e.bidder_id) == except {
                continue;
            }
            if e.state == HoldState::Held {
                e.state = HoldState::PendingRefund;
                e.updated_ms = now_ms;
            }
            if e.state == HoldState::PendingRefund {
                out.push((e.bidder_id, e.amount_held));
            }
        }
        out
    }

    pub(crate) fn apply_bid(
        &mut self,
        listing_id: ListingId,
        bidder_id: PlayerId,
        amount: i64,
        expected_version: u64,
        increment_floor: i64,
        now_ms: i64,
    ) -> Result<BidApply, ApiError> {
        let Some(l) = self.listings.get(&listing_id) else {
            return Err(ApiError::not_found("listing_not_found"));
        };
        if l.status != ListingStatus::Active {
            return Err(ApiError::conflict("listing_not_active"));
        }
        if !l.listing_type.supports_bids() {
            return Err(ApiError::validation("wrong_listing_type: listing does not take bids"));
        }
        if l.seller_id == bidder_id {
            return Err(ApiError::validation("self_bid"));
        }
        if l.expires_ms <= now_ms {
            // Race with the scheduler; the resolution path owns this listing now.
            return Err(ApiError::conflict("listing_not_active: expired"));
        }
        if l.version != expected_version {
            return Ok(BidApply::StaleVersion { current: l.version });
        }
        let min = l.min_accepted_bid(increment_floor);
        if amount < min {
            return Err(ApiError::validation(format!("bid_too_low: need at least {min}")));
        }
        let prev = match (l.current_bidder_id, l.current_bid) {
            (Some(p), Some(a)) if p != bidder_id => Some((p, a)),
            _ => None,
        };

        let l = self.listings.get_mut(&listing_id).expect("listing present");
        l.current_bid = Some(amount);
        l.current_bidder_id = Some(bidder_id);
        l.bid_history.push(BidRecord { bidder_id, amount, placed_ms: now_ms });
        l.version += 1;
        let new_version = l.version;

        let superseded_hold = self.ledger_hold(listing_id, bidder_id, amount, now_ms);
        if let Some((p, _)) = prev {
            let _ = self.ledger_mark(listing_id, p, HoldState::PendingRefund, now_ms);
        }
        self.index_for_bidder(bidder_id, listing_id);
        Ok(BidApply::Applied {
            new_version,
            new_current_bid: amount,
            prev_hold: prev,
            superseded_hold,
        })
    }

    pub(crate) fn apply_buyout(
        &mut self,
        listing_id: ListingId,
        buyer_id: PlayerId,
        expected_version: u64,
        now_ms: i64,
    ) -> Result<BuyoutApply, ApiError> {
        let Some(l) = self.listings.get(&listing_id) else {
            return Err(ApiError::not_found("listing_not_found"));
        };
        match l.status {
            ListingStatus::Active => {}
            ListingStatus::Sold => return Err(ApiError::conflict("already_sold")),
            _ => return Err(ApiError::conflict("listing_not_active")),
        }
        if !l.listing_type.supports_buyout() {
            return Err(ApiError::validation("wrong_listing_type: listing has no buyout price"));
        }
        if l.seller_id == buyer_id {
            return Err(ApiError::validation("self_bid: seller cannot buy own listing"));
        }
        if l.expires_ms <= now_ms {
            return Err(ApiError::conflict("listing_not_active: expired"));
        }
        if l.version != expected_version {
            return Ok(BuyoutApply::StaleVersion { current: l.version });
        }
        let Some(price) = l.buyout_price else {
            return Err(ApiError::validation("wrong_listing_type: listing has no buyout price"));
        };
        let tax = checked_cut(price, self.tax_rate_ppm)
            .ok_or_else(|| ApiError::internal("tax_overflow"))?;
        let (seller_id, item_id, quantity, deposit_refund) =
            (l.seller_id, l.item_id, l.quantity, l.deposit_held);

        let generation = self.resolution_generation;
        let l = self.listings.get_mut(&listing_id).expect("listing present");
        l.status = ListingStatus::Sold;
        l.version += 1;
        let new_version = l.version;
        self.active_count -= 1;

        let record = SettlementRecord {
            listing_id,
            generation,
            outcome: SettlementOutcome::Sold,
            winner_id: Some(buyer_id),
            final_price: Some(price),
            tax_collected: tax,
            settled_ms: now_ms,
        };
        self.settlements.insert(listing_id, record.clone());
        self.tax_collected_total += tax;
        self.history.record_sale(item_id, price, quantity, now_ms);

        // The auction is superseded; every hold goes back, including any the
        // buyer placed as a bidder.
        let refunds = self.sweep_holds_to_pending_refund(listing_id, None, now_ms);
        Ok(BuyoutApply::Applied {
            record,
            seller_id,
            item_id,
            quantity,
            deposit_refund,
            refunds,
            new_version,
        })
    }

    pub(crate) fn apply_cancel(
        &mut self,
        listing_id: ListingId,
        seller_id: PlayerId,
        expected_version: u64,
        now_ms: i64,
    ) -> Result<CancelApply, ApiError> {
        let Some(l) = self.listings.get(&listing_id) else {
            return Err(ApiError::not_found("listing_not_found"));
        };
        if l.seller_id != seller_id {
            return Err(ApiError::validation("not_seller"));
        }
        if l.status != ListingStatus::Active {
            return Err(ApiError::conflict("listing_not_active"));
        }
        if !l.bid_history.is_empty() {
            return Err(ApiError::validation("listing_has_bids"));
        }
        if l.version != expected_version {
            return Ok(CancelApply::StaleVersion { current: l.version });
        }
        let (item_id, quantity, deposit_refund) = (l.item_id, l.quantity, l.deposit_held);

        let generation = self.resolution_generation;
        let l = self.listings.get_mut(&listing_id).expect("listing present");
        l.status = ListingStatus::Cancelled;
        l.version += 1;
        let new_version = l.version;
        self.active_count -= 1;

        let record = SettlementRecord {
            listing_id,
            generation,
            outcome: SettlementOutcome::Cancelled,
            winner_id: None,
            final_price: None,
            tax_collected: 0,
            settled_ms: now_ms,
        };
        self.settlements.insert(listing_id, record.clone());
        Ok(CancelApply::Applied { record, item_id, quantity, deposit_refund, new_version })
    }

    /// Expiration-pass resolution for a single listing. Terminal transition
    /// and ledger marking happen here in one step; the caller performs the
    /// currency/inventory effects afterwards and the marked entries survive
    /// until those effects land.
    pub(crate) fn resolve_due_listing(&mut self, listing_id: ListingId, now_ms: i64) -> ResolutionApply {
        let Some(l) = self.listings.get(&listing_id) else {
            return ResolutionApply::AlreadySettled;
        };
        if l.status != ListingStatus::Active {
            return ResolutionApply::AlreadySettled;
        }
        if l.expires_ms > now_ms {
            return ResolutionApply::NotDue;
        }
        let (seller_id, item_id, quantity, deposit_refund) =
            (l.seller_id, l.item_id, l.quantity, l.deposit_held);
        let winner = match (l.current_bidder_id, l.current_bid) {
            (Some(w), Some(p)) => Some((w, p)),
            _ => None,
        };
        let generation = self.resolution_generation;

        match winner {
            Some((winner_id, price)) => {
                let tax = checked_cut(price, self.tax_rate_ppm).unwrap_or(0);
                let l = self.listings.get_mut(&listing_id).expect("listing present");
                l.status = ListingStatus::Sold;
                l.version += 1;
                let new_version = l.version;
                self.active_count -= 1;

                let record = SettlementRecord {
                    listing_id,
                    generation,
                    outcome: SettlementOutcome::Sold,
                    winner_id: Some(winner_id),
                    final_price: Some(price),
                    tax_collected: tax,
                    settled_ms: now_ms,
                };
                self.settlements.insert(listing_id, record.clone());
                self.tax_collected_total += tax;
                self.history.record_sale(item_id, price, quantity, now_ms);

                // Winner's hold already equals the price paid; it is consumed,
                // not refunded, once the payout call goes through.
                let _ = self.ledger_mark(listing_id, winner_id, HoldState::PendingConsume, now_ms);
                let refunds = self.sweep_holds_to_pending_refund(listing_id, Some(winner_id), now_ms);
                ResolutionApply::SoldToBidder {
                    record,
                    seller_id,
                    item_id,
                    quantity,
                    deposit_refund,
                    winner_id,
                    price,
                    tax,
                    refunds,
                    new_version,
                }
            }
            None => {
                let l = self.listings.get_mut(&listing_id).expect("listing present");
                l.status = ListingStatus::Expired;
                l.version += 1;
                let new_version = l.version;
                self.active_count -= 1;

                let record = SettlementRecord {
                    listing_id,
                    generation,
                    outcome: SettlementOutcome::Expired,
                    winner_id: None,
                    final_price: None,
                    tax_collected: 0,
                    settled_ms: now_ms,
                };
                self.settlements.insert(listing_id, record.clone());
                ResolutionApply::ExpiredNoBids {
                    record,
                    seller_id,
                    item_id,
                    quantity,
                    deposit_refund,
                    new_version,
                }
            }
        }
    }

    /// Pops due expiry entries, skipping stale ones, up to `max_items`.
    /// Returned ids are Active and past expiry; the second field reports
    /// whether more due work remains.
    pub(crate) fn due_candidates(&mut self, now_ms: i64, max_items: usize) -> (Vec<ListingId>, bool) {
        let mut out = Vec::new();
        let mut scanned = 0usize;
        let limit = max_items.max(1);
        while scanned < limit {
            let Some(Reverse(top)) = self.expiry_heap.peek().copied() else { break };
            if top.at_ms > now_ms {
                break;
            }
            scanned += 1;
            let _ = self.expiry_heap.pop();
            let live = self
                .listings
                .get(&top.listing_id)
                .map(|l| l.status == ListingStatus::Active && l.expires_ms <= now_ms)
                .unwrap_or(false);
            if live {
                out.push(top.listing_id);
            }
        }
        let has_more = self
            .expiry_heap
            .peek()
            .map(|Reverse(top)| top.at_ms <= now_ms)
            .unwrap_or(false);
        (out, has_more)
    }

    /// Puts a popped candidate back after a failed resolution attempt so the
    /// next pass retries it.
    pub(crate) fn requeue_expiry(&mut self, listing_id: ListingId, at_ms: i64) {
        self.expiry_heap.push(Reverse(ExpiryItem { at_ms, listing_id }));
    }

    pub(crate) fn begin_settlement_pass(&mut self) -> u64 {
        self.resolution_generation += 1;
        self.resolution_generation
    }

    /// Outstanding entries whose parent listing is already terminal (or
    /// unknown). These are the reconciliation pass's work queue.
    pub(crate) fn reconciliation_scan(&self) -> Vec<ReconCandidate> {
        let mut out = Vec::new();
        for e in self.ledger.values() {
            let terminal = self
                .listings
                .get(&e.listing_id)
                .map(|l| l.status.is_terminal())
                .unwrap_or(true);
            if !terminal {
                continue;
            }
            out.push(ReconCandidate {
                listing_id: e.listing_id,
                bidder_id: e.bidder_id,
                amount: e.amount_held,
                state: e.state,
                inconsistent: e.state == HoldState::Held,
            });
        }
        out.sort_by_key(|c| (c.bidder_id, c.listing_id));
        out
    }

    /// Startup repair, run after replay: the leader of every live auction
    /// must have a hold equal to the current bid. Missing or short entries
    /// are re-pinned; leftovers under terminal listings stay for the
    /// reconciliation pass to refund.
    pub(crate) fn recompute_reservations(&mut self, now_ms: i64) -> (usize, usize) {
        let mut repaired = 0usize;
        let leaders: Vec<(ListingId, PlayerId, i64)> = self
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .filter_map(|l| match (l.current_bidder_id, l.current_bid) {
                (Some(b), Some(a)) => Some((l.id, b, a)),
                _ => None,
            })
            .collect();
        for (listing_id, bidder_id, amount) in leaders {
            let ok = self
                .ledger
                .get(&(listing_id, bidder_id))
                .map(|e| e.state == HoldState::Held && e.amount_held == amount)
                .unwrap_or(false);
            if !ok {
                let _ = self.ledger_hold(listing_id, bidder_id, amount, now_ms);
                repaired += 1;
            }
        }
        let orphans = self.reconciliation_scan().len();
        (repaired, orphans)
    }

    pub(crate) fn set_tax_rate_ppm(&mut self, ppm: i64) {
        self.tax_rate_ppm = ppm.max(0);
    }

    pub(crate) fn apply_event(&mut self, ev: &ExchangeEvent) {
        match ev {
            ExchangeEvent::ListingCreated { listing } => {
                if listing.id >= self.next_listing_id {
                    self.next_listing_id = listing.id + 1;
                }
                if listing.status == ListingStatus::Active {
                    self.expiry_heap.push(Reverse(ExpiryItem {
                        at_ms: listing.expires_ms,
                        listing_id: listing.id,
                    }));
                    self.active_count += 1;
                }
                self.index_for_seller(listing.seller_id, listing.id);
                self.listings.insert(listing.id, listing.clone());
            }
            ExchangeEvent::BidPlaced {
                listing_id,
                bidder_id,
                amount,
                prev_bidder,
                version,
                at_ms,
                ..
            } => {
                if let Some(l) = self.listings.get_mut(listing_id) {
                    l.current_bid = Some(*amount);
                    l.current_bidder_id = Some(*bidder_id);
                    l.bid_history.push(BidRecord {
                        bidder_id: *bidder_id,
                        amount: *amount,
                        placed_ms: *at_ms,
                    });
                    l.version = *version;
                }
                let _ = self.ledger_hold(*listing_id, *bidder_id, *amount, *at_ms);
                if let Some(p) = prev_bidder {
                    if p != bidder_id {
                        let _ = self.ledger_mark(*listing_id, *p, HoldState::PendingRefund, *at_ms);
                    }
                }
                self.index_for_bidder(*bidder_id, *listing_id);
            }
            ExchangeEvent::ReservationRefunded { listing_id, bidder_id, .. }
            | ExchangeEvent::ReservationConsumed { listing_id, bidder_id, .. } => {
                let _ = self.ledger.remove(&(*listing_id, *bidder_id));
            }
            ExchangeEvent::ListingSold { record, item_id, quantity, version, won_by_bid } => {
                if let Some(l) = self.listings.get_mut(&record.listing_id) {
                    if l.status == ListingStatus::Active {
                        self.active_count -= 1;
                    }
                    l.status = ListingStatus::Sold;
                    l.version = *version;
                }
                let except = if *won_by_bid {
                    if let Some(w) = record.winner_id {
                        let _ = self.ledger_mark(
                            record.listing_id,
                            w,
                            HoldState::PendingConsume,
                            record.settled_ms,
                        );
                    }
                    record.winner_id
                } else {
                    None
                };
                let _ = self.sweep_holds_to_pending_refund(record.listing_id, except, record.settled_ms);
                self.tax_collected_total += record.tax_collected;
                self.history.record_sale(
                    *item_id,
                    record.final_price.unwrap_or(0),
                    *quantity,
                    record.settled_ms,
                );
                self.settlements.insert(record.listing_id, record.clone());
            }
            ExchangeEvent::ListingExpired { record, version }
            | ExchangeEvent::ListingCancelled { record, version } => {
                if let Some(l) = self.listings.get_mut(&record.listing_id) {
                    if l.status == ListingStatus::Active {
                        self.active_count -= 1;
                    }
                    l.status = match record.outcome {
                        SettlementOutcome::Expired => ListingStatus::Expired,
                        _ => ListingStatus::Cancelled,
                    };
                    l.version = *version;
                }
                let _ = self.sweep_holds_to_pending_refund(record.listing_id, None, record.settled_ms);
                self.settlements.insert(record.listing_id, record.clone());
            }
            ExchangeEvent::TaxRateChanged { ppm } => {
                self.set_tax_rate_ppm(*ppm);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> ExchangeSnapshot {
        ExchangeSnapshot {
            last_event_id: self.last_event_id,
            next_listing_id: self.next_listing_id,
            tax_rate_ppm: self.tax_rate_ppm,
            tax_collected_total: self.tax_collected_total,
            deposit_rate_ppm: self.deposit_rate_ppm,
            resolution_generation: self.resolution_generation,
            listings: self.listings.values().cloned().collect(),
            ledger: self.ledger.values().cloned().collect(),
            settlements: self.settlements.values().cloned().collect(),
            history: self.history.clone(),
        }
    }

    pub(crate) fn restore_from_snapshot(&mut self, snap: ExchangeSnapshot) {
        self.last_event_id = snap.last_event_id;
        self.next_listing_id = snap.next_listing_id;
        self.tax_rate_ppm = snap.tax_rate_ppm;
        self.tax_collected_total = snap.tax_collected_total;
        self.deposit_rate_ppm = snap.deposit_rate_ppm;
        self.resolution_generation = snap.resolution_generation;
        self.listings = snap.listings.into_iter().map(|l| (l.id, l)).collect();
        self.ledger = snap
            .ledger
            .into_iter()
            .map(|e| ((e.listing_id, e.bidder_id), e))
            .collect();
        self.settlements = snap
            .settlements
            .into_iter()
            .map(|r| (r.listing_id, r))
            .collect();
        self.history = snap.history;
        self.rebuild_player_indexes();
        self.rebuild_expiry_heap();
        self.active_count = self
            .listings
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .count() as i64;
    }

    pub(crate) fn rebuild_expiry_heap(&mut self) {
        self.expiry_heap.clear();
        for l in self.listings.values() {
            if l.status == ListingStatus::Active {
                self.expiry_heap.push(Reverse(ExpiryItem { at_ms: l.expires_ms, listing_id: l.id }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eng() -> ExchangeState {
        ExchangeState::new(0.05, 0.0)
    }

    fn auction(eng: &mut ExchangeState, seller: PlayerId, start: i64, now: i64) -> ListingId {
        eng.insert_listing(seller, 7, 1, ListingType::Auction, None, Some(start), 50_000, 60_000, 0, now)
            .id
    }

    fn both(eng: &mut ExchangeState, seller: PlayerId, start: i64, buyout: i64, now: i64) -> ListingId {
        eng.insert_listing(seller, 7, 1, ListingType::Both, Some(buyout), Some(start), 50_000, 60_000, 0, now)
            .id
    }

    #[test]
    fn first_bid_enters_at_starting_price() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        let r = e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        assert!(matches!(r, BidApply::Applied { new_current_bid: 100, .. }));
        let l = &e.listings[&id];
        assert_eq!(l.current_bid, Some(100));
        assert_eq!(l.version, 2);
        assert_eq!(l.bid_history.len(), 1);
        let hold = e.reservation(id, 2).unwrap();
        assert_eq!(hold.amount_held, 100);
        assert_eq!(hold.state, HoldState::Held);
    }

    #[test]
    fn raise_below_increment_is_rejected_with_minimum() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        // 5% of 100 = 5, so 104 is short and 105 is the exact minimum.
        let err = e.apply_bid(id, 3, 104, 2, 1, 20).unwrap_err();
        assert_eq!(err.code(), "bid_too_low");
        assert!(err.detail.contains("105"), "detail was {}", err.detail);
        let r = e.apply_bid(id, 3, 105, 2, 1, 30).unwrap();
        assert!(matches!(r, BidApply::Applied { prev_hold: Some((2, 100)), .. }));
        assert_eq!(e.reservation(id, 2).unwrap().state, HoldState::PendingRefund);
        assert_eq!(e.reservation(id, 3).unwrap().amount_held, 105);
    }

    #[test]
    fn increment_floor_overrides_small_percentage() {
        let mut e = eng();
        let id = e
            .insert_listing(1, 7, 1, ListingType::Auction, None, Some(10), 10_000, 60_000, 0, 0)
            .id;
        e.apply_bid(id, 2, 10, 1, 5, 10).unwrap();
        // 1% of 10 rounds to 0; the fixed floor of 5 governs.
        let err = e.apply_bid(id, 3, 14, 2, 5, 20).unwrap_err();
        assert_eq!(err.code(), "bid_too_low");
        assert!(e.apply_bid(id, 3, 15, 2, 5, 30).is_ok());
    }

    #[test]
    fn stale_version_loser_reevaluates_to_bid_too_low() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        // Two raises race off the same read at version 2: 130 lands first.
        let won = e.apply_bid(id, 4, 130, 2, 1, 20).unwrap();
        assert!(matches!(won, BidApply::Applied { new_version: 3, .. }));
        let lost = e.apply_bid(id, 3, 120, 2, 1, 21).unwrap();
        let BidApply::StaleVersion { current } = lost else {
            panic!("expected stale version");
        };
        assert_eq!(current, 3);
        // Fresh re-read: 120 no longer clears 130 + 5%.
        let err = e.apply_bid(id, 3, 120, current, 1, 22).unwrap_err();
        assert_eq!(err.code(), "bid_too_low");
        assert_eq!(e.listings[&id].current_bidder_id, Some(4));
    }

    #[test]
    fn leader_may_raise_but_not_rebid_lower() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        let err = e.apply_bid(id, 2, 100, 2, 1, 20).unwrap_err();
        assert_eq!(err.code(), "bid_too_low");
        let r = e.apply_bid(id, 2, 105, 2, 1, 30).unwrap();
        // Raising yourself displaces nobody; the old hold folds into the new.
        assert!(matches!(
            r,
            BidApply::Applied { prev_hold: None, superseded_hold: 100, .. }
        ));
        assert_eq!(e.reservation(id, 2).unwrap().amount_held, 105);
        assert_eq!(e.reservation(id, 2).unwrap().state, HoldState::Held);
    }

    #[test]
    fn rebid_over_pending_refund_reports_the_superseded_amount() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        e.apply_bid(id, 3, 110, 2, 1, 20).unwrap();
        assert_eq!(e.reservation(id, 2).unwrap().state, HoldState::PendingRefund);

        // 2's not-yet-refunded hold is replaced by their next raise; the
        // caller learns its amount so the backing can be reconciled.
        let BidApply::Applied { prev_hold, superseded_hold, .. } =
            e.apply_bid(id, 2, 120, 3, 1, 30).unwrap()
        else {
            panic!("expected applied");
        };
        assert_eq!(superseded_hold, 100);
        assert_eq!(prev_hold, Some((3, 110)));
        let hold = e.reservation(id, 2).unwrap();
        assert_eq!(hold.amount_held, 120);
        assert_eq!(hold.state, HoldState::Held);
    }

    #[test]
    fn self_bid_and_wrong_type_are_validation_errors() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        assert_eq!(e.apply_bid(id, 1, 100, 1, 1, 10).unwrap_err().code(), "self_bid");
        let fixed = e
            .insert_listing(1, 8, 1, ListingType::Buyout, Some(500), None, 50_000, 60_000, 0, 0)
            .id;
        assert_eq!(
            e.apply_bid(fixed, 2, 100, 1, 1, 10).unwrap_err().code(),
            "wrong_listing_type"
        );
    }

    #[test]
    fn buyout_rejected_on_auction_only_listing() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 105, 1, 1, 10).unwrap();
        let err = e.apply_buyout(id, 3, 2, 20).unwrap_err();
        assert_eq!(err.code(), "wrong_listing_type");
        assert_eq!(e.listings[&id].status, ListingStatus::Active);
        assert_eq!(e.listings[&id].version, 2);
    }

    #[test]
    fn buyout_supersedes_auction_and_sweeps_every_hold() {
        let mut e = eng();
        let id = both(&mut e, 1, 100, 1000, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        e.apply_bid(id, 3, 110, 2, 1, 20).unwrap();
        let r = e.apply_buyout(id, 4, 3, 30).unwrap();
        let BuyoutApply::Applied { record, refunds, .. } = r else {
            panic!("expected applied");
        };
        assert_eq!(record.final_price, Some(1000));
        assert_eq!(record.tax_collected, 50);
        assert_eq!(record.winner_id, Some(4));
        let mut owed: Vec<(PlayerId, i64)> = refunds;
        owed.sort_unstable();
        assert_eq!(owed, vec![(2, 100), (3, 110)]);
        assert_eq!(e.listings[&id].status, ListingStatus::Sold);
        // Second buyout observes the terminal state, not a stale version.
        assert_eq!(e.apply_buyout(id, 5, 4, 40).unwrap_err().code(), "already_sold");
    }

    #[test]
    fn buyout_stale_version_while_active_reports_current() {
        let mut e = eng();
        let id = both(&mut e, 1, 100, 1000, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        let r = e.apply_buyout(id, 3, 1, 20).unwrap();
        assert!(matches!(r, BuyoutApply::StaleVersion { current: 2 }));
        assert_eq!(e.listings[&id].status, ListingStatus::Active);
    }

    #[test]
    fn cancel_only_without_bids() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        assert_eq!(e.apply_cancel(id, 1, 2, 20).unwrap_err().code(), "listing_has_bids");
        let clean = auction(&mut e, 1, 50, 0);
        assert_eq!(e.apply_cancel(clean, 9, 1, 20).unwrap_err().code(), "not_seller");
        let r = e.apply_cancel(clean, 1, 1, 30).unwrap();
        let CancelApply::Applied { record, .. } = r else { panic!("expected applied") };
        assert_eq!(record.outcome, SettlementOutcome::Cancelled);
        assert_eq!(record.final_price, None);
        assert_eq!(e.listings[&clean].status, ListingStatus::Cancelled);
    }

    #[test]
    fn zero_bid_expiry_returns_item_with_no_currency_fields() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        let (due, more) = e.due_candidates(60_001, 16);
        assert_eq!(due, vec![id]);
        assert!(!more);
        let r = e.resolve_due_listing(id, 60_001);
        let ResolutionApply::ExpiredNoBids { record, seller_id, quantity, .. } = r else {
            panic!("expected expiry");
        };
        assert_eq!(seller_id, 1);
        assert_eq!(quantity, 1);
        assert_eq!(record.outcome, SettlementOutcome::Expired);
        assert_eq!(record.winner_id, None);
        assert_eq!(record.final_price, None);
        assert_eq!(record.tax_collected, 0);
        assert_eq!(e.listings[&id].status, ListingStatus::Expired);
    }

    #[test]
    fn resolution_sells_to_leader_and_consumes_their_hold() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        e.apply_bid(id, 3, 200, 2, 1, 20).unwrap();
        let r = e.resolve_due_listing(id, 60_001);
        let ResolutionApply::SoldToBidder { winner_id, price, tax, refunds, record, .. } = r else {
            panic!("expected sale");
        };
        assert_eq!(winner_id, 3);
        assert_eq!(price, 200);
        assert_eq!(tax, 10);
        assert_eq!(refunds, vec![(2, 100)]);
        assert_eq!(record.idempotency_key(), format!("{id}:0"));
        assert_eq!(e.reservation(id, 3).unwrap().state, HoldState::PendingConsume);
        assert_eq!(e.reservation(id, 2).unwrap().state, HoldState::PendingRefund);
        // Hold amount equals the price paid, never a second charge.
        assert_eq!(e.reservation(id, 3).unwrap().amount_held, 200);
    }

    #[test]
    fn resolving_twice_is_a_noop() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 150, 1, 1, 10).unwrap();
        let first = e.resolve_due_listing(id, 60_001);
        assert!(matches!(first, ResolutionApply::SoldToBidder { .. }));
        let tax_after_first = e.tax_collected_total;
        let again = e.resolve_due_listing(id, 60_002);
        assert!(matches!(again, ResolutionApply::AlreadySettled));
        assert_eq!(e.tax_collected_total, tax_after_first);
        assert_eq!(e.settlements.len(), 1);
    }

    #[test]
    fn bid_racing_expiry_loses_to_the_clock() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        let err = e.apply_bid(id, 2, 100, 1, 1, 60_001).unwrap_err();
        assert_eq!(err.code(), "listing_not_active");
    }

    #[test]
    fn reconciliation_scan_flags_held_under_terminal() {
        let mut e = eng();
        let id = both(&mut e, 1, 100, 1000, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        e.apply_buyout(id, 3, 2, 20).unwrap();
        // Simulate a request path that never transitioned the hold.
        e.ledger.get_mut(&(id, 2)).unwrap().state = HoldState::Held;
        let scan = e.reconciliation_scan();
        assert_eq!(scan.len(), 1);
        assert!(scan[0].inconsistent);
        assert_eq!(scan[0].amount, 100);
    }

    #[test]
    fn recompute_reservations_repins_missing_leader_hold() {
        let mut e = eng();
        let id = auction(&mut e, 1, 100, 0);
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        e.ledger.clear();
        let (repaired, orphans) = e.recompute_reservations(20);
        assert_eq!(repaired, 1);
        assert_eq!(orphans, 0);
        assert_eq!(e.reservation(id, 2).unwrap().amount_held, 100);
    }

    #[test]
    fn snapshot_restore_preserves_due_work() {
        let mut e = eng();
        let a = auction(&mut e, 1, 100, 0);
        let b = both(&mut e, 1, 100, 900, 0);
        e.apply_bid(a, 2, 100, 1, 1, 10).unwrap();
        let snap = e.snapshot();
        let bytes = bincode::serialize(&snap).unwrap();
        let snap2: ExchangeSnapshot = bincode::deserialize(&bytes).unwrap();
        let mut e2 = ExchangeState::new(0.0, 0.0);
        e2.restore_from_snapshot(snap2);
        assert_eq!(e2.tax_rate_ppm, 50_000);
        assert_eq!(e2.active_count, 2);
        assert_eq!(e2.reservation(a, 2).unwrap().amount_held, 100);
        let (due, _) = e2.due_candidates(60_001, 16);
        assert_eq!(due.len(), 2);
        assert!(due.contains(&a) && due.contains(&b));
    }

    #[test]
    fn replayed_events_match_runtime_outcome() {
        let mut live = eng();
        let id = auction(&mut live, 1, 100, 0);
        let created = live.listings[&id].clone();

        live.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        live.apply_bid(id, 3, 110, 2, 1, 20).unwrap();
        let ResolutionApply::SoldToBidder { record, item_id, quantity, .. } =
            live.resolve_due_listing(id, 60_001)
        else {
            panic!("expected sale");
        };

        let mut replayed = ExchangeState::new(0.05, 0.0);
        replayed.apply_event(&ExchangeEvent::ListingCreated { listing: created });
        replayed.apply_event(&ExchangeEvent::BidPlaced {
            listing_id: id,
            bidder_id: 2,
            amount: 100,
            prev_bidder: None,
            prev_amount: None,
            version: 2,
            at_ms: 10,
        });
        replayed.apply_event(&ExchangeEvent::BidPlaced {
            listing_id: id,
            bidder_id: 3,
            amount: 110,
            prev_bidder: Some(2),
            prev_amount: Some(100),
            version: 3,
            at_ms: 20,
        });
        replayed.apply_event(&ExchangeEvent::ListingSold {
            record: record.clone(),
            item_id,
            quantity,
            version: 4,
            won_by_bid: true,
        });

        assert_eq!(replayed.listings[&id].status, ListingStatus::Sold);
        assert_eq!(replayed.listings[&id].version, live.listings[&id].version);
        assert_eq!(
            replayed.reservation(id, 3).map(|e| e.state),
            Some(HoldState::PendingConsume)
        );
        assert_eq!(
            replayed.reservation(id, 2).map(|e| e.state),
            Some(HoldState::PendingRefund)
        );
        assert_eq!(replayed.tax_collected_total, live.tax_collected_total);
        assert_eq!(
            replayed.history.suggestion(7, 60_002).map(|s| s.sample_count),
            live.history.suggestion(7, 60_002).map(|s| s.sample_count)
        );
    }

    #[test]
    fn buyout_by_leading_bidder_refunds_their_own_hold() {
        let mut e = eng();
        let id = both(&mut e, 1, 100, 1000, 0);
        let created = e.listings[&id].clone();
        e.apply_bid(id, 2, 100, 1, 1, 10).unwrap();
        let BuyoutApply::Applied { record, refunds, new_version, .. } =
            e.apply_buyout(id, 2, 2, 20).unwrap()
        else {
            panic!("expected applied");
        };
        // The buyout price was charged separately; the earlier bid hold is owed back.
        assert_eq!(refunds, vec![(2, 100)]);
        assert_eq!(e.reservation(id, 2).unwrap().state, HoldState::PendingRefund);

        let mut replayed = ExchangeState::new(0.05, 0.0);
        replayed.apply_event(&ExchangeEvent::ListingCreated { listing: created });
        replayed.apply_event(&ExchangeEvent::BidPlaced {
            listing_id: id,
            bidder_id: 2,
            amount: 100,
            prev_bidder: None,
            prev_amount: None,
            version: 2,
            at_ms: 10,
        });
        replayed.apply_event(&ExchangeEvent::ListingSold {
            record,
            item_id: 7,
            quantity: 1,
            version: new_version,
            won_by_bid: false,
        });
        assert_eq!(
            replayed.reservation(id, 2).map(|e| e.state),
            Some(HoldState::PendingRefund)
        );
    }

    #[test]
    fn checked_cut_handles_extremes() {
        assert_eq!(checked_cut(1000, 50_000), Some(50));
        assert_eq!(checked_cut(0, 50_000), Some(0));
        assert_eq!(checked_cut(101, 50_000), Some(5));
        assert_eq!(checked_cut(i64::MAX, 999_999), Some(9_223_362_813_482_738_952));
        assert_eq!(checked_cut(-1, 50_000), None);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn accepted_raise_always_clears_floor_plus_increment(
                start in 1i64..10_000,
                ppm in 0i64..200_000,
                floor in 1i64..100,
                raise_by in 0i64..10_000,
            ) {
                let mut e = ExchangeState::new(0.0, 0.0);
                let id = e
                    .insert_listing(1, 7, 1, ListingType::Auction, None, Some(start), ppm, 60_000, 0, 0)
                    .id;
                e.apply_bid(id, 2, start, 1, floor, 1).unwrap();
                let min = e.listings[&id].min_accepted_bid(floor);
                let attempt = start + raise_by;
                match e.apply_bid(id, 3, attempt, 2, floor, 2) {
                    Ok(BidApply::Applied { new_current_bid, .. }) => {
                        prop_assert!(attempt >= min);
                        prop_assert_eq!(new_current_bid, attempt);
                    }
                    Ok(BidApply::StaleVersion { .. }) => prop_assert!(false, "no raced writer"),
                    Err(err) => {
                        prop_assert_eq!(err.code(), "bid_too_low");
                        prop_assert!(attempt < min);
                    }
                }
            }

            #[test]
            fn version_total_orders_accepted_bids(amounts in proptest::collection::vec(1i64..1_000_000, 1..40)) {
                let mut e = ExchangeState::new(0.0, 0.0);
                let id = e
                    .insert_listing(1, 7, 1, ListingType::Auction, None, Some(1), 50_000, 60_000, 0, 0)
                    .id;
                let mut version = 1u64;
                let mut accepted = 0usize;
                for (i, amount) in amounts.iter().enumerate() {
                    let bidder = 2 + (i as i64 % 5);
                    match e.apply_bid(id, bidder, *amount, version, 1, i as i64) {
                        Ok(BidApply::Applied { new_version, .. }) => {
                            prop_assert_eq!(new_version, version + 1);
                            version = new_version;
                            accepted += 1;
                        }
                        Ok(BidApply::StaleVersion { .. }) => prop_assert!(false, "single writer"),
                        Err(_) => {}
                    }
                }
                let l = &e.listings[&id];
                prop_assert_eq!(l.version, 1 + accepted as u64);
                prop_assert_eq!(l.bid_history.len(), accepted);
                // The leader's hold mirrors the current bid exactly.
                if let (Some(bidder), Some(cur)) = (l.current_bidder_id, l.current_bid) {
                    let hold = e.reservation(id, bidder).unwrap();
                    prop_assert_eq!(hold.amount_held, cur);
                    prop_assert_eq!(hold.state, HoldState::Held);
                    let max = l.bid_history.iter().map(|b| b.amount).max().unwrap();
                    prop_assert_eq!(cur, max);
                }
            }
        }
    }
}
