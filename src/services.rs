use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::engine::{ItemId, ListingId, PlayerId};
use crate::error::ApiError;

/// Item custody collaborator. A production deployment points this at the
/// game's inventory backend; the vault below is the in-process reference.
#[async_trait]
pub(crate) trait InventoryService: Send + Sync {
    /// Move quantity out of the player's bags into exchange escrow.
    async fn escrow_in(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError>;
    /// Return escrowed quantity to its owner.
    async fn escrow_out(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError>;
    /// Deliver escrowed quantity to the buyer or winning bidder.
    async fn transfer_escrow(&self, to_player: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError>;
}

/// Currency collaborator. Reserve/release manage holds; settle_reserved is
/// the only primitive that moves money between players, so a debit can never
/// land without its matching credit.
#[async_trait]
pub(crate) trait CurrencyService: Send + Sync {
    /// Hold an additional `delta` against the player's spendable balance.
    async fn reserve(&self, player_id: PlayerId, delta: i64) -> Result<(), ApiError>;
    /// Give a held amount back to the player.
    async fn release(&self, player_id: PlayerId, amount: i64) -> Result<(), ApiError>;
    /// Grouped refunds, one call for the whole batch. Returns how many were applied.
    async fn release_batch(&self, refunds: &[(PlayerId, i64)]) -> Result<usize, ApiError>;
    /// Consume `gross` from the payer's held funds, credit `gross - tax` to
    /// the payee and retain `tax`, as one atomic unit.
    async fn settle_reserved(
        &self,
        from: PlayerId,
        to: PlayerId,
        gross: i64,
        tax: i64,
    ) -> Result<(), ApiError>;
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Notice {
    Outbid { listing_id: ListingId, item_id: ItemId, new_bid: i64 },
    AuctionWon { listing_id: ListingId, item_id: ItemId, price: i64 },
    ItemSold { listing_id: ListingId, item_id: ItemId, net: i64 },
    ListingExpired { listing_id: ListingId, item_id: ItemId },
}

impl Notice {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Notice::Outbid { .. } => "outbid",
            Notice::AuctionWon { .. } => "auction_won",
            Notice::ItemSold { .. } => "item_sold",
            Notice::ListingExpired { .. } => "listing_expired",
        }
    }

    pub(crate) fn listing_id(&self) -> ListingId {
        match self {
            Notice::Outbid { listing_id, .. }
            | Notice::AuctionWon { listing_id, .. }
            | Notice::ItemSold { listing_id, .. }
            | Notice::ListingExpired { listing_id, .. } => *listing_id,
        }
    }
}

/// Fire-and-forget alerts. Never load-bearing for correctness.
#[async_trait]
pub(crate) trait NotificationService: Send + Sync {
    async fn notify(&self, player_id: PlayerId, notice: Notice);
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GoldAccount {
    pub(crate) total: i64,
    pub(crate) reserved: i64,
}

impl GoldAccount {
    pub(crate) fn available(&self) -> i64 {
        self.total - self.reserved
    }
}

#[derive(Debug, Default)]
struct CurrencyAccounts {
    accounts: HashMap<PlayerId, GoldAccount>,
    tax_pool: i64,
}

/// In-process currency vault. One mutex spans every account so a settle is
/// a single atomic unit, mirroring what the remote service guarantees.
#[derive(Debug, Default)]
pub(crate) struct VaultCurrency {
    inner: Mutex<CurrencyAccounts>,
}

impl VaultCurrency {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn grant(&self, player_id: PlayerId, amount: i64) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.accounts.entry(player_id).or_default().total += amount;
    }

    pub(crate) fn account(&self, player_id: PlayerId) -> GoldAccount {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.accounts.get(&player_id).copied().unwrap_or_default()
    }

    pub(crate) fn tax_pool(&self) -> i64 {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.tax_pool
    }
}

#[async_trait]
impl CurrencyService for VaultCurrency {
    async fn reserve(&self, player_id: PlayerId, delta: i64) -> Result<(), ApiError> {
        if delta < 0 {
            return Err(ApiError::internal("negative_reserve_delta"));
        }
        if delta == 0 {
            return Ok(());
        }
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let acct = g.accounts.entry(player_id).or_default();
        if acct.available() < delta {
            return Err(ApiError::insufficient_funds(format!(
                "insufficient_funds: need {delta} more, {} available",
                acct.available()
            )));
        }
        acct.reserved += delta;
        Ok(())
    }

    async fn release(&self, player_id: PlayerId, amount: i64) -> Result<(), ApiError> {
        if amount <= 0 {
            return Ok(());
        }
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let acct = g.accounts.entry(player_id).or_default();
        acct.reserved = (acct.reserved - amount).max(0);
        Ok(())
    }

    async fn release_batch(&self, refunds: &[(PlayerId, i64)]) -> Result<usize, ApiError> {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut applied = 0usize;
        for (player_id, amount) in refunds {
            if *amount <= 0 {
                continue;
            }
            let acct = g.accounts.entry(*player_id).or_default();
            acct.reserved = (acct.reserved - amount).max(0);
            applied += 1;
        }
        Ok(applied)
    }

    async fn settle_reserved(
        &self,
        from: PlayerId,
        to: PlayerId,
        gross: i64,
        tax: i64,
    ) -> Result<(), ApiError> {
        if gross < 0 || tax < 0 || tax > gross {
            return Err(ApiError::internal("settle_amounts_invalid"));
        }
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let payer = g.accounts.entry(from).or_default();
        if payer.reserved < gross {
            // Hold drifted from the ledger; keep the debit whole and loud.
            eprintln!(
                "[currency] reserve_short player={} reserved={} gross={}",
                from, payer.reserved, gross
            );
        }
        payer.reserved = (payer.reserved - gross).max(0);
        payer.total -= gross;
        g.accounts.entry(to).or_default().total += gross - tax;
        g.tax_pool += tax;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct InventoryAccounts {
    bags: HashMap<(PlayerId, ItemId), i64>,
    escrow: HashMap<ItemId, i64>,
}

/// In-process item vault with a pooled escrow per item.
#[derive(Debug, Default)]
pub(crate) struct VaultInventory {
    inner: Mutex<InventoryAccounts>,
}

impl VaultInventory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn grant(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *g.bags.entry((player_id, item_id)).or_insert(0) += quantity;
    }

    pub(crate) fn bag_count(&self, player_id: PlayerId, item_id: ItemId) -> i64 {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.bags.get(&(player_id, item_id)).copied().unwrap_or(0)
    }

    pub(crate) fn escrow_count(&self, item_id: ItemId) -> i64 {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.escrow.get(&item_id).copied().unwrap_or(0)
    }

    fn escrow_to_player(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError> {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let pool = g.escrow.entry(item_id).or_insert(0);
        if *pool < quantity {
            return Err(ApiError::internal(format!(
                "escrow_underflow: item {item_id} has {pool}, asked {quantity}"
            )));
        }
        *pool -= quantity;
        *g.bags.entry((player_id, item_id)).or_insert(0) += quantity;
        Ok(())
    }
}

#[async_trait]
impl InventoryService for VaultInventory {
    async fn escrow_in(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError> {
        if quantity <= 0 {
            return Err(ApiError::validation("quantity_invalid"));
        }
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let have = g.bags.entry((player_id, item_id)).or_insert(0);
        if *have < quantity {
            return Err(ApiError::insufficient_inventory(format!(
                "insufficient_inventory: have {have}, need {quantity}"
            )));
        }
        *have -= quantity;
        *g.escrow.entry(item_id).or_insert(0) += quantity;
        Ok(())
    }

    async fn escrow_out(&self, player_id: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError> {
        self.escrow_to_player(player_id, item_id, quantity)
    }

    async fn transfer_escrow(&self, to_player: PlayerId, item_id: ItemId, quantity: i64) -> Result<(), ApiError> {
        self.escrow_to_player(to_player, item_id, quantity)
    }
}

/// Default notifier: a telemetry line per alert.
#[derive(Debug, Default)]
pub(crate) struct LogNotifier;

#[async_trait]
impl NotificationService for LogNotifier {
    async fn notify(&self, player_id: PlayerId, notice: Notice) {
        eprintln!(
            "[notify] player={} kind={} listing={}",
            player_id,
            notice.kind(),
            notice.listing_id()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_rejects_over_available() {
        let c = VaultCurrency::new();
        c.grant(1, 100);
        c.reserve(1, 60).await.unwrap();
        let err = c.reserve(1, 50).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_funds");
        // The failed call held nothing.
        assert_eq!(c.account(1).reserved, 60);
    }

    #[tokio::test]
    async fn incremental_reserve_charges_only_the_delta() {
        let c = VaultCurrency::new();
        c.grant(1, 130);
        c.reserve(1, 100).await.unwrap();
        // Raising a 100 bid to 120 needs only 20 more.
        c.reserve(1, 20).await.unwrap();
        assert_eq!(c.account(1).reserved, 120);
        assert_eq!(c.account(1).available(), 10);
    }

    #[tokio::test]
    async fn release_restores_available() {
        let c = VaultCurrency::new();
        c.grant(1, 100);
        c.reserve(1, 80).await.unwrap();
        c.release(1, 80).await.unwrap();
        assert_eq!(c.account(1).available(), 100);
        // Over-release clamps instead of going negative.
        c.release(1, 10).await.unwrap();
        assert_eq!(c.account(1).reserved, 0);
    }

    #[tokio::test]
    async fn settle_moves_both_sides_in_one_unit() {
        let c = VaultCurrency::new();
        c.grant(1, 500);
        c.reserve(1, 200).await.unwrap();
        c.settle_reserved(1, 2, 200, 10).await.unwrap();
        assert_eq!(c.account(1).total, 300);
        assert_eq!(c.account(1).reserved, 0);
        assert_eq!(c.account(2).total, 190);
        assert_eq!(c.tax_pool(), 10);
        // Nothing minted, nothing burned.
        assert_eq!(c.account(1).total + c.account(2).total + c.tax_pool(), 500);
    }

    #[tokio::test]
    async fn settle_rejects_inverted_amounts() {
        let c = VaultCurrency::new();
        assert!(c.settle_reserved(1, 2, 100, 200).await.is_err());
        assert!(c.settle_reserved(1, 2, -5, 0).await.is_err());
    }

    #[tokio::test]
    async fn batch_release_refunds_every_bidder() {
        let c = VaultCurrency::new();
        for p in 1..=3 {
            c.grant(p, 100);
            c.reserve(p, 50).await.unwrap();
        }
        let n = c.release_batch(&[(1, 50), (2, 50), (3, 50)]).await.unwrap();
        assert_eq!(n, 3);
        for p in 1..=3 {
            assert_eq!(c.account(p).available(), 100);
        }
    }

    #[tokio::test]
    async fn escrow_requires_owned_quantity() {
        let inv = VaultInventory::new();
        inv.grant(1, 7, 2);
        let err = inv.escrow_in(1, 7, 3).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_inventory");
        inv.escrow_in(1, 7, 2).await.unwrap();
        assert_eq!(inv.bag_count(1, 7), 0);
        assert_eq!(inv.escrow_count(7), 2);
    }

    #[tokio::test]
    async fn escrow_returns_and_transfers() {
        let inv = VaultInventory::new();
        inv.grant(1, 7, 5);
        inv.escrow_in(1, 7, 5).await.unwrap();
        inv.escrow_out(1, 7, 2).await.unwrap();
        inv.transfer_escrow(2, 7, 3).await.unwrap();
        assert_eq!(inv.bag_count(1, 7), 2);
        assert_eq!(inv.bag_count(2, 7), 3);
        assert_eq!(inv.escrow_count(7), 0);
        // Escrow can never go negative.
        assert!(inv.transfer_escrow(2, 7, 1).await.is_err());
    }
}
