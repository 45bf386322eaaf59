use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::engine::ItemId;

pub(crate) const SALE_WINDOW_CAP: usize = 100;
pub(crate) const DAY_BUCKET_CAP: usize = 60;
pub(crate) const MS_PER_DAY: i64 = 86_400_000;
/// Sample count at which confidence saturates.
pub(crate) const CONFIDENCE_TARGET: f64 = 25.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct SaleSample {
    pub(crate) unit_price: i64,
    pub(crate) quantity: i64,
    pub(crate) total_price: i64,
    pub(crate) at_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct DayBucket {
    /// Days since epoch.
    pub(crate) day: i64,
    pub(crate) sales_count: i64,
    pub(crate) quantity: i64,
    pub(crate) total_value: i64,
    pub(crate) min_unit: i64,
    pub(crate) max_unit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PriceSuggestion {
    pub(crate) suggested: i64,
    pub(crate) confidence: f64,
    pub(crate) trend_24h: Option<f64>,
    pub(crate) trend_7d: Option<f64>,
    pub(crate) trend_30d: Option<f64>,
    pub(crate) sample_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ItemHistory {
    /// Newest at the back; evicted from the front past the cap.
    window: VecDeque<SaleSample>,
    /// Ascending by day.
    buckets: VecDeque<DayBucket>,
}

impl ItemHistory {
    fn record(&mut self, sample: SaleSample) {
        self.window.push_back(sample);
        while self.window.len() > SALE_WINDOW_CAP {
            let _ = self.window.pop_front();
        }

        let day = sample.at_ms.div_euclid(MS_PER_DAY);
        match self.buckets.iter().position(|b| b.day >= day) {
            Some(idx) if self.buckets[idx].day == day => {
                let b = &mut self.buckets[idx];
                b.sales_count += 1;
                b.quantity += sample.quantity;
                b.total_value += sample.total_price;
                b.min_unit = b.min_unit.min(sample.unit_price);
                b.max_unit = b.max_unit.max(sample.unit_price);
            }
            Some(idx) => self.buckets.insert(idx, Self::fresh_bucket(day, &sample)),
            None => self.buckets.push_back(Self::fresh_bucket(day, &sample)),
        }
        while self.buckets.len() > DAY_BUCKET_CAP {
            let _ = self.buckets.pop_front();
        }
    }

    fn fresh_bucket(day: i64, sample: &SaleSample) -> DayBucket {
        DayBucket {
            day,
            sales_count: 1,
            quantity: sample.quantity,
            total_value: sample.total_price,
            min_unit: sample.unit_price,
            max_unit: sample.unit_price,
        }
    }

    /// Volume-weighted mean unit price over a half-open day range.
    fn vwap_over_days(&self, from_day: i64, to_day: i64) -> Option<f64> {
        let mut qty = 0i64;
        let mut value = 0i64;
        for b in &self.buckets {
            if b.day > from_day && b.day <= to_day {
                qty += b.quantity;
                value += b.total_value;
            }
        }
        if qty <= 0 {
            return None;
        }
        Some(value as f64 / qty as f64)
    }

    fn trend(&self, now_ms: i64, days: i64) -> Option<f64> {
        let today = now_ms.div_euclid(MS_PER_DAY);
        let recent = self.vwap_over_days(today - days, today)?;
        let prior = self.vwap_over_days(today - 2 * days, today - days)?;
        if prior <= 0.0 {
            return None;
        }
        Some((recent - prior) / prior * 100.0)
    }

    fn suggestion(&self, now_ms: i64) -> Option<PriceSuggestion> {
        let mut qty = 0i64;
        let mut value = 0i64;
        for s in &self.window {
            qty += s.quantity;
            value += s.total_price;
        }
        if qty <= 0 {
            return None;
        }
        let suggested = ((value as f64 / qty as f64).round() as i64).max(1);
        let n = self.window.len();
        let confidence = (n as f64 / CONFIDENCE_TARGET).min(1.0);
        Some(PriceSuggestion {
            suggested,
            confidence,
            trend_24h: self.trend(now_ms, 1),
            trend_7d: self.trend(now_ms, 7),
            trend_30d: self.trend(now_ms, 30),
            sample_count: n,
        })
    }
}

/// Rolling per-item sale statistics. Fed only by settlement; reads derive
/// everything from the bounded window and day buckets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct PriceHistory {
    items: HashMap<ItemId, ItemHistory>,
}

impl PriceHistory {
    pub(crate) fn new() -> Self {
        Self { items: HashMap::new() }
    }

    pub(crate) fn record_sale(&mut self, item_id: ItemId, total_price: i64, quantity: i64, at_ms: i64) {
        if total_price <= 0 || quantity <= 0 {
            return;
        }
        let unit_price = (total_price / quantity).max(1);
        let sample = SaleSample { unit_price, quantity, total_price, at_ms };
        self.items.entry(item_id).or_default().record(sample);
    }

    pub(crate) fn suggestion(&self, item_id: ItemId, now_ms: i64) -> Option<PriceSuggestion> {
        self.items.get(&item_id)?.suggestion(now_ms)
    }

    pub(crate) fn day_buckets(&self, item_id: ItemId) -> Vec<DayBucket> {
        self.items
            .get(&item_id)
            .map(|h| h.buckets.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn tracked_items(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day_ms(day: i64) -> i64 {
        day * MS_PER_DAY + 1000
    }

    #[test]
    fn window_caps_at_last_hundred_sales() {
        let mut h = PriceHistory::new();
        for i in 0..150 {
            h.record_sale(1, 100 + i, 1, day_ms(0) + i);
        }
        let s = h.suggestion(1, day_ms(0)).unwrap();
        assert_eq!(s.sample_count, SALE_WINDOW_CAP);
        // Oldest fifty evicted: mean over 150..=249 is 199.5, rounded up.
        assert_eq!(s.suggested, 200);
    }

    #[test]
    fn suggestion_is_volume_weighted() {
        let mut h = PriceHistory::new();
        // 10 units at 10 each, 1 unit at 120.
        h.record_sale(1, 100, 10, day_ms(0));
        h.record_sale(1, 120, 1, day_ms(0) + 1);
        let s = h.suggestion(1, day_ms(0) + 2).unwrap();
        assert_eq!(s.suggested, 20); // (100 + 120) / 11 = 20
        assert_eq!(s.sample_count, 2);
    }

    #[test]
    fn confidence_grows_with_samples_and_caps() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 100, 1, day_ms(0));
        let low = h.suggestion(1, day_ms(0)).unwrap().confidence;
        for i in 0..10 {
            h.record_sale(1, 100, 1, day_ms(0) + i);
        }
        let mid = h.suggestion(1, day_ms(0)).unwrap().confidence;
        for i in 0..40 {
            h.record_sale(1, 100, 1, day_ms(0) + 20 + i);
        }
        let high = h.suggestion(1, day_ms(0)).unwrap().confidence;
        assert!(low < mid && mid < high);
        assert_eq!(high, 1.0);
    }

    #[test]
    fn trends_null_until_prior_period_has_sales() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 100, 1, day_ms(10));
        let s = h.suggestion(1, day_ms(10)).unwrap();
        assert!(s.trend_24h.is_none());
        assert!(s.trend_7d.is_none());
        assert!(s.trend_30d.is_none());
    }

    #[test]
    fn rising_prices_produce_positive_trend() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 100, 1, day_ms(9));
        h.record_sale(1, 150, 1, day_ms(10));
        let s = h.suggestion(1, day_ms(10)).unwrap();
        let t = s.trend_24h.unwrap();
        assert!((t - 50.0).abs() < 1e-9, "trend was {t}");
        // Week over week: days 4..=10 vs days -3..=3.
        assert!(s.trend_7d.is_none());
        h.record_sale(1, 100, 1, day_ms(2));
        let s = h.suggestion(1, day_ms(10)).unwrap();
        let wk = s.trend_7d.unwrap();
        assert!(wk > 0.0);
    }

    #[test]
    fn falling_prices_produce_negative_trend() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 200, 1, day_ms(9));
        h.record_sale(1, 100, 1, day_ms(10));
        let s = h.suggestion(1, day_ms(10)).unwrap();
        assert!(s.trend_24h.unwrap() < 0.0);
    }

    #[test]
    fn same_day_sales_share_a_bucket() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 100, 1, day_ms(5));
        h.record_sale(1, 300, 2, day_ms(5) + 500);
        let buckets = h.day_buckets(1);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].sales_count, 2);
        assert_eq!(buckets[0].quantity, 3);
        assert_eq!(buckets[0].total_value, 400);
        assert_eq!(buckets[0].min_unit, 100);
        assert_eq!(buckets[0].max_unit, 150);
    }

    #[test]
    fn buckets_evict_beyond_cap() {
        let mut h = PriceHistory::new();
        for d in 0..(DAY_BUCKET_CAP as i64 + 10) {
            h.record_sale(1, 100, 1, day_ms(d));
        }
        let buckets = h.day_buckets(1);
        assert_eq!(buckets.len(), DAY_BUCKET_CAP);
        assert_eq!(buckets.first().unwrap().day, 10);
    }

    #[test]
    fn out_of_order_sale_lands_in_its_day() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 100, 1, day_ms(5));
        h.record_sale(1, 100, 1, day_ms(3));
        let buckets = h.day_buckets(1);
        assert_eq!(buckets.iter().map(|b| b.day).collect::<Vec<_>>(), vec![3, 5]);
    }

    #[test]
    fn degenerate_inputs_are_ignored() {
        let mut h = PriceHistory::new();
        h.record_sale(1, 0, 1, day_ms(0));
        h.record_sale(1, 100, 0, day_ms(0));
        h.record_sale(1, -5, 1, day_ms(0));
        assert!(h.suggestion(1, day_ms(0)).is_none());
        assert_eq!(h.tracked_items(), 0);
    }
}
