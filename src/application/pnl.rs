//! Bounded per-portfolio PnL history with throttled publishing.

use crate::domain::events::{EngineEvent, PnlSample};
use crate::domain::portfolio::Portfolio;
use crate::infrastructure::event_bus::EventBus;
use rust_decimal::Decimal;
use std::collections::VecDeque;

/// Ring buffer of PnL samples for one portfolio. The hedger pushes a sample
/// per evaluation; the tail since the last publish goes out on the bus at
/// most once per publish interval.
pub struct PnlTracker {
    portfolio_id: String,
    depth: usize,
    /// Balance at hedger start; realized PnL is measured against it.
    baseline_balance: Decimal,
    ring: VecDeque<PnlSample>,
    total_pushed: u64,
    published_through: u64,
}

impl PnlTracker {
    pub fn new(portfolio_id: impl Into<String>, depth: usize, baseline_balance: Decimal) -> Self {
        Self {
            portfolio_id: portfolio_id.into(),
            depth: depth.max(1),
            baseline_balance,
            ring: VecDeque::new(),
            total_pushed: 0,
            published_through: 0,
        }
    }

    /// Record one observation from the current portfolio state.
    pub fn observe(&mut self, portfolio: &Portfolio, net_delta: Decimal, ts_ms: i64) {
        let unrealized: Decimal = portfolio
            .legs()
            .filter(|leg| !leg.expired)
            .filter_map(|leg| {
                leg.last_mark
                    .map(|mark| leg.quantity * (mark - leg.avg_entry_price))
            })
            .sum();

        let sample = PnlSample {
            portfolio_id: self.portfolio_id.clone(),
            ts_ms,
            realized: portfolio.balance - self.baseline_balance,
            unrealized,
            net_delta,
        };

        if self.ring.len() == self.depth {
            self.ring.pop_front();
        }
        self.ring.push_back(sample);
        self.total_pushed += 1;
    }

    /// Publish the unpublished tail, if any. Call this no more often than the
    /// publish interval.
    pub fn publish(&mut self, bus: &EventBus) {
        let fresh = (self.total_pushed - self.published_through) as usize;
        if fresh == 0 {
            return;
        }
        let tail_len = fresh.min(self.ring.len());
        let history: Vec<PnlSample> = self
            .ring
            .iter()
            .skip(self.ring.len() - tail_len)
            .cloned()
            .collect();
        self.published_through = self.total_pushed;

        bus.publish(EngineEvent::PnlUpdate {
            id: self.portfolio_id.clone(),
            history,
        });
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::Instrument;
    use crate::domain::portfolio::LegPosition;
    use rust_decimal_macros::dec;

    fn portfolio_with_leg() -> Portfolio {
        let mut p = Portfolio::new("p1", "BTC", dec!(100100));
        let mut leg = LegPosition::new(
            Instrument::parse("BTC-26SEP25-30000-C").unwrap(),
            dec!(-10),
            dec!(1500),
        );
        leg.last_mark = Some(dec!(1400));
        p.upsert_leg(leg);
        p
    }

    #[test]
    fn observes_realized_and_unrealized() {
        let mut tracker = PnlTracker::new("p1", 8, dec!(100000));
        tracker.observe(&portfolio_with_leg(), dec!(-5), 1);

        assert_eq!(tracker.len(), 1);
        let sample = tracker.ring.back().unwrap();
        assert_eq!(sample.realized, dec!(100));
        // Short 10 at 1500, marked 1400: +1000 unrealized.
        assert_eq!(sample.unrealized, dec!(1000));
        assert_eq!(sample.net_delta, dec!(-5));
    }

    #[test]
    fn ring_is_bounded() {
        let mut tracker = PnlTracker::new("p1", 4, Decimal::ZERO);
        let p = portfolio_with_leg();
        for i in 0..10 {
            tracker.observe(&p, Decimal::ZERO, i);
        }
        assert_eq!(tracker.len(), 4);
        assert_eq!(tracker.ring.front().unwrap().ts_ms, 6);
    }

    #[tokio::test]
    async fn publish_sends_only_the_fresh_tail() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut tracker = PnlTracker::new("p1", 16, Decimal::ZERO);
        let p = portfolio_with_leg();

        tracker.observe(&p, Decimal::ZERO, 1);
        tracker.observe(&p, Decimal::ZERO, 2);
        tracker.publish(&bus);

        tracker.observe(&p, Decimal::ZERO, 3);
        tracker.publish(&bus);

        match rx.recv().await.unwrap() {
            EngineEvent::PnlUpdate { history, .. } => {
                assert_eq!(history.len(), 2);
                assert_eq!(history[1].ts_ms, 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
        match rx.recv().await.unwrap() {
            EngineEvent::PnlUpdate { history, .. } => {
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].ts_ms, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_fresh_samples_is_silent() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut tracker = PnlTracker::new("p1", 16, Decimal::ZERO);

        tracker.publish(&bus);
        assert!(rx.try_recv().is_err());
    }
}
