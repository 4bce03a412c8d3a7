//! End-to-end hedging scenarios driven through the mock venue.

use dneutral::application::hedging::{HedgerConfig, HedgingManager, StepMode};
use dneutral::domain::events::{EngineEvent, HedgerPhase};
use dneutral::domain::instrument::Instrument;
use dneutral::domain::portfolio::{LegPosition, Portfolio};
use dneutral::domain::ports::MarketTick;
use dneutral::domain::pricing::Black76Pricer;
use dneutral::domain::repositories::PortfolioStore;
use dneutral::infrastructure::exchange::{mock::ScriptedOutcome, MockExchange};
use dneutral::infrastructure::store::InMemoryPortfolioStore;
use dneutral::infrastructure::{EventBus, SubscriptionManager};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const CALL: &str = "BTC-27JUN31-30000-C";
const PERP: &str = "BTC-PERPETUAL";

struct Harness {
    venue: Arc<MockExchange>,
    store: Arc<dyn PortfolioStore>,
    manager: HedgingManager,
    bus: EventBus,
}

fn test_config() -> HedgerConfig {
    HedgerConfig {
        min_trigger_delta: dec!(0.01),
        step_mode: StepMode::Absolute,
        step_size: dec!(0.01),
        price_check_interval: Duration::from_millis(150),
        cooldown: Duration::from_millis(40),
        stop_timeout: Duration::from_millis(300),
        pnl_publish_interval: Duration::from_millis(100),
        ..HedgerConfig::default()
    }
}

async fn harness(cfg: HedgerConfig) -> Harness {
    let bus = EventBus::new();
    let venue = Arc::new(MockExchange::new());
    let store: Arc<dyn PortfolioStore> = Arc::new(InMemoryPortfolioStore::new(bus.clone()));
    let subs = Arc::new(SubscriptionManager::with_linger(
        venue.clone(),
        Duration::from_millis(50),
    ));
    let manager = HedgingManager::new(
        venue.clone(),
        Arc::clone(&store),
        subs,
        Arc::new(Black76Pricer),
        bus.clone(),
        cfg,
    );
    Harness {
        venue,
        store,
        manager,
        bus,
    }
}

async fn create_short_call_portfolio(h: &Harness, id: &str, qty: Decimal) {
    let mut portfolio = Portfolio::new(id, "BTC", dec!(100000));
    portfolio.upsert_leg(LegPosition::new(
        Instrument::parse(CALL).unwrap(),
        qty,
        dec!(1500),
    ));
    h.store.create(portfolio).await.unwrap();
}

fn option_tick(delta: Decimal, ts: i64) -> MarketTick {
    MarketTick {
        instrument: CALL.into(),
        mark_price: dec!(1500),
        index_price: dec!(30000),
        bid: Some(dec!(1490)),
        ask: Some(dec!(1510)),
        timestamp_ms: ts,
        delta: Some(delta),
        iv: Some(dec!(60)),
    }
}

fn perp_tick(ts: i64) -> MarketTick {
    MarketTick {
        instrument: PERP.into(),
        mark_price: dec!(30000),
        index_price: dec!(30000),
        bid: Some(dec!(29999)),
        ask: Some(dec!(30001)),
        timestamp_ms: ts,
        delta: None,
        iv: None,
    }
}

/// Poll until `check` passes or the deadline expires.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

async fn wait_subscribed(h: &Harness) {
    let venue = h.venue.clone();
    eventually("ticker subscriptions", || {
        let venue = venue.clone();
        async move {
            venue.subscribe_count(&format!("ticker.{PERP}")).await == 1
                && venue.subscribe_count(&format!("ticker.{CALL}")).await == 1
        }
    })
    .await;
}

// Scenario A: a single short call hedged with a long perp position.
#[tokio::test]
async fn short_call_gets_long_perp_hedge() {
    let h = harness(test_config()).await;
    create_short_call_portfolio(&h, "p1", dec!(-10)).await;

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    h.venue.push_tick(option_tick(dec!(0.5), 2)).await;

    let manager = &h.manager;
    eventually("hedge fill applied", || async {
        manager
            .get_hedger_stats("p1")
            .await
            .is_some_and(|s| s.fills == 1)
    })
    .await;

    let position = h.venue.venue_position(PERP).await.unwrap();
    assert_eq!(position.size, dec!(5));

    let stats = h.manager.get_hedger_stats("p1").await.unwrap();
    assert_eq!(stats.last_hedged_delta, Some(Decimal::ZERO));

    let portfolio = h.store.load("p1").await.unwrap();
    let hedge = portfolio.hedge_position.expect("hedge leg recorded");
    assert_eq!(hedge.quantity, dec!(5));
    assert_eq!(hedge.avg_entry_price, dec!(30000));
    // Bought 5 at 30000.
    assert_eq!(portfolio.balance, dec!(100000) - dec!(150000));

    h.manager.shutdown().await;
}

// Scenario B: hysteresis suppresses everything until a full step of drift.
#[tokio::test]
async fn hysteresis_band_fires_only_past_one_step() {
    let cfg = HedgerConfig {
        step_size: dec!(0.5),
        ..test_config()
    };
    let h = harness(cfg).await;
    create_short_call_portfolio(&h, "p1", dec!(1)).await;

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;
    h.venue.push_tick(perp_tick(1)).await;

    for (i, delta) in [dec!(0.3), dec!(-0.4), dec!(0.49)].iter().enumerate() {
        h.venue.push_tick(option_tick(*delta, 2 + i as i64)).await;
    }
    // Give the hedger time to (not) act on the sub-threshold deltas.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.venue.place_order_calls().await, 0);

    h.venue.push_tick(option_tick(dec!(0.51), 10)).await;

    let venue = h.venue.clone();
    eventually("single hedge order", || {
        let venue = venue.clone();
        async move { venue.order_count().await == 1 }
    })
    .await;
    assert_eq!(h.venue.place_order_calls().await, 1);

    let position = h.venue.venue_position(PERP).await.unwrap();
    assert_eq!(position.size, dec!(-0.51));

    h.manager.shutdown().await;
}

// Scenario C: a stalled market self-ticks without producing a hedge.
#[tokio::test]
async fn self_tick_on_stale_market_keeps_armed() {
    let cfg = HedgerConfig {
        min_trigger_delta: dec!(0.5),
        step_size: dec!(0.5),
        price_check_interval: Duration::from_millis(100),
        ..test_config()
    };
    let h = harness(cfg).await;
    create_short_call_portfolio(&h, "p1", dec!(1)).await;

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    h.venue.push_tick(option_tick(dec!(0.3), 2)).await;

    let manager = &h.manager;
    eventually("armed", || async {
        manager
            .get_hedger_stats("p1")
            .await
            .is_some_and(|s| s.phase == HedgerPhase::Armed)
    })
    .await;

    // Quiescence for over 2x the cadence: self-ticks fire, marks unchanged.
    tokio::time::sleep(Duration::from_millis(250)).await;

    let stats = h.manager.get_hedger_stats("p1").await.unwrap();
    assert_eq!(stats.phase, HedgerPhase::Armed);
    assert_eq!(stats.current_delta, Some(dec!(0.3)));
    assert_eq!(h.venue.place_order_calls().await, 0);

    h.manager.shutdown().await;
}

// Scenario D: retryable rejections retry with backoff, then the fill lands.
#[tokio::test]
async fn retryable_rejections_back_off_then_fill() {
    let h = harness(test_config()).await;
    create_short_call_portfolio(&h, "p1", dec!(-10)).await;

    for _ in 0..2 {
        h.venue
            .script_order(ScriptedOutcome::Reject {
                code: 10_041,
                message: "matching engine busy".into(),
            })
            .await;
    }

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    h.venue.push_tick(option_tick(dec!(0.5), 2)).await;

    let manager = &h.manager;
    eventually("fill after two rejections", || async {
        manager
            .get_hedger_stats("p1")
            .await
            .is_some_and(|s| s.fills == 1)
    })
    .await;

    // Three submissions total: two rejected, one filled.
    assert_eq!(h.venue.place_order_calls().await, 3);
    assert_eq!(
        h.venue.venue_position(PERP).await.map(|p| p.size),
        Some(dec!(5))
    );

    let stats = h.manager.get_hedger_stats("p1").await.unwrap();
    assert_eq!(stats.consecutive_errors, 0);
    assert_eq!(stats.errors, 2);

    h.manager.shutdown().await;
}

// A third consecutive retryable rejection fails the hedger for good.
#[tokio::test]
async fn three_rejections_fail_the_hedger() {
    let h = harness(test_config()).await;
    create_short_call_portfolio(&h, "p1", dec!(-10)).await;

    for _ in 0..3 {
        h.venue
            .script_order(ScriptedOutcome::Reject {
                code: 10_041,
                message: "matching engine busy".into(),
            })
            .await;
    }

    let mut events = h.bus.subscribe();
    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    h.venue.push_tick(option_tick(dec!(0.5), 2)).await;

    let manager = &h.manager;
    eventually("hedger failed", || async {
        manager
            .get_hedger_stats("p1")
            .await
            .is_some_and(|s| s.phase == HedgerPhase::Failed)
    })
    .await;

    // The failure reason reaches bus subscribers.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::HedgerStateChanged { to, reason, .. } = event {
            if to == HedgerPhase::Failed {
                assert!(reason.contains("busy"));
                saw_failed = true;
            }
        }
    }
    assert!(saw_failed);

    h.manager.shutdown().await;
}

// Scenario E: stop while an order is in flight; the post-stop reconciliation
// converges the store on venue truth.
#[tokio::test]
async fn stop_during_hedging_reconciles_after_stop() {
    let h = harness(test_config()).await;
    create_short_call_portfolio(&h, "p1", dec!(-10)).await;

    h.venue
        .script_order(ScriptedOutcome::Hang {
            order_reaches_venue: true,
        })
        .await;

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    h.venue.push_tick(option_tick(dec!(0.5), 2)).await;

    // Invariant: while the order hangs, the hedger is Hedging with the
    // pending label set.
    let manager = &h.manager;
    eventually("hedging with pending order", || async {
        manager.get_hedger_stats("p1").await.is_some_and(|s| {
            s.phase == HedgerPhase::Hedging && s.pending_order_label.is_some()
        })
    })
    .await;

    h.manager.stop_hedger("p1").await.unwrap();

    // The venue filled the order even though the response never came back;
    // the detached reconciliation task persists it.
    let store = Arc::clone(&h.store);
    eventually("post-stop fill reconciled", || {
        let store = Arc::clone(&store);
        async move {
            store
                .load("p1")
                .await
                .unwrap()
                .hedge_position
                .is_some_and(|hedge| hedge.quantity == dec!(5))
        }
    })
    .await;

    h.manager.shutdown().await;
}

// Orders below the notional floor are skipped entirely.
#[tokio::test]
async fn sub_notional_hedges_are_skipped() {
    let cfg = HedgerConfig {
        min_hedge_usd: dec!(1000),
        ..test_config()
    };
    let h = harness(cfg).await;
    create_short_call_portfolio(&h, "p1", dec!(1)).await;

    h.manager.start_hedger("p1", None).await.unwrap();
    wait_subscribed(&h).await;

    h.venue.push_tick(perp_tick(1)).await;
    // Delta 0.02 => 600 USD at 30000, below the 1000 USD floor.
    h.venue.push_tick(option_tick(dec!(0.02), 2)).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.venue.place_order_calls().await, 0);

    let stats = h.manager.get_hedger_stats("p1").await.unwrap();
    assert_eq!(stats.phase, HedgerPhase::Armed);

    h.manager.shutdown().await;
}
