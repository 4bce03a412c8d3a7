//! The per-portfolio hedging state machine.
//!
//! One task per portfolio, driven by a `select!` over the tick streams, the
//! self-tick cadence, the cooldown timer, the connection epoch and the stop
//! signal. Tick processing, trigger evaluation, order submission and state
//! update are strictly sequential within one hedger.

use crate::application::hedging::config::HedgerConfig;
use crate::application::hedging::delta;
use crate::application::hedging::manager::ManagerHandle;
use crate::application::pnl::PnlTracker;
use crate::domain::errors::{ExchangeError, HedgeError, StoreError};
use crate::domain::events::HedgerPhase;
use crate::domain::instrument::{Instrument, InstrumentSpec};
use crate::domain::portfolio::{LegPosition, Portfolio};
use crate::domain::ports::{
    settlements_channel, ticker_channel, ExchangeApi, MarketTick, OrderAck, OrderKind,
    OrderRequest, OrderSide, OrderStatus, SettlementEvent, StreamEvent,
};
use crate::domain::pricing::Pricer;
use crate::domain::repositories::PortfolioStore;
use crate::infrastructure::subscriptions::{MarketStream, StreamMessage, SubscriptionManager};
use chrono::Utc;
use futures::future::select_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ORDER_RETRY_BASE: Duration = Duration::from_millis(250);
/// Transport retries per order beyond the first attempt, backing off
/// 250 ms * 2^k.
const MAX_ORDER_RETRIES: u32 = 5;
const MAX_CONSECUTIVE_REJECTS: u32 = 3;
const STORE_RETRIES: u32 = 3;
/// Post-stop reconciliation polls for an order whose outcome was unknown at
/// stop time.
const POST_STOP_POLLS: u32 = 10;
const POST_STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Snapshot of a hedger's observable state, polled by the manager.
#[derive(Debug, Clone)]
pub struct HedgerStats {
    pub phase: HedgerPhase,
    pub current_delta: Option<Decimal>,
    pub last_hedged_delta: Option<Decimal>,
    pub pending_order_label: Option<String>,
    pub last_tick_ts: Option<i64>,
    pub orders_sent: u64,
    pub fills: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
}

impl Default for HedgerStats {
    fn default() -> Self {
        Self {
            phase: HedgerPhase::Idle,
            current_delta: None,
            last_hedged_delta: None,
            pending_order_label: None,
            last_tick_ts: None,
            orders_sent: 0,
            fills: 0,
            errors: 0,
            consecutive_errors: 0,
            last_error: None,
        }
    }
}

enum Wake {
    Stop,
    Epoch,
    Message(usize, Option<StreamMessage>),
    SelfTick,
    CooldownDone,
    PublishPnl,
}

enum HedgeOutcome {
    /// A fill was applied; enter cooldown.
    Applied,
    /// No fill; back to Armed, re-evaluate on the next tick.
    Abandoned,
}

pub struct DynamicDeltaHedger {
    portfolio_id: String,
    cfg: HedgerConfig,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn PortfolioStore>,
    subs: Arc<SubscriptionManager>,
    pricer: Arc<dyn Pricer>,
    manager: ManagerHandle,
    stats: Arc<RwLock<HedgerStats>>,
    stop_rx: watch::Receiver<bool>,

    phase: HedgerPhase,
    hedge_name: String,
    index_price: Option<Decimal>,
    hedge_mark: Option<Decimal>,
    last_hedged_delta: Decimal,
    seq: u64,
    consecutive_rejects: u32,
}

impl DynamicDeltaHedger {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        portfolio_id: String,
        cfg: HedgerConfig,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn PortfolioStore>,
        subs: Arc<SubscriptionManager>,
        pricer: Arc<dyn Pricer>,
        manager: ManagerHandle,
        stats: Arc<RwLock<HedgerStats>>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        let last_hedged_delta = cfg.target_delta;
        // Labels must stay unique across hedger restarts for idempotency to
        // hold venue-side.
        let seq = Utc::now().timestamp_millis() as u64;
        Self {
            portfolio_id,
            cfg,
            exchange,
            store,
            subs,
            pricer,
            manager,
            stats,
            stop_rx,
            phase: HedgerPhase::Idle,
            hedge_name: String::new(),
            index_price: None,
            hedge_mark: None,
            last_hedged_delta,
            seq,
            consecutive_rejects: 0,
        }
    }

    pub async fn run(mut self) {
        self.transition(HedgerPhase::Warming, "started").await;

        match self.drive().await {
            Ok(()) => {
                self.transition(HedgerPhase::Stopped, "stop requested").await;
            }
            Err(e) => {
                self.record_error(&e.to_string()).await;
                self.transition(HedgerPhase::Failed, &e.to_string()).await;
            }
        }
    }

    async fn drive(&mut self) -> Result<(), HedgeError> {
        let mut portfolio = self.load_portfolio_with_retry().await?;

        self.hedge_name = self.cfg.hedge_instrument.resolve(&portfolio.underlying);
        let hedge_instrument = Instrument::parse(&self.hedge_name)
            .map_err(HedgeError::InvariantViolation)?;
        let hedge_spec = match self.exchange.get_instrument(&self.hedge_name).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!("instrument lookup for {} failed: {e}; using defaults", self.hedge_name);
                InstrumentSpec::defaults_for(&hedge_instrument)
            }
        };

        // Converge on venue truth before leaving Warming.
        self.probe_expired_legs(&mut portfolio).await?;
        self.reconcile_hedge_position(&mut portfolio, &hedge_instrument)
            .await?;
        match self.exchange.get_account_summary(&portfolio.underlying).await {
            Ok(summary) => info!(
                portfolio = %self.portfolio_id,
                equity = %summary.equity,
                "account summary at start"
            ),
            Err(e) => warn!("account summary unavailable: {e}"),
        }

        let mut streams = Vec::new();
        let mut channels = vec![settlements_channel(&portfolio.underlying)];
        channels.extend(
            portfolio
                .subscribed_instruments(&self.hedge_name)
                .iter()
                .map(|inst| ticker_channel(inst)),
        );
        for channel in channels {
            match self.subs.acquire(&channel).await {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    for acquired in streams.drain(..) {
                        self.subs.release(acquired).await;
                    }
                    return Err(e.into());
                }
            }
        }

        let result = self
            .event_loop(&mut portfolio, &hedge_instrument, &hedge_spec, &mut streams)
            .await;

        for stream in streams.drain(..) {
            self.subs.release(stream).await;
        }
        if let Err(e) = self.persist_marks(&portfolio).await {
            warn!("final mark persist failed: {e}");
        }
        result
    }

    async fn event_loop(
        &mut self,
        portfolio: &mut Portfolio,
        hedge_instrument: &Instrument,
        hedge_spec: &InstrumentSpec,
        streams: &mut Vec<MarketStream>,
    ) -> Result<(), HedgeError> {
        let mut pnl = PnlTracker::new(&self.portfolio_id, self.cfg.pnl_depth, portfolio.balance);
        let mut stop_rx = self.stop_rx.clone();
        let mut epoch_rx = self.exchange.connection_epoch();
        epoch_rx.borrow_and_update();

        let mut pnl_timer = tokio::time::interval(self.cfg.pnl_publish_interval);
        pnl_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut cooldown_until: Option<Instant> = None;
        let mut next_self_tick = Instant::now() + self.cfg.price_check_interval;

        loop {
            if *stop_rx.borrow() {
                return Ok(());
            }

            let wake = {
                let cooldown_timer = async {
                    match cooldown_until {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = stop_rx.changed() => Wake::Stop,
                    _ = epoch_rx.changed() => Wake::Epoch,
                    (index, message) = next_any(streams) => Wake::Message(index, message),
                    _ = tokio::time::sleep_until(next_self_tick) => Wake::SelfTick,
                    _ = cooldown_timer => Wake::CooldownDone,
                    _ = pnl_timer.tick() => Wake::PublishPnl,
                }
            };

            let mut evaluate = false;
            match wake {
                Wake::Stop => return Ok(()),
                Wake::Epoch => {
                    info!(portfolio = %self.portfolio_id, "reconnect observed; reconciling");
                    self.reconcile_hedge_position(portfolio, hedge_instrument)
                        .await?;
                    evaluate = true;
                }
                Wake::Message(index, None) => {
                    // Upstream channel closed for good; drop the dead stream
                    // so the select does not spin on it.
                    let dead = streams.swap_remove(index);
                    self.subs.release(dead).await;
                    if streams.is_empty() {
                        return Err(HedgeError::StaleMarket {
                            instrument: self.hedge_name.clone(),
                        });
                    }
                }
                Wake::Message(_, Some(StreamMessage::Stale { missed })) => {
                    warn!(
                        portfolio = %self.portfolio_id,
                        missed, "consumer lagged; marks are stale"
                    );
                }
                Wake::Message(_, Some(StreamMessage::Event(StreamEvent::Tick(tick)))) => {
                    self.apply_tick(portfolio, &tick).await;
                    next_self_tick = Instant::now() + self.cfg.price_check_interval;
                    evaluate = true;
                }
                Wake::Message(_, Some(StreamMessage::Event(StreamEvent::Settlement(s)))) => {
                    self.apply_settlement(portfolio, &s).await?;
                }
                Wake::SelfTick => {
                    debug!(portfolio = %self.portfolio_id, "self-tick");
                    next_self_tick = Instant::now() + self.cfg.price_check_interval;
                    evaluate = true;
                }
                Wake::CooldownDone => {
                    cooldown_until = None;
                    if self.phase == HedgerPhase::Cooldown {
                        self.transition(HedgerPhase::Armed, "cooldown elapsed").await;
                    }
                    evaluate = true;
                }
                Wake::PublishPnl => {
                    pnl.publish(self.manager.bus());
                }
            }

            if !evaluate {
                continue;
            }

            self.mark_expired_legs(portfolio).await?;

            let now = Utc::now();
            let net = delta::net_delta(
                portfolio,
                hedge_spec,
                self.pricer.as_ref(),
                self.index_price,
                now,
            );
            {
                let mut stats = self.stats.write().await;
                stats.current_delta = net;
            }
            let Some(net) = net else { continue };
            pnl.observe(portfolio, net, now.timestamp_millis());

            if self.phase == HedgerPhase::Warming {
                self.transition(HedgerPhase::Armed, "all legs priced").await;
            }
            if self.phase != HedgerPhase::Armed || cooldown_until.is_some() {
                continue;
            }

            let Some(index) = self.index_price else { continue };
            let step = delta::step_value(&self.cfg, portfolio, index);
            if !delta::should_hedge(&self.cfg, net, self.last_hedged_delta, step) {
                continue;
            }
            let gap = net - self.cfg.target_delta;
            let Some((side, qty)) =
                delta::hedge_order(gap, hedge_spec, index, self.cfg.min_hedge_usd)
            else {
                debug!(portfolio = %self.portfolio_id, %gap, "hedge below lot or notional floor");
                continue;
            };

            match self
                .execute_hedge(portfolio, hedge_instrument, hedge_spec, net, side, qty)
                .await?
            {
                HedgeOutcome::Applied => {
                    cooldown_until = Some(Instant::now() + self.cfg.cooldown);
                }
                HedgeOutcome::Abandoned => {
                    if self.phase == HedgerPhase::Hedging {
                        self.transition(HedgerPhase::Armed, "order abandoned").await;
                    }
                }
            }
        }
    }

    /// Submit one hedge order, retrying transient failures with exponential
    /// backoff, honoring the stop signal on the in-flight order.
    async fn execute_hedge(
        &mut self,
        portfolio: &mut Portfolio,
        hedge_instrument: &Instrument,
        hedge_spec: &InstrumentSpec,
        net_at_send: Decimal,
        side: OrderSide,
        qty: Decimal,
    ) -> Result<HedgeOutcome, HedgeError> {
        self.seq += 1;
        let label = format!("h:{}:{}", self.portfolio_id, self.seq);
        let request = OrderRequest {
            instrument: self.hedge_name.clone(),
            side,
            quantity: qty,
            kind: OrderKind::Market,
            reduce_only: false,
            label: label.clone(),
        };

        {
            let mut stats = self.stats.write().await;
            stats.pending_order_label = Some(label.clone());
            stats.orders_sent += 1;
        }
        self.transition(HedgerPhase::Hedging, &format!("{side} {qty} {}", self.hedge_name))
            .await;

        let mut stop_rx = self.stop_rx.clone();
        let mut attempt: u32 = 0;
        let ack: Option<OrderAck> = loop {
            if attempt > 0 {
                tokio::time::sleep(ORDER_RETRY_BASE * 2u32.pow(attempt - 1)).await;
            }

            let exchange = Arc::clone(&self.exchange);
            let req = request.clone();
            let mut order_fut = Box::pin(async move { exchange.place_order(req).await });

            let result = if *stop_rx.borrow() {
                // Already stopping: give the in-flight order its grace
                // period, no more.
                match tokio::time::timeout(self.cfg.stop_timeout, &mut order_fut).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.spawn_post_stop_reconcile(label.clone(), hedge_spec.is_inverse);
                        break None;
                    }
                }
            } else {
                tokio::select! {
                    result = &mut order_fut => result,
                    _ = stop_rx.changed() => {
                        match tokio::time::timeout(self.cfg.stop_timeout, &mut order_fut).await {
                            Ok(result) => result,
                            Err(_) => {
                                self.spawn_post_stop_reconcile(label.clone(), hedge_spec.is_inverse);
                                break None;
                            }
                        }
                    }
                }
            };

            match result {
                Ok(ack) => break Some(ack),
                Err(e) => {
                    self.record_error(&e.to_string()).await;
                    let rejected = matches!(e, ExchangeError::Rejected { .. });
                    if rejected {
                        self.consecutive_rejects += 1;
                        let mut stats = self.stats.write().await;
                        stats.consecutive_errors = self.consecutive_rejects;
                    }
                    if !e.is_retryable() || self.consecutive_rejects >= MAX_CONSECUTIVE_REJECTS {
                        self.stats.write().await.pending_order_label = None;
                        return Err(e.into());
                    }
                    if *stop_rx.borrow() {
                        break None;
                    }
                    attempt += 1;
                    if attempt > MAX_ORDER_RETRIES {
                        // The order may have reached the venue even though
                        // every response was lost; the label decides.
                        break self.reconcile_lost_order(&label).await;
                    }
                }
            }
        };

        self.stats.write().await.pending_order_label = None;

        let Some(ack) = ack else {
            return Ok(HedgeOutcome::Abandoned);
        };

        let filled = self
            .apply_ack(portfolio, hedge_instrument, hedge_spec, &ack, side, net_at_send)
            .await?;
        if filled {
            self.transition(HedgerPhase::Cooldown, "fill applied").await;
            Ok(HedgeOutcome::Applied)
        } else {
            Ok(HedgeOutcome::Abandoned)
        }
    }

    /// Apply the filled part of an acknowledged order to the portfolio.
    async fn apply_ack(
        &mut self,
        portfolio: &mut Portfolio,
        hedge_instrument: &Instrument,
        hedge_spec: &InstrumentSpec,
        ack: &OrderAck,
        side: OrderSide,
        net_at_send: Decimal,
    ) -> Result<bool, HedgeError> {
        let fillable = matches!(
            ack.status,
            OrderStatus::Filled | OrderStatus::PartiallyFilled
        ) && ack.filled_quantity > Decimal::ZERO;
        if !fillable {
            // A partial fill's remainder is treated as cancelled; nothing
            // filled at all just re-arms.
            debug!(portfolio = %self.portfolio_id, status = ?ack.status, "no fill applied");
            return Ok(false);
        }

        let avg_price = ack
            .avg_price
            .or(self.hedge_mark)
            .unwrap_or(Decimal::ZERO);
        let signed = match side {
            OrderSide::Buy => ack.filled_quantity,
            OrderSide::Sell => -ack.filled_quantity,
        };

        let instrument = hedge_instrument.clone();
        let is_inverse = hedge_spec.is_inverse;
        let saved = self
            .save_with_retry(move |p: &mut Portfolio| {
                p.apply_hedge_fill(&instrument, signed, avg_price, is_inverse);
            })
            .await?;
        *portfolio = saved;

        // The hysteresis reference is the delta the book settled at after
        // this fill.
        let applied_delta = if is_inverse {
            if avg_price.is_zero() {
                Decimal::ZERO
            } else {
                signed * (Decimal::NEGATIVE_ONE / avg_price)
            }
        } else {
            signed
        };
        self.last_hedged_delta = net_at_send + applied_delta;
        self.consecutive_rejects = 0;

        let mut stats = self.stats.write().await;
        stats.fills += 1;
        stats.consecutive_errors = 0;
        stats.last_hedged_delta = Some(self.last_hedged_delta);
        info!(
            portfolio = %self.portfolio_id,
            %side,
            filled = %ack.filled_quantity,
            price = %avg_price,
            "hedge filled"
        );
        Ok(true)
    }

    /// After exhausted transport retries, ask the venue whether the order
    /// made it through anyway.
    async fn reconcile_lost_order(&self, label: &str) -> Option<OrderAck> {
        match self.exchange.get_order(label).await {
            Ok(Some(state)) => {
                info!(portfolio = %self.portfolio_id, label, "lost order reconciled");
                Some(OrderAck {
                    order_id: state.order_id,
                    label: state.label,
                    status: state.status,
                    filled_quantity: state.filled_quantity,
                    avg_price: state.avg_price,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("lost-order lookup failed: {e}");
                None
            }
        }
    }

    /// Fire-and-forget reconciliation of an order still pending when the
    /// hedger stopped, so venue state is eventually reflected in the store.
    fn spawn_post_stop_reconcile(&self, label: String, is_inverse: bool) {
        let exchange = Arc::clone(&self.exchange);
        let store = Arc::clone(&self.store);
        let portfolio_id = self.portfolio_id.clone();
        let hedge_name = self.hedge_name.clone();

        tokio::spawn(async move {
            for _ in 0..POST_STOP_POLLS {
                tokio::time::sleep(POST_STOP_POLL_INTERVAL).await;
                let state = match exchange.get_order(&label).await {
                    Ok(Some(state)) => state,
                    Ok(None) => return,
                    Err(_) => continue,
                };
                if state.status == OrderStatus::Open {
                    continue;
                }
                if state.filled_quantity > Decimal::ZERO {
                    let Ok(instrument) = Instrument::parse(&hedge_name) else {
                        return;
                    };
                    let signed = match state.side {
                        OrderSide::Buy => state.filled_quantity,
                        OrderSide::Sell => -state.filled_quantity,
                    };
                    let avg = state.avg_price.unwrap_or(Decimal::ZERO);
                    let result = store
                        .save(
                            &portfolio_id,
                            Box::new(move |p| {
                                p.apply_hedge_fill(&instrument, signed, avg, is_inverse);
                            }),
                        )
                        .await;
                    if let Err(e) = result {
                        warn!("post-stop reconcile persist failed: {e}");
                    } else {
                        info!(portfolio = %portfolio_id, label, "post-stop fill reconciled");
                    }
                }
                return;
            }
        });
    }

    async fn apply_tick(&mut self, portfolio: &mut Portfolio, tick: &MarketTick) {
        self.index_price = Some(tick.index_price);

        if tick.instrument == self.hedge_name {
            self.hedge_mark = Some(tick.mark_price);
            if let Some(hedge) = portfolio.hedge_position.as_mut() {
                hedge.last_mark = Some(tick.mark_price);
            }
        } else if let Some(leg) = portfolio.positions.get_mut(&tick.instrument) {
            leg.last_mark = Some(tick.mark_price);
            if tick.delta.is_some() {
                leg.last_delta = tick.delta;
            }
            if tick.iv.is_some() {
                leg.last_iv = tick.iv;
            }
        }

        self.stats.write().await.last_tick_ts = Some(tick.timestamp_ms);
    }

    /// Funding and delivery settle straight into the balance.
    async fn apply_settlement(
        &mut self,
        portfolio: &mut Portfolio,
        settlement: &SettlementEvent,
    ) -> Result<(), HedgeError> {
        if settlement.instrument != self.hedge_name {
            return Ok(());
        }
        info!(
            portfolio = %self.portfolio_id,
            kind = ?settlement.kind,
            amount = %settlement.amount,
            "settlement applied"
        );
        let amount = settlement.amount;
        let saved = self
            .save_with_retry(move |p: &mut Portfolio| p.balance += amount)
            .await?;
        *portfolio = saved;
        Ok(())
    }

    /// Ask the venue about each leg before subscribing; a leg it reports as
    /// expired is zeroed out up front.
    async fn probe_expired_legs(&mut self, portfolio: &mut Portfolio) -> Result<(), HedgeError> {
        let legs: Vec<String> = portfolio
            .positions
            .values()
            .filter(|leg| !leg.expired)
            .map(|leg| leg.instrument.name.clone())
            .collect();

        for name in legs {
            match self.exchange.get_instrument(&name).await {
                Err(e) if e.is_expired_instrument() => {
                    self.retire_leg(portfolio, &name).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Zero out legs whose contracts have expired on the clock.
    async fn mark_expired_legs(&mut self, portfolio: &mut Portfolio) -> Result<(), HedgeError> {
        let now = Utc::now();
        let expired: Vec<String> = portfolio
            .positions
            .values()
            .filter(|leg| !leg.expired && leg.instrument.is_expired_at(now))
            .map(|leg| leg.instrument.name.clone())
            .collect();

        for name in expired {
            self.retire_leg(portfolio, &name).await?;
        }
        Ok(())
    }

    /// Zero an expired leg's delta and persist; the portfolio update event
    /// records the expiry.
    async fn retire_leg(
        &mut self,
        portfolio: &mut Portfolio,
        name: &str,
    ) -> Result<(), HedgeError> {
        info!(portfolio = %self.portfolio_id, instrument = %name, "leg expired");
        let key = name.to_string();
        let saved = self
            .save_with_retry(move |p: &mut Portfolio| {
                if let Some(leg) = p.positions.get_mut(&key) {
                    leg.expired = true;
                    leg.last_delta = Some(Decimal::ZERO);
                }
            })
            .await?;
        *portfolio = saved;
        Ok(())
    }

    /// Adopt the venue's view of the hedge position when it diverges.
    async fn reconcile_hedge_position(
        &mut self,
        portfolio: &mut Portfolio,
        hedge_instrument: &Instrument,
    ) -> Result<(), HedgeError> {
        let venue = match self.exchange.get_position(&self.hedge_name).await {
            Ok(position) => position,
            Err(e) if e.is_retryable() => {
                warn!("position lookup failed: {e}; will reconcile on next epoch");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let venue_size = venue.as_ref().map(|p| p.size).unwrap_or(Decimal::ZERO);
        let venue_avg = venue.as_ref().map(|p| p.avg_price).unwrap_or(Decimal::ZERO);
        let local_size = portfolio
            .hedge_position
            .as_ref()
            .map(|h| h.quantity)
            .unwrap_or(Decimal::ZERO);
        if venue_size == local_size {
            return Ok(());
        }

        warn!(
            portfolio = %self.portfolio_id,
            %local_size,
            %venue_size,
            "hedge position diverged; adopting venue truth"
        );
        let instrument = hedge_instrument.clone();
        let saved = self
            .save_with_retry(move |p: &mut Portfolio| {
                if venue_size.is_zero() {
                    p.hedge_position = None;
                } else {
                    p.hedge_position =
                        Some(LegPosition::new(instrument.clone(), venue_size, venue_avg));
                }
            })
            .await?;
        *portfolio = saved;
        Ok(())
    }

    /// Push the working copy's marks into the store on shutdown.
    async fn persist_marks(&self, portfolio: &Portfolio) -> Result<(), HedgeError> {
        let snapshot = portfolio.clone();
        self.save_with_retry(move |p: &mut Portfolio| {
            for (name, src) in snapshot.positions.iter() {
                if let Some(dst) = p.positions.get_mut(name) {
                    dst.last_mark = src.last_mark;
                    dst.last_delta = src.last_delta;
                    dst.last_iv = src.last_iv;
                    dst.expired = src.expired;
                }
            }
            if let (Some(dst), Some(src)) =
                (p.hedge_position.as_mut(), snapshot.hedge_position.as_ref())
            {
                dst.last_mark = src.last_mark;
            }
        })
        .await?;
        Ok(())
    }

    async fn load_portfolio_with_retry(&self) -> Result<Portfolio, HedgeError> {
        let mut attempt = 0;
        loop {
            match self.store.load(&self.portfolio_id).await {
                Ok(portfolio) => return Ok(portfolio),
                Err(e) if attempt + 1 < STORE_RETRIES => {
                    warn!("portfolio load failed: {e}; retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Persist through the store, retrying transient io failures. Anything
    /// persistent bubbles up and fails the hedger rather than letting local
    /// state diverge from venue truth.
    async fn save_with_retry<F>(&self, mutate: F) -> Result<Portfolio, HedgeError>
    where
        F: Fn(&mut Portfolio) + Send + Clone + 'static,
    {
        let mut attempt = 0;
        loop {
            let mutator = mutate.clone();
            match self.store.save(&self.portfolio_id, Box::new(mutator)).await {
                Ok(portfolio) => return Ok(portfolio),
                Err(StoreError::Io(e)) if attempt + 1 < STORE_RETRIES => {
                    warn!("portfolio save io failure: {e}; retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(100 << attempt)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn transition(&mut self, to: HedgerPhase, reason: &str) {
        let from = self.phase;
        if from == to {
            return;
        }
        self.phase = to;
        self.stats.write().await.phase = to;
        self.manager
            .report_state(&self.portfolio_id, from, to, reason)
            .await;
    }

    async fn record_error(&self, message: &str) {
        warn!(portfolio = %self.portfolio_id, "hedger error: {message}");
        let mut stats = self.stats.write().await;
        stats.errors += 1;
        stats.last_error = Some(message.to_string());
    }
}

/// Wait for the next message on any stream. Cancel-safe: broadcast `recv` is
/// cancel-safe and the futures are rebuilt each call.
async fn next_any(streams: &mut [MarketStream]) -> (usize, Option<StreamMessage>) {
    if streams.is_empty() {
        return std::future::pending().await;
    }
    let futures: Vec<_> = streams
        .iter_mut()
        .map(|stream| Box::pin(stream.next()))
        .collect();
    let (message, index, _) = select_all(futures).await;
    (index, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_default_is_idle_and_clean() {
        let stats = HedgerStats::default();
        assert_eq!(stats.phase, HedgerPhase::Idle);
        assert_eq!(stats.pending_order_label, None);
        assert_eq!(stats.orders_sent, 0);
    }
}
