//! Scriptable in-process venue used by unit and integration tests.

use crate::domain::errors::{ExchangeError, CODE_EXPIRED_INSTRUMENT};
use crate::domain::instrument::{Instrument, InstrumentSpec};
use crate::domain::ports::{
    ticker_channel, AccountSummary, ExchangeApi, MarketTick, OrderAck, OrderRequest, OrderSide,
    OrderState, OrderStatus, SettlementEvent, StreamEvent, VenuePosition,
};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};

const STREAM_CAPACITY: usize = 256;

/// Scripted outcome for the next order submission.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Fill in full at the given price (or the last mark if `None`).
    Fill { avg_price: Option<Decimal> },
    Partial {
        filled: Decimal,
        avg_price: Decimal,
    },
    Reject {
        code: i64,
        message: String,
    },
    /// The response is lost. When `order_reaches_venue` the order still
    /// exists venue-side and `get_order` will find it filled.
    Transport {
        order_reaches_venue: bool,
    },
    /// The call never returns. When `order_reaches_venue` the order fills
    /// venue-side and only the response hangs.
    Hang {
        order_reaches_venue: bool,
    },
}

#[derive(Default)]
struct MockState {
    channels: HashMap<String, broadcast::Sender<StreamEvent>>,
    subscribe_calls: HashMap<String, usize>,
    unsubscribe_calls: HashMap<String, usize>,
    marks: HashMap<String, Decimal>,
    order_script: VecDeque<ScriptedOutcome>,
    orders: HashMap<String, OrderState>,
    positions: HashMap<String, VenuePosition>,
    instruments: HashMap<String, InstrumentSpec>,
    expired_instruments: HashSet<String>,
    summaries: HashMap<String, AccountSummary>,
    next_order_id: u64,
    place_order_calls: usize,
    refuse_orders: bool,
}

/// In-memory venue double: records subscriptions, simulates fills and
/// reports positions consistent with them.
pub struct MockExchange {
    state: Arc<Mutex<MockState>>,
    epoch_tx: watch::Sender<u64>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            epoch_tx: watch::Sender::new(1),
        }
    }

    /// Queue the outcome of the next unseen order label.
    pub async fn script_order(&self, outcome: ScriptedOutcome) {
        self.state.lock().await.order_script.push_back(outcome);
    }

    /// Deliver a tick to ticker-channel subscribers and remember the mark.
    pub async fn push_tick(&self, tick: MarketTick) {
        let mut state = self.state.lock().await;
        state
            .marks
            .insert(tick.instrument.clone(), tick.mark_price);
        if let Some(tx) = state.channels.get(&ticker_channel(&tick.instrument)) {
            let _ = tx.send(StreamEvent::Tick(tick));
        }
    }

    pub async fn push_settlement(&self, channel: &str, settlement: SettlementEvent) {
        let state = self.state.lock().await;
        if let Some(tx) = state.channels.get(channel) {
            let _ = tx.send(StreamEvent::Settlement(settlement));
        }
    }

    /// Simulate a transport flap: the epoch advances as it would after a
    /// reconnect handshake.
    pub fn bump_epoch(&self) {
        self.epoch_tx.send_modify(|e| *e += 1);
    }

    /// While set, `place_order` refuses as during reconnection.
    pub async fn set_refuse_orders(&self, refuse: bool) {
        self.state.lock().await.refuse_orders = refuse;
    }

    /// Make `get_instrument` report the contract as expired.
    pub async fn set_instrument_expired(&self, name: &str) {
        self.state
            .lock()
            .await
            .expired_instruments
            .insert(name.to_string());
    }

    pub async fn set_instrument_spec(&self, spec: InstrumentSpec) {
        self.state
            .lock()
            .await
            .instruments
            .insert(spec.name.clone(), spec);
    }

    pub async fn set_account_summary(&self, summary: AccountSummary) {
        self.state
            .lock()
            .await
            .summaries
            .insert(summary.currency.clone(), summary);
    }

    pub async fn set_position(&self, position: VenuePosition) {
        self.state
            .lock()
            .await
            .positions
            .insert(position.instrument.clone(), position);
    }

    pub async fn subscribe_count(&self, channel: &str) -> usize {
        *self
            .state
            .lock()
            .await
            .subscribe_calls
            .get(channel)
            .unwrap_or(&0)
    }

    pub async fn unsubscribe_count(&self, channel: &str) -> usize {
        *self
            .state
            .lock()
            .await
            .unsubscribe_calls
            .get(channel)
            .unwrap_or(&0)
    }

    pub async fn active_channels(&self) -> Vec<String> {
        self.state.lock().await.channels.keys().cloned().collect()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn place_order_calls(&self) -> usize {
        self.state.lock().await.place_order_calls
    }

    pub async fn venue_position(&self, instrument: &str) -> Option<VenuePosition> {
        self.state.lock().await.positions.get(instrument).cloned()
    }

    /// A fill whose acknowledgement never reached the caller.
    fn record_unacked_fill(
        state: &mut MockState,
        request: &OrderRequest,
        order_id: &str,
        mark: Decimal,
    ) {
        let entry = OrderState {
            order_id: order_id.to_string(),
            label: request.label.clone(),
            instrument: request.instrument.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_quantity: request.quantity,
            avg_price: Some(mark),
            status: OrderStatus::Filled,
        };
        Self::apply_fill(state, request, request.quantity, mark);
        state.orders.insert(request.label.clone(), entry);
    }

    fn apply_fill(state: &mut MockState, request: &OrderRequest, filled: Decimal, price: Decimal) {
        let signed = match request.side {
            OrderSide::Buy => filled,
            OrderSide::Sell => -filled,
        };
        let position = state
            .positions
            .entry(request.instrument.clone())
            .or_insert_with(|| VenuePosition {
                instrument: request.instrument.clone(),
                size: Decimal::ZERO,
                avg_price: price,
            });
        position.size += signed;
        position.avg_price = price;
        if position.size.is_zero() {
            state.positions.remove(&request.instrument);
        }
    }
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, ExchangeError> {
        Err(ExchangeError::Rejected {
            code: 10_009,
            message: format!("method not scripted: {method}"),
        })
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError> {
        let mut state = self.state.lock().await;
        state.place_order_calls += 1;

        if state.refuse_orders {
            return Err(ExchangeError::transport("reconnecting; order refused"));
        }

        // Idempotency: a replayed label returns the existing order and never
        // creates a second one.
        if let Some(existing) = state.orders.get(&request.label) {
            return Ok(OrderAck {
                order_id: existing.order_id.clone(),
                label: existing.label.clone(),
                status: existing.status,
                filled_quantity: existing.filled_quantity,
                avg_price: existing.avg_price,
            });
        }

        let outcome = state
            .order_script
            .pop_front()
            .unwrap_or(ScriptedOutcome::Fill { avg_price: None });

        let mark = state
            .marks
            .get(&request.instrument)
            .copied()
            .unwrap_or(Decimal::ZERO);

        state.next_order_id += 1;
        let order_id = format!("mock-{}", state.next_order_id);

        let (status, filled, price, err) = match outcome {
            ScriptedOutcome::Fill { avg_price } => {
                let price = avg_price.unwrap_or(mark);
                (OrderStatus::Filled, request.quantity, price, None)
            }
            ScriptedOutcome::Partial { filled, avg_price } => {
                (OrderStatus::PartiallyFilled, filled, avg_price, None)
            }
            ScriptedOutcome::Reject { code, message } => (
                OrderStatus::Rejected,
                Decimal::ZERO,
                mark,
                Some(ExchangeError::Rejected { code, message }),
            ),
            ScriptedOutcome::Transport { order_reaches_venue } => {
                if order_reaches_venue {
                    Self::record_unacked_fill(&mut state, &request, &order_id, mark);
                }
                return Err(ExchangeError::transport("response lost"));
            }
            ScriptedOutcome::Hang { order_reaches_venue } => {
                if order_reaches_venue {
                    Self::record_unacked_fill(&mut state, &request, &order_id, mark);
                }
                drop(state);
                return std::future::pending().await;
            }
        };

        if let Some(err) = err {
            return Err(err);
        }

        let order = OrderState {
            order_id: order_id.clone(),
            label: request.label.clone(),
            instrument: request.instrument.clone(),
            side: request.side,
            quantity: request.quantity,
            filled_quantity: filled,
            avg_price: Some(price),
            status,
        };
        Self::apply_fill(&mut state, &request, filled, price);
        state.orders.insert(request.label.clone(), order);

        Ok(OrderAck {
            order_id,
            label: request.label,
            status,
            filled_quantity: filled,
            avg_price: Some(price),
        })
    }

    async fn get_order(&self, label: &str) -> Result<Option<OrderState>, ExchangeError> {
        Ok(self.state.lock().await.orders.get(label).cloned())
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderState>, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect())
    }

    async fn get_position(
        &self,
        instrument: &str,
    ) -> Result<Option<VenuePosition>, ExchangeError> {
        Ok(self.state.lock().await.positions.get(instrument).cloned())
    }

    async fn get_account_summary(
        &self,
        currency: &str,
    ) -> Result<AccountSummary, ExchangeError> {
        Ok(self
            .state
            .lock()
            .await
            .summaries
            .get(currency)
            .cloned()
            .unwrap_or_else(|| AccountSummary {
                currency: currency.to_string(),
                equity: Decimal::ZERO,
                available: Decimal::ZERO,
            }))
    }

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentSpec, ExchangeError> {
        let state = self.state.lock().await;
        if state.expired_instruments.contains(instrument) {
            return Err(ExchangeError::Rejected {
                code: CODE_EXPIRED_INSTRUMENT,
                message: format!("instrument expired: {instrument}"),
            });
        }
        if let Some(spec) = state.instruments.get(instrument) {
            return Ok(spec.clone());
        }
        drop(state);
        let parsed = Instrument::parse(instrument).map_err(|reason| ExchangeError::Rejected {
            code: 10_001,
            message: reason,
        })?;
        Ok(InstrumentSpec::defaults_for(&parsed))
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<StreamEvent>, ExchangeError> {
        let mut state = self.state.lock().await;
        *state
            .subscribe_calls
            .entry(channel.to_string())
            .or_insert(0) += 1;
        let tx = state
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(STREAM_CAPACITY).0);
        Ok(tx.subscribe())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError> {
        let mut state = self.state.lock().await;
        *state
            .unsubscribe_calls
            .entry(channel.to_string())
            .or_insert(0) += 1;
        state.channels.remove(channel);
        Ok(())
    }

    fn connection_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::OrderKind;
    use rust_decimal_macros::dec;

    fn market_buy(label: &str, qty: Decimal) -> OrderRequest {
        OrderRequest {
            instrument: "BTC-PERPETUAL".into(),
            side: OrderSide::Buy,
            quantity: qty,
            kind: OrderKind::Market,
            reduce_only: false,
            label: label.into(),
        }
    }

    #[tokio::test]
    async fn fills_at_last_mark_by_default() {
        let venue = MockExchange::new();
        venue
            .push_tick(MarketTick {
                instrument: "BTC-PERPETUAL".into(),
                mark_price: dec!(30000),
                index_price: dec!(30000),
                bid: None,
                ask: None,
                timestamp_ms: 1,
                delta: None,
                iv: None,
            })
            .await;

        let ack = venue.place_order(market_buy("l1", dec!(5))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_price, Some(dec!(30000)));

        let pos = venue.venue_position("BTC-PERPETUAL").await.unwrap();
        assert_eq!(pos.size, dec!(5));
    }

    #[tokio::test]
    async fn replayed_label_never_creates_second_order() {
        let venue = MockExchange::new();
        let first = venue.place_order(market_buy("l1", dec!(2))).await.unwrap();
        let second = venue.place_order(market_buy("l1", dec!(2))).await.unwrap();

        assert_eq!(first.order_id, second.order_id);
        assert_eq!(venue.order_count().await, 1);
        assert_eq!(
            venue.venue_position("BTC-PERPETUAL").await.unwrap().size,
            dec!(2)
        );
    }

    #[tokio::test]
    async fn lost_response_still_reaches_venue_when_scripted() {
        let venue = MockExchange::new();
        venue
            .script_order(ScriptedOutcome::Transport {
                order_reaches_venue: true,
            })
            .await;

        let err = venue
            .place_order(market_buy("l2", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Transport { .. }));

        // The label reconciles to a filled order.
        let state = venue.get_order("l2").await.unwrap().unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn subscription_bookkeeping() {
        let venue = MockExchange::new();
        let _rx = venue.subscribe("ticker.BTC-PERPETUAL").await.unwrap();
        assert_eq!(venue.subscribe_count("ticker.BTC-PERPETUAL").await, 1);

        venue.unsubscribe("ticker.BTC-PERPETUAL").await.unwrap();
        assert_eq!(venue.unsubscribe_count("ticker.BTC-PERPETUAL").await, 1);
        assert!(venue.active_channels().await.is_empty());
    }
}
