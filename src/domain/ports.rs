use crate::domain::errors::ExchangeError;
use crate::domain::instrument::InstrumentSpec;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OrderKind {
    Market,
    Limit { price: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// An order submission. `label` is the client-generated idempotency token;
/// the venue round-trips it on every order-state event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub kind: OrderKind,
    pub reduce_only: bool,
    pub label: String,
}

/// Venue acknowledgement of an order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: String,
    pub label: String,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

/// Venue-side order state, as returned by `get_order` / `get_open_orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    pub label: String,
    pub instrument: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub instrument: String,
    /// Signed size in contract units.
    pub size: Decimal,
    pub avg_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub currency: String,
    pub equity: Decimal,
    pub available: Decimal,
}

/// One market-data observation for an instrument. Monotonic within a single
/// instrument stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketTick {
    pub instrument: String,
    pub mark_price: Decimal,
    pub index_price: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub timestamp_ms: i64,
    /// Per-contract delta for options, when the venue publishes greeks.
    pub delta: Option<Decimal>,
    pub iv: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Funding,
    Delivery,
}

/// A settlement entry reported by the venue (funding payment or delivery).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub instrument: String,
    pub kind: SettlementKind,
    /// Signed amount credited (positive) or debited (negative).
    pub amount: Decimal,
    pub timestamp_ms: i64,
}

/// A demultiplexed message on one subscription channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(MarketTick),
    Settlement(SettlementEvent),
}

pub fn ticker_channel(instrument: &str) -> String {
    format!("ticker.{instrument}")
}

pub fn settlements_channel(underlying: &str) -> String {
    format!("settlements.{underlying}")
}

/// Authenticated duplex session to the venue: correlated request/response
/// plus server-side channel multiplexing.
///
/// Shared read-mostly across hedgers; implementations own a single socket
/// writer internally.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Raw correlated request/response.
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ExchangeError>;

    /// Submit an order with at-most-once semantics keyed by `request.label`.
    /// Refuses with a retryable transport error while reconnecting.
    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError>;

    /// Look up an order by its idempotency label.
    async fn get_order(&self, label: &str) -> Result<Option<OrderState>, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<OrderState>, ExchangeError>;

    async fn get_position(&self, instrument: &str)
        -> Result<Option<VenuePosition>, ExchangeError>;

    async fn get_account_summary(&self, currency: &str)
        -> Result<AccountSummary, ExchangeError>;

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentSpec, ExchangeError>;

    /// Subscribe to a venue channel; events fan out on the returned receiver.
    /// No replay across reconnects: consumers treat a gap as stale data.
    async fn subscribe(&self, channel: &str)
        -> Result<broadcast::Receiver<StreamEvent>, ExchangeError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError>;

    /// Bumped on every successful (re)connect. Observers re-reconcile when
    /// the epoch advances.
    fn connection_epoch(&self) -> watch::Receiver<u64>;
}
