//! JSON-RPC 2.0 wire frames and DTOs for Deribit-family venues.

use crate::domain::errors::ExchangeError;
use crate::domain::instrument::InstrumentSpec;
use crate::domain::ports::{
    AccountSummary, MarketTick, OrderAck, OrderKind, OrderRequest, OrderSide, OrderState,
    OrderStatus, SettlementEvent, SettlementKind, StreamEvent, VenuePosition,
};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Any frame the venue can send: a correlated response or a subscription
/// notification.
#[derive(Debug, Deserialize)]
pub struct RpcInbound {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub method: Option<String>,
    pub params: Option<NotificationParams>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationParams {
    pub channel: String,
    pub data: Value,
}

/// Venue error codes with a dedicated meaning for the client.
const CODE_UNAUTHORIZED: i64 = 13_009;
const CODE_INVALID_CREDENTIALS: i64 = 13_004;
const CODE_TOO_MANY_REQUESTS: i64 = 10_028;

pub fn map_rpc_error(err: RpcError) -> ExchangeError {
    match err.code {
        CODE_UNAUTHORIZED | CODE_INVALID_CREDENTIALS => ExchangeError::AuthRequired,
        CODE_TOO_MANY_REQUESTS => ExchangeError::RateLimited,
        code => ExchangeError::Rejected {
            code,
            message: err.message,
        },
    }
}

/// Credentials-by-signature auth params: the secret never crosses the wire.
pub fn auth_params(client_id: &str, client_secret: &str, timestamp_ms: i64, nonce: &str) -> Value {
    let data = "";
    let payload = format!("{timestamp_ms}\n{nonce}\n{data}");
    let mut mac = HmacSha256::new_from_slice(client_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    json!({
        "grant_type": "client_signature",
        "client_id": client_id,
        "timestamp": timestamp_ms,
        "nonce": nonce,
        "data": data,
        "signature": signature,
    })
}

pub fn subscribe_params(channels: &[String]) -> Value {
    json!({ "channels": channels })
}

/// Build the `private/buy` / `private/sell` params for an order request.
pub fn order_params(request: &OrderRequest) -> (String, Value) {
    let method = match request.side {
        OrderSide::Buy => "private/buy".to_string(),
        OrderSide::Sell => "private/sell".to_string(),
    };
    let mut params = json!({
        "instrument_name": request.instrument,
        "amount": request.quantity.abs(),
        "label": request.label,
        "reduce_only": request.reduce_only,
    });
    match request.kind {
        OrderKind::Market => {
            params["type"] = json!("market");
            params["time_in_force"] = json!("immediate_or_cancel");
        }
        OrderKind::Limit { price } => {
            params["type"] = json!("limit");
            params["price"] = json!(price);
        }
    }
    (method, params)
}

fn parse_status(s: &str, filled: Decimal, quantity: Decimal) -> OrderStatus {
    match s {
        "open" => OrderStatus::Open,
        "filled" => OrderStatus::Filled,
        "rejected" => OrderStatus::Rejected,
        "cancelled" => {
            if filled > Decimal::ZERO && filled < quantity {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Cancelled
            }
        }
        _ => OrderStatus::Open,
    }
}

#[derive(Debug, Deserialize)]
struct OrderData {
    order_id: String,
    #[serde(default)]
    label: String,
    instrument_name: String,
    direction: String,
    amount: Decimal,
    #[serde(default)]
    filled_amount: Decimal,
    average_price: Option<Decimal>,
    order_state: String,
}

fn order_state_from_data(data: OrderData) -> OrderState {
    let side = if data.direction == "sell" {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    };
    let status = parse_status(&data.order_state, data.filled_amount, data.amount);
    OrderState {
        order_id: data.order_id,
        label: data.label,
        instrument: data.instrument_name,
        side,
        quantity: data.amount,
        filled_quantity: data.filled_amount,
        avg_price: data.average_price,
        status,
    }
}

/// Parse the result of an order submission (`{"order": {...}, "trades": [...]}`).
pub fn parse_order_ack(result: &Value) -> Result<OrderAck, ExchangeError> {
    let order = result.get("order").cloned().unwrap_or_else(|| result.clone());
    let data: OrderData = serde_json::from_value(order).map_err(|e| ExchangeError::Transport {
        retryable: false,
        reason: format!("malformed order ack: {e}"),
    })?;
    let state = order_state_from_data(data);
    Ok(OrderAck {
        order_id: state.order_id,
        label: state.label,
        status: state.status,
        filled_quantity: state.filled_quantity,
        avg_price: state.avg_price,
    })
}

pub fn parse_order_state(result: &Value) -> Result<OrderState, ExchangeError> {
    let data: OrderData =
        serde_json::from_value(result.clone()).map_err(|e| ExchangeError::Transport {
            retryable: false,
            reason: format!("malformed order state: {e}"),
        })?;
    Ok(order_state_from_data(data))
}

pub fn parse_order_states(result: &Value) -> Result<Vec<OrderState>, ExchangeError> {
    let items = result.as_array().cloned().unwrap_or_default();
    items.iter().map(parse_order_state).collect()
}

#[derive(Debug, Deserialize)]
struct PositionData {
    instrument_name: String,
    #[serde(default)]
    size: Decimal,
    #[serde(default)]
    average_price: Decimal,
}

pub fn parse_position(result: &Value) -> Result<Option<VenuePosition>, ExchangeError> {
    if result.is_null() {
        return Ok(None);
    }
    let data: PositionData =
        serde_json::from_value(result.clone()).map_err(|e| ExchangeError::Transport {
            retryable: false,
            reason: format!("malformed position: {e}"),
        })?;
    if data.size.is_zero() {
        return Ok(None);
    }
    Ok(Some(VenuePosition {
        instrument: data.instrument_name,
        size: data.size,
        avg_price: data.average_price,
    }))
}

#[derive(Debug, Deserialize)]
struct AccountSummaryData {
    currency: String,
    equity: Decimal,
    #[serde(default)]
    available_funds: Decimal,
}

pub fn parse_account_summary(result: &Value) -> Result<AccountSummary, ExchangeError> {
    let data: AccountSummaryData =
        serde_json::from_value(result.clone()).map_err(|e| ExchangeError::Transport {
            retryable: false,
            reason: format!("malformed account summary: {e}"),
        })?;
    Ok(AccountSummary {
        currency: data.currency,
        equity: data.equity,
        available: data.available_funds,
    })
}

#[derive(Debug, Deserialize)]
struct InstrumentData {
    instrument_name: String,
    min_trade_amount: Decimal,
    tick_size: Decimal,
    #[serde(default)]
    settlement_currency: Option<String>,
    #[serde(default)]
    base_currency: Option<String>,
}

pub fn parse_instrument_spec(result: &Value) -> Result<InstrumentSpec, ExchangeError> {
    let data: InstrumentData =
        serde_json::from_value(result.clone()).map_err(|e| ExchangeError::Transport {
            retryable: false,
            reason: format!("malformed instrument: {e}"),
        })?;
    // Inverse contracts settle in the base currency (e.g. BTC-settled).
    let is_inverse = match (&data.settlement_currency, &data.base_currency) {
        (Some(settle), Some(base)) => settle == base,
        _ => false,
    };
    Ok(InstrumentSpec {
        name: data.instrument_name,
        lot_size: data.min_trade_amount,
        tick_size: data.tick_size,
        is_inverse,
    })
}

#[derive(Debug, Deserialize)]
struct TickerGreeks {
    delta: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct TickerData {
    instrument_name: String,
    mark_price: Decimal,
    index_price: Decimal,
    best_bid_price: Option<Decimal>,
    best_ask_price: Option<Decimal>,
    timestamp: i64,
    greeks: Option<TickerGreeks>,
    mark_iv: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
struct SettlementData {
    instrument_name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    funding: Decimal,
    #[serde(default)]
    session_profit_loss: Decimal,
    timestamp: i64,
}

/// Decode the payload of a subscription notification by channel family.
pub fn parse_stream_event(channel: &str, data: &Value) -> Option<StreamEvent> {
    if channel.starts_with("ticker.") {
        let ticker: TickerData = serde_json::from_value(data.clone()).ok()?;
        return Some(StreamEvent::Tick(MarketTick {
            instrument: ticker.instrument_name,
            mark_price: ticker.mark_price,
            index_price: ticker.index_price,
            bid: ticker.best_bid_price,
            ask: ticker.best_ask_price,
            timestamp_ms: ticker.timestamp,
            delta: ticker.greeks.and_then(|g| g.delta),
            iv: ticker.mark_iv,
        }));
    }
    if channel.starts_with("settlements.") {
        let settlement: SettlementData = serde_json::from_value(data.clone()).ok()?;
        let (kind, amount) = match settlement.kind.as_str() {
            "settlement" => (SettlementKind::Funding, settlement.funding),
            "delivery" => (SettlementKind::Delivery, settlement.session_profit_loss),
            _ => return None,
        };
        return Some(StreamEvent::Settlement(SettlementEvent {
            instrument: settlement.instrument_name,
            kind,
            amount,
            timestamp_ms: settlement.timestamp,
        }));
    }
    None
}
