use crate::domain::errors::ExchangeError;
use crate::domain::instrument::InstrumentSpec;
use crate::domain::ports::{
    AccountSummary, ExchangeApi, OrderAck, OrderRequest, OrderState, StreamEvent, VenuePosition,
};
use crate::infrastructure::exchange::protocol::{
    self, RpcInbound, RpcRequest,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, Notify, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const OUTBOUND_QUEUE: usize = 64;
const STREAM_CAPACITY: usize = 256;
/// Consecutive unanswered pings before the connection is torn down.
const MAX_MISSED_PINGS: u8 = 2;

#[derive(Debug, Clone)]
pub struct WsClientConfig {
    pub ws_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub call_timeout: Duration,
    pub order_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_backoff: Duration,
    pub max_pending_calls: usize,
}

impl WsClientConfig {
    pub fn new(
        ws_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            call_timeout: Duration::from_secs(10),
            order_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(20),
            max_backoff: Duration::from_secs(30),
            max_pending_calls: 256,
        }
    }
}

enum ConnExit {
    /// TCP/TLS/upgrade failed; grow the backoff.
    ConnectFailed,
    /// Connection dropped after establishment; reconnect promptly.
    Dropped,
    Stopped,
}

struct ClientInner {
    cfg: WsClientConfig,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, ExchangeError>>>>,
    out_tx: RwLock<Option<mpsc::Sender<Message>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<StreamEvent>>>,
    /// True once the current connection is authenticated and resubscribed.
    ready_tx: watch::Sender<bool>,
    epoch_tx: watch::Sender<u64>,
    fatal_tx: watch::Sender<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl ClientInner {
    fn new(cfg: WsClientConfig) -> Self {
        Self {
            cfg,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            out_tx: RwLock::new(None),
            channels: Mutex::new(HashMap::new()),
            ready_tx: watch::Sender::new(false),
            epoch_tx: watch::Sender::new(0),
            fatal_tx: watch::Sender::new(None),
            stop_tx: watch::Sender::new(false),
        }
    }

    fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Correlated request/response for callers; refused while reconnecting.
    async fn call_checked(&self, method: &str, params: Value) -> Result<Value, ExchangeError> {
        if !self.is_ready() {
            return Err(ExchangeError::transport("reconnecting"));
        }
        self.call_with_timeout(method, params, self.cfg.call_timeout)
            .await
    }

    /// Correlated request/response used by the handshake itself.
    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, ExchangeError> {
        self.call_with_timeout(method, params, self.cfg.call_timeout)
            .await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ExchangeError> {
        let out = self
            .out_tx
            .read()
            .await
            .clone()
            .ok_or_else(|| ExchangeError::transport("not connected"))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.len() >= self.cfg.max_pending_calls {
                return Err(ExchangeError::RateLimited);
            }
            pending.insert(id, tx);
        }

        let frame = RpcRequest::new(id, method, params);
        let text = serde_json::to_string(&frame).map_err(|e| ExchangeError::Transport {
            retryable: false,
            reason: format!("unencodable request: {e}"),
        })?;

        if out.send(Message::Text(text.into())).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(ExchangeError::transport("writer gone"));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ExchangeError::transport("connection lost")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ExchangeError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Route one inbound frame to a pending call or a stream handle.
    async fn dispatch_text(&self, text: &str) {
        let inbound: RpcInbound = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                debug!("undecodable frame: {e}");
                return;
            }
        };

        if let Some(id) = inbound.id {
            let waiter = self.pending.lock().await.remove(&id);
            if let Some(tx) = waiter {
                let outcome = match inbound.error {
                    Some(err) => Err(protocol::map_rpc_error(err)),
                    None => Ok(inbound.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            return;
        }

        if inbound.method.as_deref() == Some("subscription") {
            let Some(params) = inbound.params else { return };
            let Some(event) = protocol::parse_stream_event(&params.channel, &params.data) else {
                return;
            };
            if let Some(tx) = self.channels.lock().await.get(&params.channel) {
                let _ = tx.send(event);
            }
        }
    }

    /// Fail every outstanding call; run on teardown so callers observe the
    /// disconnect instead of their timeout.
    async fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(ExchangeError::transport(reason)));
        }
    }

    /// Auth, resubscribe and reconciliation sweep for a fresh connection.
    async fn handshake(&self) -> Result<(), ExchangeError> {
        let ts = chrono::Utc::now().timestamp_millis();
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let params = protocol::auth_params(&self.cfg.api_key, &self.cfg.api_secret, ts, &nonce);
        self.call_raw("public/auth", params).await?;

        let channels: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        if !channels.is_empty() {
            self.call_raw("public/subscribe", protocol::subscribe_params(&channels))
                .await?;
            info!("resubscribed {} channels", channels.len());
        }

        // Reconciliation sweep: observers converge on venue truth once the
        // epoch advances.
        match self.call_raw("private/get_open_orders", json!({})).await {
            Ok(result) => {
                let open = result.as_array().map(|a| a.len()).unwrap_or(0);
                info!("reconciliation sweep: {open} open orders");
            }
            Err(e) => warn!("open-orders sweep failed: {e}"),
        }
        if let Err(e) = self.call_raw("private/get_positions", json!({})).await {
            warn!("positions sweep failed: {e}");
        }

        let _ = self.ready_tx.send(true);
        self.epoch_tx.send_modify(|epoch| *epoch += 1);
        Ok(())
    }
}

/// WebSocket exchange client: one socket, one writer task, a dispatcher that
/// routes inbound frames to pending calls (by correlation id) or stream
/// handles (by channel), and automatic reconnection.
pub struct WsExchangeClient {
    inner: Arc<ClientInner>,
    run: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsExchangeClient {
    /// Establish the session: connects, authenticates and subscribes. Fails
    /// fast on rejected credentials; transport errors are retried forever
    /// with capped backoff.
    pub async fn connect(cfg: WsClientConfig) -> Result<Self, ExchangeError> {
        let inner = Arc::new(ClientInner::new(cfg));
        let run = tokio::spawn(Self::run_loop(Arc::clone(&inner)));

        let mut epoch_rx = inner.epoch_tx.subscribe();
        let mut fatal_rx = inner.fatal_tx.subscribe();
        loop {
            if *epoch_rx.borrow() > 0 {
                break;
            }
            let fatal = fatal_rx.borrow().clone();
            if let Some(reason) = fatal {
                run.abort();
                error!("exchange auth failed: {reason}");
                return Err(ExchangeError::AuthRequired);
            }
            tokio::select! {
                changed = epoch_rx.changed() => {
                    if changed.is_err() {
                        return Err(ExchangeError::transport("client task exited"));
                    }
                }
                _ = fatal_rx.changed() => {}
            }
        }

        Ok(Self {
            inner,
            run: Mutex::new(Some(run)),
        })
    }

    /// Tear the session down and stop reconnecting.
    pub async fn close(&self) {
        let _ = self.inner.stop_tx.send(true);
        if let Some(handle) = self.run.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }

    async fn run_loop(inner: Arc<ClientInner>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *inner.stop_tx.borrow() {
                break;
            }
            match Self::run_connection(&inner).await {
                ConnExit::Stopped => break,
                ConnExit::Dropped => {
                    backoff = Duration::from_secs(1);
                    info!("connection dropped; reconnecting");
                    tokio::time::sleep(with_jitter(Duration::from_millis(500))).await;
                }
                ConnExit::ConnectFailed => {
                    let delay = with_jitter(backoff);
                    warn!("connect failed; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    backoff = (backoff * 2).min(inner.cfg.max_backoff);
                }
            }
            if inner.fatal_tx.borrow().is_some() {
                break;
            }
        }
        let _ = inner.ready_tx.send(false);
        *inner.out_tx.write().await = None;
        inner.fail_pending("client stopped").await;
    }

    async fn run_connection(inner: &Arc<ClientInner>) -> ConnExit {
        let ws = match connect_async(&inner.cfg.ws_url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!("websocket connect error: {e}");
                return ConnExit::ConnectFailed;
            }
        };
        debug!("websocket connected: {}", inner.cfg.ws_url);

        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        *inner.out_tx.write().await = Some(out_tx.clone());

        // Single writer to the socket.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Handshake runs concurrently with the read loop so its responses
        // can be dispatched.
        let abort = Arc::new(Notify::new());
        let handshake = tokio::spawn({
            let inner = Arc::clone(inner);
            let abort = Arc::clone(&abort);
            async move {
                match inner.handshake().await {
                    Ok(()) => info!("session established"),
                    Err(ExchangeError::AuthRequired) => {
                        let _ = inner
                            .fatal_tx
                            .send(Some("venue rejected credentials".into()));
                        abort.notify_one();
                    }
                    Err(e) => {
                        warn!("handshake failed: {e}");
                        abort.notify_one();
                    }
                }
            }
        });

        let mut heartbeat = tokio::time::interval(inner.cfg.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.reset(); // no ping before the first full interval
        let mut missed_pings: u8 = 0;
        let mut stop_rx = inner.stop_tx.subscribe();

        let exit = loop {
            tokio::select! {
                _ = stop_rx.changed() => break ConnExit::Stopped,
                _ = abort.notified() => break ConnExit::Dropped,
                _ = heartbeat.tick() => {
                    if missed_pings >= MAX_MISSED_PINGS {
                        warn!("{missed_pings} heartbeats missed; tearing down");
                        break ConnExit::Dropped;
                    }
                    missed_pings += 1;
                    if out_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break ConnExit::Dropped;
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => inner.dispatch_text(&text).await,
                    Some(Ok(Message::Pong(_))) => missed_pings = 0,
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = out_tx.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("closed by venue: {frame:?}");
                        break ConnExit::Dropped;
                    }
                    Some(Err(e)) => {
                        error!("websocket read error: {e}");
                        break ConnExit::Dropped;
                    }
                    None => break ConnExit::Dropped,
                    _ => {}
                }
            }
        };

        let _ = inner.ready_tx.send(false);
        *inner.out_tx.write().await = None;
        inner.fail_pending("connection lost").await;
        handshake.abort();
        writer.abort();
        exit
    }
}

impl Drop for WsExchangeClient {
    fn drop(&mut self) {
        let _ = self.inner.stop_tx.send(true);
    }
}

fn with_jitter(backoff: Duration) -> Duration {
    let jitter_ms = rand::rng().random_range(0..=backoff.as_millis().max(4) as u64 / 4);
    backoff + Duration::from_millis(jitter_ms)
}

#[async_trait]
impl ExchangeApi for WsExchangeClient {
    async fn call(&self, method: &str, params: Value) -> Result<Value, ExchangeError> {
        self.inner.call_checked(method, params).await
    }

    async fn place_order(&self, request: OrderRequest) -> Result<OrderAck, ExchangeError> {
        if !self.inner.is_ready() {
            // Refuse rather than risk a duplicate across the reconnect.
            return Err(ExchangeError::transport("reconnecting; order refused"));
        }
        let (method, params) = protocol::order_params(&request);
        let timeout = self.inner.cfg.order_timeout;
        match self.inner.call_with_timeout(&method, params, timeout).await {
            Ok(result) => protocol::parse_order_ack(&result),
            Err(ExchangeError::Timeout { .. }) => {
                // The response was lost, not necessarily the order: reconcile
                // through the idempotency label.
                match self.get_order(&request.label).await? {
                    Some(state) => Ok(OrderAck {
                        order_id: state.order_id,
                        label: state.label,
                        status: state.status,
                        filled_quantity: state.filled_quantity,
                        avg_price: state.avg_price,
                    }),
                    None => Err(ExchangeError::Timeout {
                        duration_ms: timeout.as_millis() as u64,
                    }),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order(&self, label: &str) -> Result<Option<OrderState>, ExchangeError> {
        let result = self
            .inner
            .call_checked(
                "private/get_order_state_by_label",
                json!({ "label": label }),
            )
            .await?;
        let states = protocol::parse_order_states(&result)?;
        Ok(states.into_iter().next())
    }

    async fn get_open_orders(&self) -> Result<Vec<OrderState>, ExchangeError> {
        let result = self
            .inner
            .call_checked("private/get_open_orders", json!({}))
            .await?;
        protocol::parse_order_states(&result)
    }

    async fn get_position(
        &self,
        instrument: &str,
    ) -> Result<Option<VenuePosition>, ExchangeError> {
        let result = self
            .inner
            .call_checked(
                "private/get_position",
                json!({ "instrument_name": instrument }),
            )
            .await?;
        protocol::parse_position(&result)
    }

    async fn get_account_summary(
        &self,
        currency: &str,
    ) -> Result<AccountSummary, ExchangeError> {
        let result = self
            .inner
            .call_checked(
                "private/get_account_summary",
                json!({ "currency": currency }),
            )
            .await?;
        protocol::parse_account_summary(&result)
    }

    async fn get_instrument(&self, instrument: &str) -> Result<InstrumentSpec, ExchangeError> {
        let result = self
            .inner
            .call_checked(
                "public/get_instrument",
                json!({ "instrument_name": instrument }),
            )
            .await?;
        protocol::parse_instrument_spec(&result)
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<StreamEvent>, ExchangeError> {
        let rx = {
            let mut channels = self.inner.channels.lock().await;
            match channels.get(channel) {
                Some(tx) => {
                    return Ok(tx.subscribe());
                }
                None => {
                    let (tx, rx) = broadcast::channel(STREAM_CAPACITY);
                    channels.insert(channel.to_string(), tx);
                    rx
                }
            }
        };
        if self.inner.is_ready() {
            if let Err(e) = self
                .inner
                .call_raw(
                    "public/subscribe",
                    protocol::subscribe_params(&[channel.to_string()]),
                )
                .await
            {
                self.inner.channels.lock().await.remove(channel);
                return Err(e);
            }
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), ExchangeError> {
        let known = self.inner.channels.lock().await.remove(channel).is_some();
        if known && self.inner.is_ready() {
            self.inner
                .call_raw(
                    "public/unsubscribe",
                    protocol::subscribe_params(&[channel.to_string()]),
                )
                .await?;
        }
        Ok(())
    }

    fn connection_epoch(&self) -> watch::Receiver<u64> {
        self.inner.epoch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ticker_channel;

    fn test_inner() -> Arc<ClientInner> {
        Arc::new(ClientInner::new(WsClientConfig::new(
            "wss://example.invalid/ws",
            "key",
            "secret",
        )))
    }

    async fn mark_connected(inner: &Arc<ClientInner>) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        *inner.out_tx.write().await = Some(tx);
        let _ = inner.ready_tx.send(true);
        rx
    }

    #[tokio::test]
    async fn call_refused_while_disconnected() {
        let inner = test_inner();
        let err = inner.call_checked("public/test", json!({})).await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport { retryable: true, .. }));
    }

    #[tokio::test]
    async fn response_resolves_pending_call_by_id() {
        let inner = test_inner();
        let mut out_rx = mark_connected(&inner).await;

        let call_inner = Arc::clone(&inner);
        let call = tokio::spawn(async move {
            call_inner.call_checked("public/test", json!({})).await
        });

        // Read the request off the outbound queue to learn its id.
        let sent = out_rx.recv().await.unwrap();
        let text = match sent {
            Message::Text(t) => t.to_string(),
            other => panic!("unexpected frame: {other:?}"),
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let id = frame["id"].as_u64().unwrap();

        inner
            .dispatch_text(&format!(r#"{{"jsonrpc":"2.0","id":{id},"result":{{"version":"1.2"}}}}"#))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["version"], "1.2");
    }

    #[tokio::test]
    async fn error_response_maps_to_taxonomy() {
        let inner = test_inner();
        let mut out_rx = mark_connected(&inner).await;

        let call_inner = Arc::clone(&inner);
        let call = tokio::spawn(async move {
            call_inner.call_checked("private/buy", json!({})).await
        });

        let Message::Text(text) = out_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        let id = frame["id"].as_u64().unwrap();

        inner
            .dispatch_text(&format!(
                r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":10028,"message":"too many"}}}}"#
            ))
            .await;

        assert!(matches!(
            call.await.unwrap().unwrap_err(),
            ExchangeError::RateLimited
        ));
    }

    #[tokio::test]
    async fn pending_table_overflow_rate_limits() {
        let mut cfg = WsClientConfig::new("wss://example.invalid/ws", "key", "secret");
        cfg.max_pending_calls = 1;
        let inner = Arc::new(ClientInner::new(cfg));
        let _out_rx = mark_connected(&inner).await;

        {
            let (tx, _rx) = oneshot::channel();
            inner.pending.lock().await.insert(999, tx);
        }

        let err = inner.call_checked("public/test", json!({})).await.unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited));
    }

    #[tokio::test]
    async fn subscription_notification_routes_to_channel() {
        let inner = test_inner();
        let channel = ticker_channel("BTC-PERPETUAL");
        let (tx, mut rx) = broadcast::channel(8);
        inner.channels.lock().await.insert(channel.clone(), tx);

        inner
            .dispatch_text(
                r#"{"jsonrpc":"2.0","method":"subscription","params":{"channel":"ticker.BTC-PERPETUAL","data":{"instrument_name":"BTC-PERPETUAL","mark_price":30000.0,"index_price":29990.0,"timestamp":1700000000000}}}"#,
            )
            .await;

        match rx.recv().await.unwrap() {
            StreamEvent::Tick(tick) => assert_eq!(tick.instrument, "BTC-PERPETUAL"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn teardown_fails_outstanding_calls() {
        let inner = test_inner();
        let _out_rx = mark_connected(&inner).await;

        let call_inner = Arc::clone(&inner);
        let call = tokio::spawn(async move {
            call_inner.call_checked("public/test", json!({})).await
        });
        tokio::task::yield_now().await;

        inner.fail_pending("connection lost").await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ExchangeError::Transport { retryable: true, .. }));
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_backoff() {
        let base = Duration::from_secs(8);
        for _ in 0..50 {
            let delayed = with_jitter(base);
            assert!(delayed >= base);
            assert!(delayed <= base + Duration::from_secs(2));
        }
    }
}
