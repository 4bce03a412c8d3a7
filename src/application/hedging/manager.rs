//! Lifecycle of the hedger fleet.

use crate::application::hedging::config::HedgerConfig;
use crate::application::hedging::hedger::{DynamicDeltaHedger, HedgerStats};
use crate::domain::errors::HedgeError;
use crate::domain::events::{EngineEvent, HedgerPhase};
use crate::domain::ports::ExchangeApi;
use crate::domain::pricing::Pricer;
use crate::domain::repositories::PortfolioStore;
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::subscriptions::SubscriptionManager;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Narrow capability the hedger holds back to its manager: state reporting
/// and the event bus, nothing else. Breaks the hedger-manager ownership
/// cycle.
#[derive(Clone)]
pub struct ManagerHandle {
    bus: EventBus,
}

impl ManagerHandle {
    pub(crate) fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub async fn report_state(
        &self,
        portfolio_id: &str,
        from: HedgerPhase,
        to: HedgerPhase,
        reason: &str,
    ) {
        debug!(portfolio = %portfolio_id, %from, %to, reason, "hedger state change");
        self.bus.publish(EngineEvent::HedgerStateChanged {
            id: portfolio_id.to_string(),
            from,
            to,
            reason: reason.to_string(),
        });
    }
}

struct HedgerHandle {
    stop_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    stats: Arc<RwLock<HedgerStats>>,
    cfg: HedgerConfig,
}

impl HedgerHandle {
    fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Runs one [`DynamicDeltaHedger`] per portfolio and reconciles lifecycle
/// changes. Owns the hedger handles exclusively.
pub struct HedgingManager {
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<dyn PortfolioStore>,
    subs: Arc<SubscriptionManager>,
    pricer: Arc<dyn Pricer>,
    bus: EventBus,
    default_cfg: HedgerConfig,
    hedgers: Mutex<HashMap<String, HedgerHandle>>,
}

impl HedgingManager {
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<dyn PortfolioStore>,
        subs: Arc<SubscriptionManager>,
        pricer: Arc<dyn Pricer>,
        bus: EventBus,
        default_cfg: HedgerConfig,
    ) -> Self {
        Self {
            exchange,
            store,
            subs,
            pricer,
            bus,
            default_cfg,
            hedgers: Mutex::new(HashMap::new()),
        }
    }

    /// Start a hedger for the portfolio. Idempotent: a second start while one
    /// is running is a no-op; a finished (stopped or failed) hedger is
    /// replaced.
    pub async fn start_hedger(
        &self,
        portfolio_id: &str,
        cfg: Option<HedgerConfig>,
    ) -> Result<(), HedgeError> {
        let mut hedgers = self.hedgers.lock().await;

        if let Some(existing) = hedgers.get(portfolio_id) {
            if !existing.is_finished() {
                debug!(portfolio = %portfolio_id, "hedger already running");
                return Ok(());
            }
            hedgers.remove(portfolio_id);
        }

        // Fail fast before spawning anything.
        self.store.load(portfolio_id).await?;

        let cfg = cfg.unwrap_or_else(|| self.default_cfg.clone());
        let stats = Arc::new(RwLock::new(HedgerStats::default()));
        let (stop_tx, stop_rx) = watch::channel(false);

        let hedger = DynamicDeltaHedger::new(
            portfolio_id.to_string(),
            cfg.clone(),
            Arc::clone(&self.exchange),
            Arc::clone(&self.store),
            Arc::clone(&self.subs),
            Arc::clone(&self.pricer),
            ManagerHandle::new(self.bus.clone()),
            Arc::clone(&stats),
            stop_rx,
        );
        let join = tokio::spawn(hedger.run());

        hedgers.insert(
            portfolio_id.to_string(),
            HedgerHandle {
                stop_tx,
                join,
                stats,
                cfg,
            },
        );
        info!(portfolio = %portfolio_id, "hedger started");
        Ok(())
    }

    /// Signal the hedger to stop and await its graceful drain. The handle is
    /// removed either way; a drain overrunning its grace period is aborted.
    pub async fn stop_hedger(&self, portfolio_id: &str) -> Result<(), HedgeError> {
        let handle = self.hedgers.lock().await.remove(portfolio_id);
        let Some(handle) = handle else {
            return Err(HedgeError::NotRunning {
                id: portfolio_id.to_string(),
            });
        };
        Self::drain(portfolio_id, handle).await;
        Ok(())
    }

    pub async fn restart_hedger(&self, portfolio_id: &str) -> Result<(), HedgeError> {
        let cfg = match self.hedgers.lock().await.get(portfolio_id) {
            Some(handle) => Some(handle.cfg.clone()),
            None => None,
        };
        if cfg.is_some() {
            self.stop_hedger(portfolio_id).await?;
        }
        self.start_hedger(portfolio_id, cfg).await
    }

    pub async fn get_hedger_stats(&self, portfolio_id: &str) -> Option<HedgerStats> {
        let hedgers = self.hedgers.lock().await;
        let handle = hedgers.get(portfolio_id)?;
        Some(handle.stats.read().await.clone())
    }

    pub async fn list_hedgers(&self) -> Vec<(String, HedgerStats)> {
        let hedgers = self.hedgers.lock().await;
        let mut listed = Vec::with_capacity(hedgers.len());
        for (id, handle) in hedgers.iter() {
            listed.push((id.clone(), handle.stats.read().await.clone()));
        }
        listed.sort_by(|a, b| a.0.cmp(&b.0));
        listed
    }

    /// Stop every hedger in parallel, then drop all subscriptions. The owner
    /// closes the exchange client afterwards.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, HedgerHandle)> = {
            let mut hedgers = self.hedgers.lock().await;
            hedgers.drain().collect()
        };
        info!("stopping {} hedgers", drained.len());
        join_all(
            drained
                .into_iter()
                .map(|(id, handle)| async move { Self::drain(&id, handle).await }),
        )
        .await;

        self.subs.shutdown().await;
        info!("hedging manager shut down");
    }

    async fn drain(portfolio_id: &str, handle: HedgerHandle) {
        let _ = handle.stop_tx.send(true);
        // The hedger honors stop_timeout internally for an in-flight order;
        // the slack covers subscription release and the final persist.
        let grace = handle.cfg.stop_timeout + Duration::from_secs(2);
        let abort = handle.join.abort_handle();
        match tokio::time::timeout(grace, handle.join).await {
            Ok(_) => info!(portfolio = %portfolio_id, "hedger stopped"),
            Err(_) => {
                warn!(portfolio = %portfolio_id, "hedger did not drain in time; aborting");
                abort.abort();
            }
        }
    }
}
