use crate::domain::portfolio::Portfolio;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a hedger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HedgerPhase {
    Idle,
    /// Started; awaiting first ticks for all legs and the hedge instrument.
    Warming,
    /// Tick coverage complete; watching the trigger rule.
    Armed,
    /// A hedge order is in flight.
    Hedging,
    /// A hedge just settled; re-evaluation suppressed briefly.
    Cooldown,
    /// Unrecoverable error; will not auto-restart.
    Failed,
    Stopped,
}

impl std::fmt::Display for HedgerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One PnL observation for a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlSample {
    pub portfolio_id: String,
    pub ts_ms: i64,
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub net_delta: Decimal,
}

/// Events published on the in-process engine bus. External shells (HTTP/WS)
/// subscribe and map these onto their own wire frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    PortfolioUpdated {
        id: String,
        portfolio: Box<Portfolio>,
    },
    PortfolioDeleted {
        id: String,
    },
    HedgerStateChanged {
        id: String,
        from: HedgerPhase,
        to: HedgerPhase,
        reason: String,
    },
    PnlUpdate {
        id: String,
        history: Vec<PnlSample>,
    },
}

impl EngineEvent {
    /// The portfolio this event concerns.
    pub fn portfolio_id(&self) -> &str {
        match self {
            Self::PortfolioUpdated { id, .. }
            | Self::PortfolioDeleted { id }
            | Self::HedgerStateChanged { id, .. }
            | Self::PnlUpdate { id, .. } => id,
        }
    }
}
