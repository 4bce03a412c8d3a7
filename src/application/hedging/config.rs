use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// How the hysteresis step around the target delta is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    /// `step_size` in underlying units.
    Absolute,
    /// `step_size` as a fraction of the options notional, in underlying
    /// units.
    Percentage,
}

impl FromStr for StepMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "absolute" => Ok(StepMode::Absolute),
            "percentage" => Ok(StepMode::Percentage),
            _ => anyhow::bail!("Invalid step mode: {}. Must be 'absolute' or 'percentage'", s),
        }
    }
}

/// Rule mapping an underlying to its hedge instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HedgeInstrumentRule {
    /// `<UNDERLYING>-PERPETUAL`, the default on this venue family.
    Perpetual,
    /// A fixed instrument name, regardless of underlying.
    Fixed(String),
}

impl HedgeInstrumentRule {
    pub fn resolve(&self, underlying: &str) -> String {
        match self {
            HedgeInstrumentRule::Perpetual => format!("{underlying}-PERPETUAL"),
            HedgeInstrumentRule::Fixed(name) => name.clone(),
        }
    }
}

/// Per-portfolio hedger parameters; the engine carries a global default that
/// `start_hedger` may override per portfolio.
#[derive(Debug, Clone)]
pub struct HedgerConfig {
    pub target_delta: Decimal,
    /// Absolute threshold in underlying units below which no hedge fires.
    pub min_trigger_delta: Decimal,
    pub step_mode: StepMode,
    pub step_size: Decimal,
    /// Cadence of self-driven re-evaluation when no tick arrives.
    pub price_check_interval: Duration,
    /// Minimum notional per hedge order; smaller orders are skipped.
    pub min_hedge_usd: Decimal,
    pub max_concurrent_hedges: usize,
    /// Re-evaluation is suppressed for this long after a fill settles.
    pub cooldown: Duration,
    /// Grace period for an in-flight order when stopping.
    pub stop_timeout: Duration,
    pub hedge_instrument: HedgeInstrumentRule,
    pub pnl_publish_interval: Duration,
    pub pnl_depth: usize,
}

impl Default for HedgerConfig {
    fn default() -> Self {
        Self {
            target_delta: Decimal::ZERO,
            min_trigger_delta: dec!(0.01),
            step_mode: StepMode::Absolute,
            step_size: dec!(0.01),
            price_check_interval: Duration::from_secs(30),
            min_hedge_usd: dec!(10),
            max_concurrent_hedges: 1,
            cooldown: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            hedge_instrument: HedgeInstrumentRule::Perpetual,
            pnl_publish_interval: Duration::from_secs(1),
            pnl_depth: 1024,
        }
    }
}
