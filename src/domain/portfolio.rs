use crate::domain::instrument::Instrument;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single options or hedge leg held by a portfolio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegPosition {
    pub instrument: Instrument,
    /// Signed: long positive, short negative.
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
    pub last_mark: Option<Decimal>,
    /// Per-contract delta in units of underlying.
    pub last_delta: Option<Decimal>,
    pub last_iv: Option<Decimal>,
    /// Set when the venue reports the contract expired; the leg is then
    /// excluded from delta computation.
    #[serde(default)]
    pub expired: bool,
}

impl LegPosition {
    pub fn new(instrument: Instrument, quantity: Decimal, avg_entry_price: Decimal) -> Self {
        Self {
            instrument,
            quantity,
            avg_entry_price,
            last_mark: None,
            last_delta: None,
            last_iv: None,
            expired: false,
        }
    }

    /// Signed delta contribution of this leg, if it has been priced.
    pub fn delta_contribution(&self) -> Option<Decimal> {
        if self.expired {
            return Some(Decimal::ZERO);
        }
        self.last_delta.map(|d| self.quantity * d)
    }
}

/// An options portfolio with an optional hedge leg on a linear or inverse
/// futures instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub id: String,
    pub underlying: String,
    /// Quote-currency balance; mutates with realized PnL and funding.
    pub balance: Decimal,
    pub positions: HashMap<String, LegPosition>,
    pub hedge_position: Option<LegPosition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Portfolio {
    pub fn new(id: impl Into<String>, underlying: impl Into<String>, balance: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            underlying: underlying.into(),
            balance,
            positions: HashMap::new(),
            hedge_position: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_generated_id(underlying: impl Into<String>, balance: Decimal) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), underlying, balance)
    }

    /// Insert or replace a non-hedge leg.
    pub fn upsert_leg(&mut self, leg: LegPosition) {
        self.positions.insert(leg.instrument.name.clone(), leg);
    }

    pub fn remove_leg(&mut self, instrument: &str) -> Option<LegPosition> {
        self.positions.remove(instrument)
    }

    /// Apply a hedge fill: adjust hedge quantity, entry price and balance.
    ///
    /// Linear contracts settle `-qty * price` in quote currency; inverse
    /// contracts settle `qty / price` in underlying terms.
    pub fn apply_hedge_fill(
        &mut self,
        instrument: &Instrument,
        qty: Decimal,
        avg_price: Decimal,
        is_inverse: bool,
    ) {
        let hedge = self
            .hedge_position
            .get_or_insert_with(|| LegPosition::new(instrument.clone(), Decimal::ZERO, avg_price));

        let old_qty = hedge.quantity;
        let new_qty = old_qty + qty;

        // Weighted entry price while adding exposure; keep the old basis when
        // reducing, reset when crossing through flat.
        if old_qty.is_zero() || (old_qty.signum() == qty.signum()) {
            let denom = old_qty.abs() + qty.abs();
            if !denom.is_zero() {
                hedge.avg_entry_price =
                    (hedge.avg_entry_price * old_qty.abs() + avg_price * qty.abs()) / denom;
            }
        } else if old_qty.signum() != new_qty.signum() && !new_qty.is_zero() {
            hedge.avg_entry_price = avg_price;
        }

        hedge.quantity = new_qty;
        hedge.last_mark = Some(avg_price);

        if is_inverse {
            if !avg_price.is_zero() {
                self.balance += qty / avg_price;
            }
        } else {
            self.balance -= qty * avg_price;
        }

        if hedge.quantity.is_zero() {
            self.hedge_position = None;
        }
    }

    /// Every live leg (options legs plus the hedge leg, if any).
    pub fn legs(&self) -> impl Iterator<Item = &LegPosition> {
        self.positions.values().chain(self.hedge_position.iter())
    }

    /// Instrument names the hedger must receive ticks for.
    pub fn subscribed_instruments(&self, hedge_instrument: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .positions
            .values()
            .filter(|leg| !leg.expired)
            .map(|leg| leg.instrument.name.clone())
            .collect();
        if !names.iter().any(|n| n == hedge_instrument) {
            names.push(hedge_instrument.to_string());
        }
        names
    }
}
