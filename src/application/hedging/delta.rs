//! Net-delta computation, the hysteresis trigger rule and hedge sizing.

use crate::application::hedging::config::{HedgerConfig, StepMode};
use crate::domain::instrument::{ContractKind, InstrumentSpec};
use crate::domain::portfolio::Portfolio;
use crate::domain::ports::OrderSide;
use crate::domain::pricing::{Pricer, PricingInputs};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Net delta of the portfolio in underlying units, or `None` while any live
/// leg is still unpriced (Warming).
///
/// Option legs use venue greeks when present and fall back to the pricer
/// with `(S = index, K, T, iv)`. The hedge leg contributes `qty` for linear
/// contracts and `qty * (-1/S)` for inverse ones.
pub fn net_delta(
    portfolio: &Portfolio,
    hedge_spec: &InstrumentSpec,
    pricer: &dyn Pricer,
    index_price: Option<Decimal>,
    now: DateTime<Utc>,
) -> Option<Decimal> {
    let mut total = Decimal::ZERO;

    for leg in portfolio.positions.values() {
        if leg.expired {
            continue;
        }
        if let Some(contribution) = leg.delta_contribution() {
            total += contribution;
            continue;
        }
        match leg.instrument.kind {
            ContractKind::Option {
                strike,
                option_type,
                ..
            } => {
                // No greeks yet: price it ourselves, if we have enough data.
                let iv = leg.last_iv?;
                let index = index_price?;
                let years = leg.instrument.years_to_expiry(now)?;
                let out = pricer.price_and_delta(&PricingInputs {
                    forward: index.to_f64()?,
                    strike: strike.to_f64()?,
                    years_to_expiry: years,
                    // Venue IVs are quoted in percent.
                    volatility: iv.to_f64()? / 100.0,
                    rate: 0.0,
                    option_type,
                });
                total += leg.quantity * out.delta;
            }
            // A linear futures leg held outside the hedge slot is one delta
            // per contract.
            ContractKind::Future { .. } | ContractKind::Perpetual => total += leg.quantity,
        }
    }

    if let Some(hedge) = &portfolio.hedge_position {
        if hedge_spec.is_inverse {
            let price = hedge.last_mark.or(index_price)?;
            if price.is_zero() {
                return None;
            }
            total += hedge.quantity * (Decimal::NEGATIVE_ONE / price);
        } else {
            total += hedge.quantity;
        }
    }

    Some(total)
}

/// The hysteresis step in underlying units.
pub fn step_value(cfg: &HedgerConfig, portfolio: &Portfolio, index_price: Decimal) -> Decimal {
    match cfg.step_mode {
        StepMode::Absolute => cfg.step_size,
        StepMode::Percentage => {
            if index_price.is_zero() {
                return cfg.step_size;
            }
            let notional: Decimal = portfolio
                .positions
                .values()
                .filter(|leg| !leg.expired)
                .filter_map(|leg| leg.last_mark.map(|mark| leg.quantity * mark / index_price))
                .sum();
            cfg.step_size * notional.abs()
        }
    }
}

/// The trigger rule: hedge only once the deviation exceeds both the trigger
/// floor and one full step since the last hedge.
pub fn should_hedge(
    cfg: &HedgerConfig,
    net_delta: Decimal,
    last_hedged_delta: Decimal,
    step: Decimal,
) -> bool {
    let gap = net_delta - cfg.target_delta;
    let trigger = cfg.min_trigger_delta.max(step);
    gap.abs() >= trigger && (gap - (last_hedged_delta - cfg.target_delta)).abs() >= step
}

/// Size the hedge order that offsets `gap = net_delta - target`.
///
/// Quantities are rounded to the lot size truncating toward zero; orders
/// below `min_hedge_usd` of notional are skipped.
pub fn hedge_order(
    gap: Decimal,
    spec: &InstrumentSpec,
    index_price: Decimal,
    min_hedge_usd: Decimal,
) -> Option<(OrderSide, Decimal)> {
    if index_price <= Decimal::ZERO || spec.lot_size <= Decimal::ZERO {
        return None;
    }

    // Contracts that cancel the gap: -gap for linear; gap * S for inverse
    // (an inverse contract carries -1/S delta per unit).
    let raw = if spec.is_inverse {
        gap * index_price
    } else {
        -gap
    };
    let qty = (raw / spec.lot_size).trunc() * spec.lot_size;
    if qty.is_zero() {
        return None;
    }

    let underlying_amount = if spec.is_inverse {
        qty.abs() / index_price
    } else {
        qty.abs()
    };
    if underlying_amount * index_price < min_hedge_usd {
        return None;
    }

    let side = if qty > Decimal::ZERO {
        OrderSide::Buy
    } else {
        OrderSide::Sell
    };
    Some((side, qty.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::Instrument;
    use crate::domain::portfolio::LegPosition;
    use crate::domain::pricing::Black76Pricer;
    use rust_decimal_macros::dec;

    fn perp_spec() -> InstrumentSpec {
        InstrumentSpec {
            name: "BTC-PERPETUAL".into(),
            lot_size: dec!(0.001),
            tick_size: dec!(0.5),
            is_inverse: false,
        }
    }

    fn short_call_portfolio(delta: Option<Decimal>) -> Portfolio {
        let mut p = Portfolio::new("p1", "BTC", dec!(100000));
        let mut leg = LegPosition::new(
            Instrument::parse("BTC-26SEP25-30000-C").unwrap(),
            dec!(-10),
            dec!(1500),
        );
        leg.last_mark = Some(dec!(1500));
        leg.last_delta = delta;
        leg.last_iv = Some(dec!(60));
        p.upsert_leg(leg);
        p
    }

    #[test]
    fn unpriced_leg_keeps_warming() {
        let mut p = short_call_portfolio(None);
        if let Some(leg) = p.positions.values_mut().next() {
            leg.last_iv = None;
        }
        let nd = net_delta(&p, &perp_spec(), &Black76Pricer, Some(dec!(30000)), Utc::now());
        assert_eq!(nd, None);
    }

    #[test]
    fn ticker_greeks_drive_net_delta() {
        let p = short_call_portfolio(Some(dec!(0.5)));
        let nd = net_delta(&p, &perp_spec(), &Black76Pricer, Some(dec!(30000)), Utc::now());
        assert_eq!(nd, Some(dec!(-5.0)));
    }

    #[test]
    fn pricer_fallback_when_no_greeks() {
        let p = short_call_portfolio(None);
        let now = chrono::TimeZone::with_ymd_and_hms(&Utc, 2025, 6, 26, 8, 0, 0).unwrap();
        let nd = net_delta(&p, &perp_spec(), &Black76Pricer, Some(dec!(30000)), now)
            .expect("iv and index present");
        // Short 10 ATM calls: net delta near -5, leaning past it with vol.
        assert!(nd < dec!(-4.5) && nd > dec!(-7), "net delta {nd}");
    }

    #[test]
    fn hedge_leg_offsets_linear() {
        let mut p = short_call_portfolio(Some(dec!(0.5)));
        p.apply_hedge_fill(
            &Instrument::perpetual("BTC"),
            dec!(5),
            dec!(30000),
            false,
        );
        let nd = net_delta(&p, &perp_spec(), &Black76Pricer, Some(dec!(30000)), Utc::now());
        assert_eq!(nd, Some(Decimal::ZERO));
    }

    #[test]
    fn inverse_hedge_contribution_scales_with_price() {
        let mut spec = perp_spec();
        spec.is_inverse = true;

        let mut p = short_call_portfolio(Some(dec!(0.5)));
        p.apply_hedge_fill(
            &Instrument::perpetual("BTC"),
            dec!(-150000),
            dec!(30000),
            true,
        );
        let nd = net_delta(&p, &spec, &Black76Pricer, Some(dec!(30000)), Utc::now()).unwrap();
        // -150000 contracts * (-1/30000) = +5, cancelling the -5 of options.
        assert_eq!(nd, Decimal::ZERO);
    }

    #[test]
    fn hysteresis_sequence_only_last_triggers() {
        let cfg = HedgerConfig {
            step_size: dec!(0.5),
            min_trigger_delta: dec!(0.01),
            ..HedgerConfig::default()
        };
        let last_hedged = Decimal::ZERO;
        let sequence = [dec!(0.3), dec!(-0.4), dec!(0.49), dec!(0.51)];
        let fired: Vec<bool> = sequence
            .iter()
            .map(|nd| should_hedge(&cfg, *nd, last_hedged, dec!(0.5)))
            .collect();
        assert_eq!(fired, vec![false, false, false, true]);
    }

    #[test]
    fn drift_since_last_hedge_must_exceed_step() {
        let cfg = HedgerConfig {
            step_size: dec!(0.5),
            ..HedgerConfig::default()
        };
        // Deviation is large in absolute terms but has not moved a full step
        // since the last hedge left us at 1.0.
        assert!(!should_hedge(&cfg, dec!(1.2), dec!(1.0), dec!(0.5)));
        assert!(should_hedge(&cfg, dec!(1.6), dec!(1.0), dec!(0.5)));
    }

    #[test]
    fn percentage_step_scales_with_notional() {
        let cfg = HedgerConfig {
            step_mode: StepMode::Percentage,
            step_size: dec!(0.1),
            ..HedgerConfig::default()
        };
        let p = short_call_portfolio(Some(dec!(0.5)));
        // Notional: |-10 * 1500 / 30000| = 0.5 underlying; step = 0.05.
        assert_eq!(step_value(&cfg, &p, dec!(30000)), dec!(0.05));
    }

    #[test]
    fn sizing_truncates_toward_zero() {
        let (side, qty) = hedge_order(dec!(-5.0004), &perp_spec(), dec!(30000), dec!(10)).unwrap();
        assert_eq!(side, OrderSide::Buy);
        assert_eq!(qty, dec!(5.000));

        let (side, qty) = hedge_order(dec!(0.0017), &perp_spec(), dec!(30000), dec!(10)).unwrap();
        assert_eq!(side, OrderSide::Sell);
        assert_eq!(qty, dec!(0.001));
    }

    #[test]
    fn tiny_notional_is_skipped() {
        // 0.001 BTC at 5000 USD = 5 USD < 10 USD floor.
        assert_eq!(hedge_order(dec!(-0.001), &perp_spec(), dec!(5000), dec!(10)), None);
        // Below one lot rounds to zero.
        assert_eq!(hedge_order(dec!(-0.0004), &perp_spec(), dec!(30000), dec!(10)), None);
    }

    #[test]
    fn inverse_sizing_buys_contracts_when_gap_positive() {
        let mut spec = perp_spec();
        spec.is_inverse = true;
        spec.lot_size = dec!(10);

        let (side, qty) = hedge_order(dec!(5), &spec, dec!(30000), dec!(10)).unwrap();
        assert_eq!(side, OrderSide::Buy);
        assert_eq!(qty, dec!(150000));
    }
}
