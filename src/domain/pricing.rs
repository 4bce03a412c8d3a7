use crate::domain::instrument::OptionType;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use statrs::function::erf::erf;
use std::f64::consts::SQRT_2;

/// Inputs to the option pricer. Forward and strike share the quote currency;
/// volatility is annualized; time is in years.
#[derive(Debug, Clone, Copy)]
pub struct PricingInputs {
    pub forward: f64,
    pub strike: f64,
    pub years_to_expiry: f64,
    pub volatility: f64,
    pub rate: f64,
    pub option_type: OptionType,
}

/// Price and per-contract delta, both in quote/underlying units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceAndDelta {
    pub price: Decimal,
    pub delta: Decimal,
}

/// Capability interface for pricing an option leg when the ticker carries no
/// greeks.
pub trait Pricer: Send + Sync {
    fn price_and_delta(&self, inputs: &PricingInputs) -> PriceAndDelta;
}

/// Black-76 model on the forward, the standard for margined crypto options.
#[derive(Debug, Clone, Copy, Default)]
pub struct Black76Pricer;

impl Pricer for Black76Pricer {
    fn price_and_delta(&self, inputs: &PricingInputs) -> PriceAndDelta {
        let (price, delta) = black76(inputs);
        PriceAndDelta {
            price: Decimal::from_f64(price).unwrap_or(Decimal::ZERO),
            delta: Decimal::from_f64(delta).unwrap_or(Decimal::ZERO),
        }
    }
}

fn black76(inputs: &PricingInputs) -> (f64, f64) {
    let PricingInputs {
        forward: f,
        strike: k,
        years_to_expiry: t,
        volatility: sigma,
        rate: r,
        option_type,
    } = *inputs;

    if f <= 0.0 || k <= 0.0 {
        return (0.0, 0.0);
    }

    let df = (-r * t.max(0.0)).exp();

    // At or past expiry the option collapses to intrinsic value.
    if t <= 0.0 || sigma <= 0.0 {
        return match option_type {
            OptionType::Call => {
                let itm = f > k;
                ((f - k).max(0.0) * df, if itm { df } else { 0.0 })
            }
            OptionType::Put => {
                let itm = f < k;
                ((k - f).max(0.0) * df, if itm { -df } else { 0.0 })
            }
        };
    }

    let vol_sqrt_t = sigma * t.sqrt();
    let d1 = ((f / k).ln() + 0.5 * sigma * sigma * t) / vol_sqrt_t;
    let d2 = d1 - vol_sqrt_t;

    match option_type {
        OptionType::Call => {
            let price = df * (f * norm_cdf(d1) - k * norm_cdf(d2));
            (price, df * norm_cdf(d1))
        }
        OptionType::Put => {
            let price = df * (k * norm_cdf(-d2) - f * norm_cdf(-d1));
            (price, df * (norm_cdf(d1) - 1.0))
        }
    }
}

fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}
