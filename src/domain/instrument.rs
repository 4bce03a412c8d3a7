use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Daily options and futures settle at 08:00 UTC on venues of this family.
const EXPIRY_HOUR_UTC: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "C"),
            OptionType::Put => write!(f, "P"),
        }
    }
}

/// Closed set of contract kinds the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContractKind {
    Option {
        strike: Decimal,
        expiry: DateTime<Utc>,
        option_type: OptionType,
    },
    Future {
        expiry: DateTime<Utc>,
    },
    Perpetual,
}

impl ContractKind {
    pub fn is_option(&self) -> bool {
        matches!(self, ContractKind::Option { .. })
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        match self {
            ContractKind::Option { expiry, .. } | ContractKind::Future { expiry } => Some(*expiry),
            ContractKind::Perpetual => None,
        }
    }
}

/// A parsed venue instrument name, e.g. `BTC-PERPETUAL`, `BTC-26SEP25`,
/// `BTC-26SEP25-30000-C`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub underlying: String,
    pub kind: ContractKind,
}

impl Instrument {
    /// Parse a venue instrument name.
    ///
    /// Accepted shapes: `<UND>-PERPETUAL`, `<UND>-<DDMMMYY>`,
    /// `<UND>-<DDMMMYY>-<STRIKE>-<C|P>`.
    pub fn parse(name: &str) -> Result<Self, String> {
        let parts: Vec<&str> = name.split('-').collect();
        let underlying = parts
            .first()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| format!("empty instrument name: '{name}'"))?
            .to_string();

        let kind = match parts.as_slice() {
            [_, "PERPETUAL"] => ContractKind::Perpetual,
            [_, date] => ContractKind::Future {
                expiry: parse_expiry(date)?,
            },
            [_, date, strike, letter] => {
                let option_type = match *letter {
                    "C" => OptionType::Call,
                    "P" => OptionType::Put,
                    other => return Err(format!("unknown option type '{other}' in '{name}'")),
                };
                ContractKind::Option {
                    strike: strike
                        .parse::<Decimal>()
                        .map_err(|e| format!("bad strike in '{name}': {e}"))?,
                    expiry: parse_expiry(date)?,
                    option_type,
                }
            }
            _ => return Err(format!("unrecognized instrument name: '{name}'")),
        };

        Ok(Self {
            name: name.to_string(),
            underlying,
            kind,
        })
    }

    /// The perpetual hedge instrument for an underlying.
    pub fn perpetual(underlying: &str) -> Self {
        Self {
            name: format!("{underlying}-PERPETUAL"),
            underlying: underlying.to_string(),
            kind: ContractKind::Perpetual,
        }
    }

    /// Whether the contract has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.kind.expiry().is_some_and(|exp| exp <= now)
    }

    /// Years remaining to expiry, clamped at zero. `None` for perpetuals.
    pub fn years_to_expiry(&self, now: DateTime<Utc>) -> Option<f64> {
        const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;
        self.kind.expiry().map(|exp| {
            let secs = (exp - now).num_seconds().max(0) as f64;
            secs / SECONDS_PER_YEAR
        })
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Parse a `DDMMMYY` expiry (venue convention, e.g. `26SEP25`).
fn parse_expiry(s: &str) -> Result<DateTime<Utc>, String> {
    if s.len() < 5 || s.len() > 7 {
        return Err(format!("bad expiry date: '{s}'"));
    }
    let (day_str, rest) = s.split_at(s.len() - 5);
    let (mon_str, year_str) = rest.split_at(3);

    let day: u32 = day_str.parse().map_err(|_| format!("bad expiry day: '{s}'"))?;
    let month = match mon_str {
        "JAN" => 1,
        "FEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" => 8,
        "SEP" => 9,
        "OCT" => 10,
        "NOV" => 11,
        "DEC" => 12,
        _ => return Err(format!("bad expiry month: '{s}'")),
    };
    let year: i32 = year_str
        .parse::<i32>()
        .map(|y| 2000 + y)
        .map_err(|_| format!("bad expiry year: '{s}'"))?;

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .ok_or_else(|| format!("invalid expiry date: '{s}'"))?;
    let naive = date
        .and_hms_opt(EXPIRY_HOUR_UTC, 0, 0)
        .ok_or_else(|| format!("invalid expiry time: '{s}'"))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Venue-reported contract parameters for an instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub name: String,
    pub lot_size: Decimal,
    pub tick_size: Decimal,
    /// Inverse contracts are quoted in underlying terms; exposure inverts
    /// with price.
    pub is_inverse: bool,
}

impl InstrumentSpec {
    /// Conservative defaults used until the venue reports the real values.
    pub fn defaults_for(instrument: &Instrument) -> Self {
        let lot_size = if instrument.kind.is_option() {
            dec!(0.1)
        } else {
            dec!(0.001)
        };
        Self {
            name: instrument.name.clone(),
            lot_size,
            tick_size: dec!(0.5),
            is_inverse: false,
        }
    }
}
