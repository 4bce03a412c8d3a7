use crate::application::hedging::{HedgerConfig, StepMode};
use anyhow::{Context, Result};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const MAINNET_WS_URL: &str = "wss://www.deribit.com/ws/api/v2";
const TESTNET_WS_URL: &str = "wss://test.deribit.com/ws/api/v2";

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub key: String,
    pub secret: String,
    pub testnet: bool,
    pub ws_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    pub portfolios_dir: PathBuf,
    pub hedging: HedgerConfig,
}

/// Optional TOML config file; every key can be overridden from the
/// environment.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    exchange: FileExchange,
    portfolios_dir: Option<String>,
    #[serde(default)]
    hedging: FileHedging,
}

#[derive(Debug, Default, Deserialize)]
struct FileExchange {
    key: Option<String>,
    secret: Option<String>,
    testnet: Option<bool>,
    ws_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileHedging {
    target_delta: Option<Decimal>,
    min_trigger_delta: Option<Decimal>,
    step_mode: Option<String>,
    step_size: Option<Decimal>,
    price_check_interval: Option<u64>,
    min_hedge_usd: Option<Decimal>,
}

impl Config {
    /// Load configuration: optional TOML file first (path from
    /// `DNEUTRAL_CONFIG`, default `dneutral.toml`), environment overrides on
    /// top. Invalid values are fatal at startup.
    pub fn load() -> Result<Self> {
        let file = Self::read_file()?;
        Self::from_sources(file)
    }

    fn read_file() -> Result<FileConfig> {
        let path = env::var("DNEUTRAL_CONFIG").unwrap_or_else(|_| "dneutral.toml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                toml::from_str(&content).with_context(|| format!("Failed to parse {path}"))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {path}")),
        }
    }

    fn from_sources(file: FileConfig) -> Result<Self> {
        let key = env::var("EXCHANGE_KEY")
            .ok()
            .or(file.exchange.key)
            .unwrap_or_default();
        let secret = env::var("EXCHANGE_SECRET")
            .ok()
            .or(file.exchange.secret)
            .unwrap_or_default();
        if key.is_empty() || secret.is_empty() {
            anyhow::bail!("EXCHANGE_KEY and EXCHANGE_SECRET must be set");
        }

        let testnet = match env::var("EXCHANGE_TESTNET") {
            Ok(v) => v
                .parse::<bool>()
                .context("Failed to parse EXCHANGE_TESTNET")?,
            Err(_) => file.exchange.testnet.unwrap_or(true),
        };

        let ws_url = env::var("EXCHANGE_WS_URL")
            .ok()
            .or(file.exchange.ws_url)
            .unwrap_or_else(|| {
                if testnet {
                    TESTNET_WS_URL.to_string()
                } else {
                    MAINNET_WS_URL.to_string()
                }
            });

        let portfolios_dir = env::var("PORTFOLIOS_DIR")
            .ok()
            .or(file.portfolios_dir)
            .unwrap_or_else(|| "portfolios".to_string());

        let target_delta = match env::var("HEDGE_TARGET_DELTA") {
            Ok(v) => parse_decimal(&v).context("Failed to parse HEDGE_TARGET_DELTA")?,
            Err(_) => file.hedging.target_delta.unwrap_or(Decimal::ZERO),
        };

        let defaults = HedgerConfig::default();

        let min_trigger_delta = match env::var("HEDGE_MIN_TRIGGER_DELTA") {
            Ok(v) => parse_decimal(&v).context("Failed to parse HEDGE_MIN_TRIGGER_DELTA")?,
            Err(_) => file
                .hedging
                .min_trigger_delta
                .unwrap_or(defaults.min_trigger_delta),
        };

        let step_mode = match env::var("HEDGE_STEP_MODE") {
            Ok(v) => StepMode::from_str(&v)?,
            Err(_) => match file.hedging.step_mode {
                Some(s) => StepMode::from_str(&s)?,
                None => defaults.step_mode,
            },
        };

        let step_size = match env::var("HEDGE_STEP_SIZE") {
            Ok(v) => parse_decimal(&v).context("Failed to parse HEDGE_STEP_SIZE")?,
            Err(_) => file.hedging.step_size.unwrap_or(defaults.step_size),
        };

        let price_check_interval = match env::var("HEDGE_PRICE_CHECK_INTERVAL_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse::<u64>()
                    .context("Failed to parse HEDGE_PRICE_CHECK_INTERVAL_SECS")?,
            ),
            Err(_) => file
                .hedging
                .price_check_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.price_check_interval),
        };

        let min_hedge_usd = match env::var("HEDGE_MIN_HEDGE_USD") {
            Ok(v) => parse_decimal(&v).context("Failed to parse HEDGE_MIN_HEDGE_USD")?,
            Err(_) => file.hedging.min_hedge_usd.unwrap_or(defaults.min_hedge_usd),
        };

        if step_size <= Decimal::ZERO {
            anyhow::bail!("HEDGE_STEP_SIZE must be positive");
        }
        if min_trigger_delta < Decimal::ZERO {
            anyhow::bail!("HEDGE_MIN_TRIGGER_DELTA must not be negative");
        }
        if price_check_interval.is_zero() {
            anyhow::bail!("HEDGE_PRICE_CHECK_INTERVAL_SECS must be positive");
        }

        Ok(Config {
            exchange: ExchangeConfig {
                key,
                secret,
                testnet,
                ws_url,
            },
            portfolios_dir: PathBuf::from(portfolios_dir),
            hedging: HedgerConfig {
                target_delta,
                min_trigger_delta,
                step_mode,
                step_size,
                price_check_interval,
                min_hedge_usd,
                ..defaults
            },
        })
    }
}

fn parse_decimal(s: &str) -> Result<Decimal> {
    if let Ok(d) = Decimal::from_str(s) {
        return Ok(d);
    }
    let f = s.parse::<f64>()?;
    Decimal::from_f64(f).with_context(|| format!("value out of range: {s}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base_file() -> FileConfig {
        FileConfig {
            exchange: FileExchange {
                key: Some("k".into()),
                secret: Some("s".into()),
                testnet: Some(true),
                ws_url: None,
            },
            portfolios_dir: Some("/tmp/pf".into()),
            hedging: FileHedging::default(),
        }
    }

    #[test]
    fn file_values_and_defaults() {
        let cfg = Config::from_sources(base_file()).unwrap();
        assert_eq!(cfg.exchange.ws_url, TESTNET_WS_URL);
        assert_eq!(cfg.portfolios_dir, PathBuf::from("/tmp/pf"));
        assert_eq!(cfg.hedging.step_mode, StepMode::Absolute);
        assert_eq!(cfg.hedging.min_hedge_usd, dec!(10));
    }

    #[test]
    fn missing_credentials_fail() {
        let mut file = base_file();
        file.exchange.key = None;
        // Only meaningful when the env override is absent.
        if env::var("EXCHANGE_KEY").is_err() {
            assert!(Config::from_sources(file).is_err());
        }
    }

    #[test]
    fn hedging_file_section_is_applied() {
        let mut file = base_file();
        file.hedging.step_mode = Some("percentage".into());
        file.hedging.step_size = Some(dec!(0.05));
        file.hedging.price_check_interval = Some(10);

        let cfg = Config::from_sources(file).unwrap();
        assert_eq!(cfg.hedging.step_mode, StepMode::Percentage);
        assert_eq!(cfg.hedging.step_size, dec!(0.05));
        assert_eq!(cfg.hedging.price_check_interval, Duration::from_secs(10));
    }

    #[test]
    fn zero_step_size_is_rejected() {
        let mut file = base_file();
        file.hedging.step_size = Some(Decimal::ZERO);
        assert!(Config::from_sources(file).is_err());
    }

    #[test]
    fn mainnet_url_when_not_testnet() {
        let mut file = base_file();
        file.exchange.testnet = Some(false);
        if env::var("EXCHANGE_TESTNET").is_err() && env::var("EXCHANGE_WS_URL").is_err() {
            let cfg = Config::from_sources(file).unwrap();
            assert_eq!(cfg.exchange.ws_url, MAINNET_WS_URL);
        }
    }

    #[test]
    fn decimal_parsing_accepts_plain_and_float_forms() {
        assert_eq!(parse_decimal("0.01").unwrap(), dec!(0.01));
        assert_eq!(parse_decimal("5").unwrap(), dec!(5));
        assert!(parse_decimal("abc").is_err());
    }
}
