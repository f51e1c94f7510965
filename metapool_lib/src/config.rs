// Copyright (C) 2025, 2026 Metapool Developers (see AUTHORS)
//
// This file is part of Metapool
//
// Metapool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Metapool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Metapool. If not, see <https://www.gnu.org/licenses/>.

use crate::payouts::unlocker::MIN_DEPTH;
use mvsdrpc::MvsdRpcConfig;
use serde::Deserialize;
use std::time::Duration;
use stratum::config::StratumPortConfig;
use stratum::validate::is_valid_address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Log to console when true, otherwise to `file` if set
    #[serde(default = "default_console")]
    pub console: bool,
    pub file: Option<String>,
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_console() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// How long a share contributes to hashrate before it expires, e.g. "30m"
    pub hashrate_window: String,
    /// How often to poll the node for fresh work, e.g. "2s"
    pub template_refresh_interval: String,
    pub stratum: Vec<StratumPortConfig>,
}

/// Block-unlocker configuration. The depths gate when a found block is
/// trusted enough to credit: provisionally at `immature_depth`
/// confirmations, finally at `depth`.
#[derive(Debug, Deserialize, Clone)]
pub struct UnlockerConfig {
    pub enabled: bool,
    /// Pool fee in percent, e.g. 1.0
    pub pool_fee: f64,
    #[serde(default)]
    pub donate: bool,
    pub depth: u64,
    pub immature_depth: u64,
    /// Keep coinbase surplus (tx fees) with the pool instead of folding it
    /// into the miner reward
    pub keep_tx_fees: bool,
    /// Reconciliation interval, e.g. "10m"
    pub interval: String,
    /// Node RPC endpoint the unlocker talks to
    pub daemon: String,
    pub timeout: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub password: String,
    /// Pool payout address expected in on-chain coinbases
    pub address: String,
    pub pool_fee_address: String,
}

impl UnlockerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.immature_depth < MIN_DEPTH {
            return Err(ConfigError::Invalid(format!(
                "immature depth can't be < {}, yours is {}",
                MIN_DEPTH, self.immature_depth
            )));
        }
        if self.depth < 2 * self.immature_depth {
            return Err(ConfigError::Invalid(format!(
                "block maturity depth can't be < {}, yours is {}",
                2 * self.immature_depth,
                self.depth
            )));
        }
        if self.pool_fee_address.is_empty() {
            return Err(ConfigError::Invalid(
                "pool_fee_address not set in config".to_string(),
            ));
        }
        if !is_valid_address(&self.pool_fee_address) {
            return Err(ConfigError::Invalid(format!(
                "invalid pool_fee_address {}",
                self.pool_fee_address
            )));
        }
        if !self.pool_fee.is_finite() || self.pool_fee < 0.0 || self.pool_fee > 100.0 {
            return Err(ConfigError::Invalid(format!(
                "pool_fee must be a percentage, got {}",
                self.pool_fee
            )));
        }
        parse_duration(&self.interval)?;
        parse_duration(&self.timeout)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub upstream: MvsdRpcConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub proxy: ProxyConfig,
    pub unlocker: UnlockerConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("METAPOOL").separator("_"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string; used by tests and embedded defaults.
    pub fn load_str(toml: &str) -> Result<Self, ConfigError> {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_duration(&self.upstream.timeout)?;
        parse_duration(&self.proxy.hashrate_window)?;
        parse_duration(&self.proxy.template_refresh_interval)?;
        if self.unlocker.enabled {
            self.unlocker.validate()?;
        }
        Ok(())
    }

    pub fn hashrate_window(&self) -> Duration {
        parse_duration(&self.proxy.hashrate_window).unwrap_or(Duration::from_secs(600))
    }
}

/// Parse a human duration: bare seconds or a value with an ms/s/m/h suffix.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let parse = |digits: &str, unit: &str| -> Result<u64, ConfigError> {
        digits
            .parse::<u64>()
            .map_err(|_| ConfigError::Invalid(format!("can't parse duration `{s}` as {unit}")))
    };
    if let Some(digits) = s.strip_suffix("ms") {
        return Ok(Duration::from_millis(parse(digits, "milliseconds")?));
    }
    if let Some(digits) = s.strip_suffix('s') {
        return Ok(Duration::from_secs(parse(digits, "seconds")?));
    }
    if let Some(digits) = s.strip_suffix('m') {
        return Ok(Duration::from_secs(parse(digits, "minutes")? * 60));
    }
    if let Some(digits) = s.strip_suffix('h') {
        return Ok(Duration::from_secs(parse(digits, "hours")? * 3600));
    }
    Ok(Duration::from_secs(parse(s, "seconds")?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(depth: u64, immature_depth: u64, pool_fee_address: &str) -> String {
        format!(
            r#"
            [upstream]
            name = "main"
            url = "http://127.0.0.1:8820/rpc"
            account = "pool"
            password = "secret"
            timeout = "10s"

            [store]
            path = "./data"

            [logging]
            console = true
            level = "info"

            [proxy]
            hashrate_window = "30m"
            template_refresh_interval = "2s"

            [[proxy.stratum]]
            name = "stratum-low"
            enabled = true
            listen = "0.0.0.0:8008"
            difficulty = 2000

            [unlocker]
            enabled = true
            pool_fee = 1.0
            depth = {depth}
            immature_depth = {immature_depth}
            keep_tx_fees = false
            interval = "10m"
            daemon = "http://127.0.0.1:8820/rpc"
            timeout = "10s"
            address = "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox"
            pool_fee_address = "{pool_fee_address}"
            "#
        )
    }

    #[test]
    fn test_load_valid_config() {
        let config = Config::load_str(&sample(32, 16, "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox"))
            .unwrap();
        assert_eq!(config.proxy.stratum.len(), 1);
        assert_eq!(config.proxy.stratum[0].difficulty, 2000);
        assert_eq!(config.unlocker.depth, 32);
        assert!(!config.unlocker.donate);
        assert_eq!(config.hashrate_window(), Duration::from_secs(1800));
    }

    #[test]
    fn test_startup_fails_on_shallow_immature_depth() {
        let err = Config::load_str(&sample(32, 15, "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_startup_fails_when_depth_below_twice_immature() {
        let err = Config::load_str(&sample(39, 20, "MVaJ6MDd8fg45bbXzqQSojgjcBPJ2dBvox"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_startup_fails_on_bad_pool_fee_address() {
        let err = Config::load_str(&sample(32, 16, "not-an-address")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }
}
