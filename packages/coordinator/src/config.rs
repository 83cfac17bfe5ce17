//! Coordinator service configuration

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use eyre::{eyre, Result};
use htlc_core::rate_limit::RateLimitConfig;
use htlc_core::{BreakerThresholds, ChainId, CoordinatorConfig, EmergencyCouncil};

/// Coordinator service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance name used in logs and /health (defaults to the hostname)
    pub instance_id: String,

    /// HTTP bind address
    pub bind_address: String,
    /// HTTP port for the API, health and metrics (default 9100)
    pub api_port: u16,

    /// Swap engine settings
    pub coordinator: CoordinatorConfig,

    /// Breaker thresholds
    pub breaker: BreakerThresholds,
    /// Interval between breaker recovery/policy ticks
    pub breaker_tick_ms: u64,

    /// Emergency council member ids
    pub emergency_council: Vec<String>,
    /// Approvals needed to engage or lift the emergency pause
    pub emergency_threshold: usize,

    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    /// Max pooled database connections
    pub database_max_connections: u32,

    /// Per-chain polling adapter base URLs (`ADAPTER_URL_<CHAIN>`)
    pub adapter_urls: BTreeMap<ChainId, String>,
    /// Upper bound on polling one chain for one operation
    pub attestation_timeout_secs: u64,
}

impl Config {
    /// Load configuration from `.env` and the environment
    pub fn load() -> Result<Self> {
        // Try to load .env file
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded .env from {:?}", path);
        }
        Self::from_env()
    }

    /// Read configuration from the process environment only
    pub fn from_env() -> Result<Self> {
        let default_id = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| format!("htlc-coordinator-{}", std::process::id()));

        let defaults = CoordinatorConfig::default();

        let consensus_chains =
            chain_list("CONSENSUS_CHAINS")?.unwrap_or(defaults.consensus_chains);
        let supported_chains = match chain_list("SUPPORTED_CHAINS")? {
            Some(chains) => chains,
            None => {
                let mut chains = consensus_chains.clone();
                if let Ok(ethereum) = ChainId::new("ethereum") {
                    if !chains.contains(&ethereum) {
                        chains.push(ethereum);
                    }
                }
                chains
            }
        };

        let coordinator = CoordinatorConfig {
            consensus_chains: consensus_chains.clone(),
            supported_chains,
            default_timelock_seconds: parse_or(
                "DEFAULT_TIMELOCK_SECS",
                defaults.default_timelock_seconds,
            )?,
            min_timelock_seconds: parse_or("MIN_TIMELOCK_SECS", defaults.min_timelock_seconds)?,
            max_timelock_seconds: parse_or("MAX_TIMELOCK_SECS", defaults.max_timelock_seconds)?,
            min_amount: parse_or("MIN_AMOUNT", defaults.min_amount)?,
            max_amount: parse_optional("MAX_AMOUNT")?,
            list_limit: parse_or("LIST_LIMIT", defaults.list_limit)?,
            rate_limit: RateLimitConfig {
                max_per_window: parse_or(
                    "RATE_LIMIT_PER_WINDOW",
                    defaults.rate_limit.max_per_window,
                )?,
                window_seconds: parse_or(
                    "RATE_LIMIT_WINDOW_SECS",
                    defaults.rate_limit.window_seconds,
                )?,
            },
        };

        let breaker_defaults = BreakerThresholds::default();
        let breaker = BreakerThresholds {
            volume_threshold: parse_or(
                "BREAKER_VOLUME_THRESHOLD",
                breaker_defaults.volume_threshold,
            )?,
            window_seconds: parse_or("BREAKER_WINDOW_SECS", breaker_defaults.window_seconds)?,
            failure_rate_limit: parse_or(
                "BREAKER_FAILURE_RATE_LIMIT",
                breaker_defaults.failure_rate_limit,
            )?,
            min_attestation_sample: parse_or(
                "BREAKER_MIN_SAMPLE",
                breaker_defaults.min_attestation_sample,
            )?,
            auto_recovery_delay_seconds: parse_or(
                "BREAKER_RECOVERY_SECS",
                breaker_defaults.auto_recovery_delay_seconds,
            )?,
        };

        let emergency_council: Vec<String> = env::var("EMERGENCY_COUNCIL")
            .ok()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut adapter_urls = BTreeMap::new();
        for chain in &consensus_chains {
            let name = adapter_url_var(chain);
            if let Some(url) = non_empty(&name) {
                adapter_urls.insert(chain.clone(), url.trim_end_matches('/').to_string());
            }
        }

        let config = Self {
            instance_id: non_empty("INSTANCE_ID").unwrap_or(default_id),
            bind_address: non_empty("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string()),
            api_port: parse_or("API_PORT", 9100)?,
            coordinator,
            breaker,
            breaker_tick_ms: parse_or("BREAKER_TICK_MS", 5000)?,
            emergency_threshold: parse_or("EMERGENCY_THRESHOLD", 2)?,
            emergency_council,
            database_url: non_empty("DATABASE_URL"),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            adapter_urls,
            attestation_timeout_secs: parse_or("ATTESTATION_TIMEOUT_SECS", 3600)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.coordinator
            .validate()
            .map_err(|e| eyre!("Invalid coordinator settings: {}", e))?;
        self.breaker
            .validate()
            .map_err(|e| eyre!("Invalid breaker settings: {}", e))?;
        if self.breaker_tick_ms == 0 {
            return Err(eyre!("BREAKER_TICK_MS must be > 0"));
        }
        if self.attestation_timeout_secs == 0 {
            return Err(eyre!("ATTESTATION_TIMEOUT_SECS must be > 0"));
        }
        self.council()?;
        Ok(())
    }

    /// Emergency council; disabled when no members are configured
    pub fn council(&self) -> Result<EmergencyCouncil> {
        if self.emergency_council.is_empty() {
            return Ok(EmergencyCouncil::disabled());
        }
        EmergencyCouncil::new(self.emergency_council.iter().cloned(), self.emergency_threshold)
            .map_err(|e| eyre!("Invalid EMERGENCY_COUNCIL/EMERGENCY_THRESHOLD: {}", e))
    }

    pub fn breaker_tick(&self) -> Duration {
        Duration::from_millis(self.breaker_tick_ms)
    }

    pub fn attestation_timeout(&self) -> Duration {
        Duration::from_secs(self.attestation_timeout_secs)
    }
}

/// `ADAPTER_URL_<CHAIN>` with the chain name upper-cased and `-` as `_`
pub fn adapter_url_var(chain: &ChainId) -> String {
    format!(
        "ADAPTER_URL_{}",
        chain.as_str().to_ascii_uppercase().replace('-', "_")
    )
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_optional(name)?.unwrap_or(default))
}

fn parse_optional<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(name) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| eyre!("Invalid {} '{}': {}", name, value, e)),
        None => Ok(None),
    }
}

fn chain_list(name: &str) -> Result<Option<Vec<ChainId>>> {
    match non_empty(name) {
        Some(value) => ChainId::parse_list(&value)
            .map(Some)
            .map_err(|e| eyre!("Invalid {} '{}': {}", name, value, e)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "INSTANCE_ID",
        "BIND_ADDRESS",
        "API_PORT",
        "CONSENSUS_CHAINS",
        "SUPPORTED_CHAINS",
        "DEFAULT_TIMELOCK_SECS",
        "MIN_TIMELOCK_SECS",
        "MAX_TIMELOCK_SECS",
        "MIN_AMOUNT",
        "MAX_AMOUNT",
        "LIST_LIMIT",
        "RATE_LIMIT_PER_WINDOW",
        "RATE_LIMIT_WINDOW_SECS",
        "BREAKER_VOLUME_THRESHOLD",
        "BREAKER_WINDOW_SECS",
        "BREAKER_FAILURE_RATE_LIMIT",
        "BREAKER_MIN_SAMPLE",
        "BREAKER_RECOVERY_SECS",
        "BREAKER_TICK_MS",
        "EMERGENCY_COUNCIL",
        "EMERGENCY_THRESHOLD",
        "DATABASE_URL",
        "DATABASE_MAX_CONNECTIONS",
        "ADAPTER_URL_ARBITRUM",
        "ADAPTER_URL_SOLANA",
        "ADAPTER_URL_TON",
        "ADAPTER_URL_CHAINA",
        "ATTESTATION_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.api_port, 9100);
        assert_eq!(
            config.coordinator.consensus_chains,
            ChainId::parse_list("arbitrum,solana,ton").unwrap()
        );
        assert!(config
            .coordinator
            .supported_chains
            .contains(&ChainId::new("ethereum").unwrap()));
        assert_eq!(config.coordinator.default_timelock_seconds, 604_800);
        assert_eq!(config.coordinator.rate_limit.max_per_window, 10);
        assert_eq!(config.breaker.volume_threshold, 500);
        assert!(config.database_url.is_none());
        assert!(config.adapter_urls.is_empty());
        assert!(config.council().unwrap().is_empty());
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    #[serial]
    fn test_overrides() {
        clear_env();
        env::set_var("API_PORT", "8088");
        env::set_var("CONSENSUS_CHAINS", "chainA, chainB, chainC");
        env::set_var("MAX_AMOUNT", "1000000");
        env::set_var("BREAKER_FAILURE_RATE_LIMIT", "0.35");
        env::set_var("EMERGENCY_COUNCIL", "alice, bob ,carol");
        env::set_var("EMERGENCY_THRESHOLD", "2");
        env::set_var("ADAPTER_URL_CHAINA", "http://adapter-a:8080/");
        env::set_var("INSTANCE_ID", "coordinator-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_port, 8088);
        assert_eq!(config.coordinator.consensus_chains[0].as_str(), "chaina");
        assert_eq!(config.coordinator.supported_chains.len(), 4);
        assert_eq!(config.coordinator.max_amount, Some(1_000_000));
        assert_eq!(config.breaker.failure_rate_limit, 0.35);
        assert_eq!(config.emergency_council, vec!["alice", "bob", "carol"]);
        assert_eq!(config.council().unwrap().threshold(), 2);
        assert_eq!(
            config.adapter_urls.get(&ChainId::new("chaina").unwrap()).map(String::as_str),
            Some("http://adapter-a:8080")
        );
        assert_eq!(config.instance_id, "coordinator-1");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_number_names_variable() {
        clear_env();
        env::set_var("API_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("API_PORT"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_two_consensus_chains() {
        clear_env();
        env::set_var("CONSENSUS_CHAINS", "arbitrum,solana");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_rejects_council_threshold_above_size() {
        clear_env();
        env::set_var("EMERGENCY_COUNCIL", "alice,bob");
        env::set_var("EMERGENCY_THRESHOLD", "3");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("EMERGENCY"));
        clear_env();
    }

    #[test]
    fn test_adapter_url_var_name() {
        let chain = ChainId::new("ton-testnet").unwrap();
        assert_eq!(adapter_url_var(&chain), "ADAPTER_URL_TON_TESTNET");
    }
}
