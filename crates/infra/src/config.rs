//! Environment-driven settings for the worker process.
//!
//! Everything is read through a lookup function so tests can feed a map
//! instead of touching the process environment.

use std::str::FromStr;
use std::time::Duration;

use escrowbox_core::WorkerId;

use crate::handlers::EscrowFundSettings;
use crate::jobs::{RetryPolicy, WorkerConfig};
use crate::ledger::AssetRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("invalid {key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

fn parsed<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Integer setting that must not be zero.
fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
    T::Err: std::fmt::Display,
{
    let value: T = parsed(lookup, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: lookup(key).unwrap_or_default(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

/// Upper bound for millisecond settings. Keeps clock arithmetic on them far
/// from the calendar's limits.
const MAX_SETTING_MILLIS: u64 = 7 * 24 * 60 * 60 * 1000;

fn positive_millis<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    let ms: u64 = positive(lookup, key, default_ms)?;
    if ms > MAX_SETTING_MILLIS {
        return Err(ConfigError::Invalid {
            key,
            value: ms.to_string(),
            reason: format!("must be at most {MAX_SETTING_MILLIS} (7 days)"),
        });
    }
    Ok(Duration::from_millis(ms))
}

/// Outbox worker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub database_url: String,
    pub worker_id: WorkerId,
    pub worker: WorkerConfig,
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = required(&lookup, "DATABASE_URL")?;

        let worker_id = match lookup("WORKER_ID").filter(|v| !v.trim().is_empty()) {
            Some(id) => WorkerId::new(id),
            None => {
                let host = lookup("HOSTNAME").unwrap_or_else(|| "worker".to_string());
                WorkerId::for_process(&host)
            }
        };

        let defaults = WorkerConfig::default();
        let batch_size: usize = positive(&lookup, "OUTBOX_BATCH_SIZE", defaults.batch_size)?;
        let poll_interval =
            positive_millis(&lookup, "OUTBOX_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let lock_timeout =
            positive_millis(&lookup, "OUTBOX_LOCK_TIMEOUT_MS", Duration::from_secs(60))?;

        let retry_defaults = RetryPolicy::default();
        let max_attempts: u32 =
            positive(&lookup, "OUTBOX_MAX_ATTEMPTS", retry_defaults.max_attempts)?;
        let base_delay =
            positive_millis(&lookup, "OUTBOX_RETRY_BASE_MS", retry_defaults.base_delay)?;
        let max_delay = positive_millis(&lookup, "OUTBOX_RETRY_CAP_MS", retry_defaults.max_delay)?;

        Ok(Self {
            database_url,
            worker_id,
            worker: WorkerConfig {
                batch_size,
                poll_interval,
            },
            lock_timeout,
            retry: RetryPolicy::exponential(max_attempts, base_delay, max_delay),
        })
    }
}

/// Ledger access for the `ESCROW_FUND` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSettings {
    pub rpc_url: String,
    pub contract_id: String,
    pub funding_account: String,
    pub assets: AssetRegistry,
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl LedgerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = required(&lookup, "LEDGER_RPC_URL")?;
        let contract_id = required(&lookup, "ESCROW_CONTRACT_ID")?;
        let funding_account = required(&lookup, "FUNDING_ACCOUNT")?;

        let assets = match lookup("ASSET_CONTRACTS").filter(|v| !v.trim().is_empty()) {
            Some(raw) => parse_assets(&raw)?,
            None => AssetRegistry::testnet(),
        };

        let defaults = EscrowFundSettings::new("", "");
        let poll_interval =
            positive_millis(&lookup, "LEDGER_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let max_polls: u32 = positive(&lookup, "LEDGER_MAX_POLLS", defaults.max_polls)?;

        Ok(Self {
            rpc_url,
            contract_id,
            funding_account,
            assets,
            poll_interval,
            max_polls,
        })
    }

    pub fn escrow_fund(&self) -> EscrowFundSettings {
        EscrowFundSettings {
            contract_id: self.contract_id.clone(),
            funding_account: self.funding_account.clone(),
            poll_interval: self.poll_interval,
            max_polls: self.max_polls,
        }
    }
}

/// Parse `CODE=CONTRACT,CODE=CONTRACT`.
fn parse_assets(raw: &str) -> Result<AssetRegistry, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid {
        key: "ASSET_CONTRACTS",
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let mut assets = AssetRegistry::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (code, contract) = entry
            .split_once('=')
            .ok_or_else(|| invalid("expected CODE=CONTRACT"))?;
        let (code, contract) = (code.trim(), contract.trim());
        if code.is_empty() || contract.is_empty() {
            return Err(invalid("empty asset code or contract"));
        }
        assets = assets.with(code, contract);
    }
    if assets.is_empty() {
        return Err(invalid("no assets listed"));
    }
    Ok(assets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::assets::TESTNET_USDC;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn worker_settings_defaults() {
        let settings = WorkerSettings::from_lookup(env(&[
            ("DATABASE_URL", "postgres://localhost/escrow"),
            ("HOSTNAME", "box-1"),
        ]))
        .unwrap();

        assert_eq!(settings.worker, WorkerConfig::default());
        assert_eq!(settings.lock_timeout, Duration::from_secs(60));
        assert_eq!(settings.retry, RetryPolicy::default());
        assert!(settings.worker_id.as_str().starts_with("box-1-"));
    }

    #[test]
    fn worker_settings_overrides() {
        let settings = WorkerSettings::from_lookup(env(&[
            ("DATABASE_URL", "postgres://localhost/escrow"),
            ("WORKER_ID", "worker-a"),
            ("OUTBOX_BATCH_SIZE", "5"),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_LOCK_TIMEOUT_MS", "30000"),
            ("OUTBOX_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(settings.worker_id.as_str(), "worker-a");
        assert_eq!(settings.worker.batch_size, 5);
        assert_eq!(settings.worker.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.lock_timeout, Duration::from_secs(30));
        assert_eq!(settings.retry.max_attempts, 3);
    }

    #[test]
    fn worker_settings_reject_bad_values() {
        assert_eq!(
            WorkerSettings::from_lookup(env(&[])),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
        assert!(matches!(
            WorkerSettings::from_lookup(env(&[
                ("DATABASE_URL", "postgres://x"),
                ("OUTBOX_POLL_INTERVAL_MS", "0"),
            ])),
            Err(ConfigError::Invalid { key: "OUTBOX_POLL_INTERVAL_MS", .. })
        ));
        assert!(matches!(
            WorkerSettings::from_lookup(env(&[
                ("DATABASE_URL", "postgres://x"),
                ("OUTBOX_BATCH_SIZE", "lots"),
            ])),
            Err(ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. })
        ));
    }

    #[test]
    fn worker_settings_bound_durations_and_attempts() {
        let with = |key: &'static str, value: &'static str| {
            WorkerSettings::from_lookup(env(&[("DATABASE_URL", "postgres://x"), (key, value)]))
        };

        for key in [
            "OUTBOX_LOCK_TIMEOUT_MS",
            "OUTBOX_POLL_INTERVAL_MS",
            "OUTBOX_RETRY_BASE_MS",
            "OUTBOX_RETRY_CAP_MS",
        ] {
            assert!(
                matches!(
                    with(key, "9000000000000000"),
                    Err(ConfigError::Invalid { key: k, .. }) if k == key
                ),
                "{key} accepted an unbounded value"
            );
        }
        assert_eq!(
            with("OUTBOX_LOCK_TIMEOUT_MS", "604800000")
                .unwrap()
                .lock_timeout,
            Duration::from_secs(7 * 24 * 60 * 60)
        );

        assert_eq!(
            with("OUTBOX_MAX_ATTEMPTS", "0"),
            Err(ConfigError::Invalid {
                key: "OUTBOX_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            })
        );
        assert_eq!(with("OUTBOX_MAX_ATTEMPTS", "1").unwrap().retry.max_attempts, 1);
    }

    #[test]
    fn ledger_settings_parse_assets() {
        let base = [
            ("LEDGER_RPC_URL", "https://rpc.example"),
            ("ESCROW_CONTRACT_ID", "CESCROW"),
            ("FUNDING_ACCOUNT", "GFUNDER"),
        ];

        let defaults = LedgerSettings::from_lookup(env(&base)).unwrap();
        assert_eq!(defaults.assets.contract_for("USDC"), Some(TESTNET_USDC));
        assert_eq!(defaults.escrow_fund().max_polls, 20);

        let mut custom = base.to_vec();
        custom.push(("ASSET_CONTRACTS", "EURC=CEURC, USDC=CUSDC"));
        custom.push(("LEDGER_MAX_POLLS", "3"));
        let settings = LedgerSettings::from_lookup(env(&custom)).unwrap();
        assert_eq!(settings.assets.contract_for("EURC"), Some("CEURC"));
        assert_eq!(settings.assets.contract_for("USDC"), Some("CUSDC"));
        assert_eq!(settings.assets.contract_for("XLM"), None);
        assert_eq!(settings.escrow_fund().contract_id, "CESCROW");
        assert_eq!(settings.escrow_fund().max_polls, 3);

        let mut broken = base.to_vec();
        broken.push(("ASSET_CONTRACTS", "USDC"));
        assert!(matches!(
            LedgerSettings::from_lookup(env(&broken)),
            Err(ConfigError::Invalid { key: "ASSET_CONTRACTS", .. })
        ));
    }
}
