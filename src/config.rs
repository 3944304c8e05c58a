use std::env;
use std::net::SocketAddr;

use thiserror::Error;

use crate::models::plan::{PlanCatalog, DEFAULT_PLAN_CATALOG};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_FREE_TIER_QUOTA: i32 = 4;
pub const DEFAULT_LEDGER_MAX_RETRIES: usize = 3;
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Quota a tenant is demoted to when its subscription ends.
    pub free_tier_quota: i32,
    /// Extra attempts for an atomic ledger write after a transient conflict.
    pub max_retries: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            free_tier_quota: DEFAULT_FREE_TIER_QUOTA,
            max_retries: DEFAULT_LEDGER_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub ledger: LedgerSettings,
    pub plans: PlanCatalog,
    pub webhook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok(); // Load .env file
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string())
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: e.to_string(),
            })?;

        let database_max_connections = parse_or(
            get("DATABASE_MAX_CONNECTIONS"),
            "DATABASE_MAX_CONNECTIONS",
            DEFAULT_DATABASE_MAX_CONNECTIONS,
        )?;

        let free_tier_quota = parse_or(
            get("FREE_TIER_QUOTA"),
            "FREE_TIER_QUOTA",
            DEFAULT_FREE_TIER_QUOTA,
        )?;
        if free_tier_quota < 0 {
            return Err(ConfigError::Invalid {
                name: "FREE_TIER_QUOTA",
                reason: "must not be negative".to_string(),
            });
        }

        let max_retries = parse_or(
            get("LEDGER_MAX_RETRIES"),
            "LEDGER_MAX_RETRIES",
            DEFAULT_LEDGER_MAX_RETRIES,
        )?;

        let plans = PlanCatalog::parse(
            get("PLAN_CATALOG")
                .as_deref()
                .unwrap_or(DEFAULT_PLAN_CATALOG),
        )
        .map_err(|reason| ConfigError::Invalid {
            name: "PLAN_CATALOG",
            reason,
        })?;

        Ok(Config {
            database_url,
            database_max_connections,
            bind_addr,
            ledger: LedgerSettings {
                free_tier_quota,
                max_retries,
            },
            plans,
            webhook_secret: get("BILLING_WEBHOOK_SECRET"),
        })
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = Config::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/ledger")]))
            .unwrap();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.ledger.free_tier_quota, 4);
        assert_eq!(config.ledger.max_retries, 3);
        assert_eq!(config.plans.lookup("starter").map(|p| p.credits), Some(50));
        assert!(config.webhook_secret.is_none());
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("BIND_ADDR", "0.0.0.0:8080"),
            ("FREE_TIER_QUOTA", "10"),
            ("LEDGER_MAX_RETRIES", "5"),
            ("PLAN_CATALOG", "basic=25"),
            ("BILLING_WEBHOOK_SECRET", "whsec_abc"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.ledger.free_tier_quota, 10);
        assert_eq!(config.ledger.max_retries, 5);
        assert_eq!(config.plans.lookup("basic").map(|p| p.credits), Some(25));
        assert!(config.plans.lookup("starter").is_none());
        assert_eq!(config.webhook_secret.as_deref(), Some("whsec_abc"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("FREE_TIER_QUOTA", "-1"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "FREE_TIER_QUOTA",
                ..
            }
        ));

        let err = Config::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/ledger"),
            ("PLAN_CATALOG", "starter"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PLAN_CATALOG", .. }));
    }
}
