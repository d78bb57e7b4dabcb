//! Environment-driven configuration
//!
//! Every value has a default so the demo binary runs with an empty
//! environment. Call `dotenv::dotenv()` before `AppConfig::from_env()`.

use crate::error::{Result, WorkflowError};
use crate::models::DEFAULT_CONFIDENCE_THRESHOLD;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// How allocations are compared to the call amount before confirmation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Sum must equal the amount
    Exact,
    /// Over-allocation blocks, under-allocation warns
    #[default]
    NotExceed,
    /// Mismatches are reported but never block
    FlagOnly,
}

impl FromStr for AllocationPolicy {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(AllocationPolicy::Exact),
            "not_exceed" | "not-exceed" => Ok(AllocationPolicy::NotExceed),
            "flag_only" | "flag-only" => Ok(AllocationPolicy::FlagOnly),
            other => Err(WorkflowError::ConfigError(format!(
                "unknown allocation policy '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccountingApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub company_name: Option<String>,
    pub timeout: Duration,
    pub page_limit: u32,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
}

impl Default for AccountingApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            token: None,
            company_name: None,
            timeout: Duration::from_secs(30),
            page_limit: 100,
            poll_interval: Duration::from_millis(1_000),
            poll_max_attempts: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowConfig {
    pub allocation_policy: AllocationPolicy,
    pub confidence_threshold: f32,
    pub max_steps_per_turn: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            allocation_policy: AllocationPolicy::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            max_steps_per_turn: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub port: u16,
    pub accounting: AccountingApiConfig,
    pub retry: RetryConfig,
    pub workflow: WorkflowConfig,
    pub gemini_api_key: Option<String>,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            accounting: AccountingApiConfig::default(),
            retry: RetryConfig::default(),
            workflow: WorkflowConfig::default(),
            gemini_api_key: None,
            database_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = AppConfig::default();

        let port = match get("PORT").or_else(|| get("API_PORT")) {
            Some(v) => parse_value("PORT", &v)?,
            None => defaults.port,
        };

        let accounting = AccountingApiConfig {
            base_url: get("ACCOUNTING_API_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.accounting.base_url),
            token: get("ACCOUNTING_API_TOKEN"),
            company_name: get("ACCOUNTING_COMPANY_NAME"),
            timeout: Duration::from_secs(parse_or(
                &get,
                "ACCOUNTING_TIMEOUT_SECS",
                defaults.accounting.timeout.as_secs(),
            )?),
            page_limit: parse_or(&get, "ACCOUNTING_PAGE_LIMIT", defaults.accounting.page_limit)?,
            poll_interval: Duration::from_millis(parse_or(
                &get,
                "TASK_POLL_INTERVAL_MS",
                defaults.accounting.poll_interval.as_millis() as u64,
            )?),
            poll_max_attempts: parse_or(
                &get,
                "TASK_POLL_MAX_ATTEMPTS",
                defaults.accounting.poll_max_attempts,
            )?,
        };

        let retry = RetryConfig {
            max_retries: parse_or(&get, "RETRY_MAX_RETRIES", defaults.retry.max_retries)?,
            initial_backoff: Duration::from_millis(parse_or(
                &get,
                "RETRY_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff.as_millis() as u64,
            )?),
            max_backoff: Duration::from_millis(parse_or(
                &get,
                "RETRY_MAX_BACKOFF_MS",
                defaults.retry.max_backoff.as_millis() as u64,
            )?),
        };

        let confidence_threshold: f32 = parse_or(
            &get,
            "CONFIDENCE_THRESHOLD",
            defaults.workflow.confidence_threshold,
        )?;
        if !(0.0..=1.0).contains(&confidence_threshold) {
            return Err(WorkflowError::ConfigError(format!(
                "CONFIDENCE_THRESHOLD must be within [0, 1], got {}",
                confidence_threshold
            )));
        }

        let workflow = WorkflowConfig {
            allocation_policy: match get("ALLOCATION_POLICY") {
                Some(v) => v.parse()?,
                None => defaults.workflow.allocation_policy,
            },
            confidence_threshold,
            max_steps_per_turn: parse_or(
                &get,
                "MAX_STEPS_PER_TURN",
                defaults.workflow.max_steps_per_turn,
            )?,
        };

        Ok(Self {
            port,
            accounting,
            retry,
            workflow,
            gemini_api_key: get("GEMINI_API_KEY"),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => parse_value(key, &v),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| WorkflowError::ConfigError(format!("invalid value for {}: '{}'", key, raw)))
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_from_empty_env() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.workflow.allocation_policy, AllocationPolicy::NotExceed);
        assert_eq!(config.accounting.poll_max_attempts, 60);
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("API_PORT", "8081"),
            ("ACCOUNTING_API_BASE_URL", "https://fa.example.com/"),
            ("ACCOUNTING_API_TOKEN", "secret"),
            ("ALLOCATION_POLICY", "exact"),
            ("RETRY_MAX_RETRIES", "5"),
            ("POSTGRES_URL", "postgres://localhost/cc"),
            ("GEMINI_API_KEY", "   "),
        ]))
        .unwrap();

        assert_eq!(config.port, 8081);
        assert_eq!(config.accounting.base_url, "https://fa.example.com");
        assert_eq!(config.accounting.token.as_deref(), Some("secret"));
        assert_eq!(config.workflow.allocation_policy, AllocationPolicy::Exact);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/cc"));
        assert!(config.gemini_api_key.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(AppConfig::from_lookup(lookup(&[("PORT", "eighty")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("ALLOCATION_POLICY", "loose")])).is_err());
        assert!(AppConfig::from_lookup(lookup(&[("CONFIDENCE_THRESHOLD", "1.5")])).is_err());
    }
}
