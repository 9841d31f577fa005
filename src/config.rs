//! Run configuration: retry policy defaults and the run timeout.
//!
//! Sources, lowest priority first:
//! 1. built-in defaults (2 retries, 5 s delay, no timeout)
//! 2. a TOML file (`retries`, `retry_delay_ms`, `timeout_ms`)
//! 3. `TASKFLOW_RETRIES`, `TASKFLOW_RETRY_DELAY_MS`, `TASKFLOW_TIMEOUT_MS`

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::{FlowError, Result, RetryPolicy, RunContext};

pub const ENV_RETRIES: &str = "TASKFLOW_RETRIES";
pub const ENV_RETRY_DELAY_MS: &str = "TASKFLOW_RETRY_DELAY_MS";
pub const ENV_TIMEOUT_MS: &str = "TASKFLOW_TIMEOUT_MS";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub retries: u32,
    pub retry_delay: Duration,
    pub timeout: Option<Duration>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            retries: policy.retries,
            retry_delay: policy.delay,
            timeout: None,
        }
    }
}

/// On-disk shape. Every key is optional and falls back to the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawFlowConfig {
    retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    timeout_ms: Option<u64>,
}

impl FlowConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawFlowConfig = toml::from_str(s)?;
        let mut cfg = Self::default();
        if let Some(retries) = raw.retries {
            cfg.retries = retries;
        }
        if let Some(ms) = raw.retry_delay_ms {
            cfg.retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.timeout_ms {
            cfg.timeout = Some(Duration::from_millis(ms));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let cfg = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), ?cfg, "loaded flow config");
        Ok(cfg)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Applies environment-style overrides taken from `lookup`.
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_RETRIES) {
            self.retries = parse_env(ENV_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_DELAY_MS) {
            self.retry_delay = Duration::from_millis(parse_env(ENV_RETRY_DELAY_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_TIMEOUT_MS) {
            self.timeout = Some(Duration::from_millis(parse_env(ENV_TIMEOUT_MS, &v)?));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry_delay > MAX_RETRY_DELAY {
            return Err(FlowError::Config(format!(
                "retry delay {:?} exceeds the maximum of {:?}",
                self.retry_delay, MAX_RETRY_DELAY
            )));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(FlowError::Config("timeout must be greater than zero".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.retry_delay)
    }

    /// A fresh run context carrying the configured timeout, if any.
    pub fn context(&self) -> RunContext {
        match self.timeout {
            Some(timeout) => RunContext::with_timeout(timeout),
            None => RunContext::new(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FlowError::Config(format!("{key}: invalid value {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_business_pipeline() {
        let cfg = FlowConfig::default();
        assert_eq!(cfg.retries, 2);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.timeout, None);
        assert_eq!(cfg.retry_policy().max_attempts(), 3);
    }

    #[test]
    fn toml_overrides_only_given_keys() {
        let cfg = FlowConfig::from_toml_str("retries = 4\ntimeout_ms = 30000\n").unwrap();
        assert_eq!(cfg.retries, 4);
        assert_eq!(cfg.retry_delay, Duration::from_secs(5));
        assert_eq!(cfg.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn unknown_toml_key_is_rejected() {
        let err = FlowConfig::from_toml_str("retry = 4\n").unwrap_err();
        assert!(matches!(err, FlowError::Toml(_)));
    }

    #[test]
    fn load_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "retry_delay_ms = 250").unwrap();

        let cfg = FlowConfig::load(file.path()).unwrap();
        assert_eq!(cfg.retry_delay, Duration::from_millis(250));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = FlowConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, FlowError::Io(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = FlowConfig::default()
            .overlay_env(env(&[(ENV_RETRIES, "0"), (ENV_RETRY_DELAY_MS, " 100 ")]))
            .unwrap();
        assert_eq!(cfg.retries, 0);
        assert_eq!(cfg.retry_delay, Duration::from_millis(100));
    }

    #[test]
    fn bad_env_value_is_config_error() {
        let err = FlowConfig::default()
            .overlay_env(env(&[(ENV_RETRIES, "many")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: TASKFLOW_RETRIES: invalid value \"many\""
        );
    }

    #[test]
    fn validation_limits() {
        let too_slow = FlowConfig {
            retry_delay: Duration::from_secs(3600),
            ..FlowConfig::default()
        };
        assert!(too_slow.validate().is_err());

        let zero_timeout = FlowConfig {
            timeout: Some(Duration::ZERO),
            ..FlowConfig::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[tokio::test]
    async fn context_carries_timeout() {
        let cfg = FlowConfig {
            timeout: Some(Duration::from_secs(10)),
            ..FlowConfig::default()
        };
        assert!(cfg.context().deadline_at().is_some());
        assert!(FlowConfig::default().context().deadline_at().is_none());
    }
}
