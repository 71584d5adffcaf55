//! Run-level settings.
//!
//! Layered with `figment`: built-in defaults, then an optional TOML file,
//! then `DAGLOADER_`-prefixed environment variables
//! (e.g. `DAGLOADER_MAX_ATTEMPTS=5`, `DAGLOADER_RETRY_DELAY=60`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Attempts per task, first attempt included.
    pub max_attempts: u32,
    /// Fixed wait between attempts, in seconds when serialized.
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    /// Tasks allowed to run at once; also the warehouse connection budget.
    pub max_concurrent_tasks: usize,
    /// Abort the run once this much time has passed.
    #[serde(with = "opt_duration_secs")]
    pub run_timeout: Option<Duration>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(5 * 60),
            max_concurrent_tasks: 4,
            run_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("max_concurrent_tasks must be at least 1")]
    ZeroConcurrency,
}

impl RunConfig {
    pub fn load(path: Option<&Path>) -> Result<Self, Box<figment::Error>> {
        let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("DAGLOADER_"));
        figment.extract().map_err(Box::new)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.max_concurrent_tasks == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: self.retry_delay,
        }
    }
}

/// Durations travel as (possibly fractional) seconds: `300`, `0.25`.
mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        from_secs(f64::deserialize(d)?)
    }

    pub(super) fn from_secs<E: Error>(secs: f64) -> Result<Duration, E> {
        Duration::try_from_secs_f64(secs)
            .map_err(|e| E::custom(format!("invalid duration {secs}: {e}")))
    }
}

mod opt_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(super::duration_secs::from_secs::<D::Error>)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_hourly_pipeline() {
        let config = RunConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(300));
        assert!(config.run_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_defaults() {
        let config: RunConfig = Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::string("max_attempts = 5\nretry_delay = 10\nrun_timeout = 3600"))
            .extract()
            .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(10));
        assert_eq!(config.run_timeout, Some(Duration::from_secs(3600)));
        assert_eq!(config.max_concurrent_tasks, 4);
    }

    #[test]
    fn sub_second_durations_survive_a_reload() {
        let config = RunConfig {
            retry_delay: Duration::from_millis(250),
            run_timeout: Some(Duration::from_millis(1500)),
            ..Default::default()
        };
        let reloaded: RunConfig = Figment::from(Serialized::defaults(config.clone()))
            .extract()
            .unwrap();
        assert_eq!(reloaded, config);

        let from_toml: RunConfig = Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::string("retry_delay = 0.5"))
            .extract()
            .unwrap();
        assert_eq!(from_toml.retry_delay, Duration::from_millis(500));
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result = Figment::from(Serialized::defaults(RunConfig::default()))
            .merge(Toml::string("retry_delay = -1"))
            .extract::<RunConfig>();
        assert!(result.is_err());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = RunConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroAttempts));

        let config = RunConfig {
            max_concurrent_tasks: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let policy = RunConfig::default().retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay, Duration::from_secs(300));
    }
}
