use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StoreConfig {
    Filesystem { base_dir: String },
    Memory,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ApiConfig {
    pub base_url: Url,
    /// Environment variable holding the bearer token. Re-read on refresh.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_token_env() -> String {
    "ASC_BEARER_TOKEN".into()
}

fn default_timeout_secs() -> u64 {
    30
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: 1.0,
            refill_per_sec: 1.0,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub window_secs: u64,
}

impl CircuitBreakerConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            threshold: 5,
            window_secs: 120,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    pub max_jitter_secs: f64,
    pub network_step_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            base_delay_secs: 10,
            max_delay_secs: 300,
            max_jitter_secs: 5.0,
            network_step_secs: 2,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct RegistryConfig {
    #[serde(default = "default_trust_window_days")]
    pub trust_window_days: u32,
    /// Key fixed range records by their date range instead of overwriting a
    /// single record per entity.
    #[serde(default)]
    pub key_fixed_range_by_window: bool,
    pub store: StoreConfig,
}

fn default_trust_window_days() -> u32 {
    180
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_prefix")]
    pub prefix: String,
}

fn default_artifacts_prefix() -> String {
    "appstore/raw/analytics/".into()
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        ArtifactsConfig {
            prefix: default_artifacts_prefix(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub registry: RegistryConfig,
    pub artifacts: Option<ArtifactsConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let yaml = r#"
            api:
                base_url: https://api.appstoreconnect.apple.com/v1
            registry:
                store:
                    type: memory
            "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.api.token_env, "ASC_BEARER_TOKEN");
        assert_eq!(config.api.timeout(), Duration::from_secs(30));
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(config.circuit_breaker.threshold, 5);
        assert_eq!(config.circuit_breaker.window(), Duration::from_secs(120));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.registry.trust_window_days, 180);
        assert!(!config.registry.key_fixed_range_by_window);
        assert_eq!(config.registry.store, StoreConfig::Memory);
        assert!(config.artifacts.is_none());
    }

    #[test]
    fn test_filesystem_store() {
        let yaml = r#"
            api:
                base_url: http://127.0.0.1:9000/v1
                timeout_secs: 5
            retry:
                max_attempts: 5
            registry:
                trust_window_days: 30
                store:
                    type: filesystem
                    base_dir: /var/lib/requestor
            artifacts: {}
            "#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            config.registry.store,
            StoreConfig::Filesystem {
                base_dir: "/var/lib/requestor".into()
            }
        );
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_secs, 10);
        assert_eq!(
            config.artifacts.unwrap().prefix,
            "appstore/raw/analytics/".to_string()
        );
    }
}
