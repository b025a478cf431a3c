pub mod app_store;
pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod fallback;
pub mod lifecycle;
pub mod metrics_defs;
pub mod rate_limiter;
pub mod registry;
pub mod remote;
pub mod retry;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutils;

use app_store::{AppStoreClient, EnvTokenSource};
use circuit_breaker::CircuitBreaker;
use config::Config;
use fallback::ManifestScanner;
use rate_limiter::RateLimiter;
use registry::{HandleRegistry, TrustPolicy};
use remote::ApiError;
use retry::RetryPolicy;
use std::sync::Arc;

pub use batch::{BatchReport, run_batch};
pub use lifecycle::{HandleError, HandleSource, RequestLifecycle, Resolution, VerifyOutcome};
pub use types::{CreateParams, DateRange, HandleKind, RequestHandle};

/// Wires a lifecycle manager for one pipeline run: one limiter and one
/// breaker shared by every outbound call, and the App Store Connect client.
pub fn build(config: &Config) -> Result<RequestLifecycle, ApiError> {
    let store = store::from_config(&config.registry.store);
    let api = AppStoreClient::new(
        &config.api,
        Box::new(EnvTokenSource::new(config.api.token_env.clone())),
    )?;

    let policy = RetryPolicy::new(
        Arc::new(RateLimiter::new(&config.rate_limit)),
        Arc::new(CircuitBreaker::new(&config.circuit_breaker)),
        config.retry.clone(),
    );

    let mut lifecycle = RequestLifecycle::new(
        Arc::new(api),
        HandleRegistry::new(store.clone()),
        policy,
        TrustPolicy::from_days(config.registry.trust_window_days),
    )
    .key_fixed_range_by_window(config.registry.key_fixed_range_by_window);

    if let Some(artifacts) = &config.artifacts {
        lifecycle = lifecycle.with_fallback(Arc::new(ManifestScanner::new(
            store,
            artifacts.prefix.clone(),
        )));
    }

    Ok(lifecycle)
}
