//! Bounded retries for a single outbound call.
//!
//! | Response            | Action                                              |
//! |---------------------|-----------------------------------------------------|
//! | 2xx                 | return                                              |
//! | 401                 | refresh credentials once, retry without charging    |
//! | 429                 | record rejection, sleep hint or exponential backoff |
//! | 403                 | trust fallback, no retry                            |
//! | 409                 | conflict, no retry                                  |
//! | 404                 | invalid, no retry                                   |
//! | timeout / connect   | linear backoff                                      |
//! | anything else       | fatal                                               |
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RetryConfig;
use crate::metrics_defs::{BACKOFF_SLEEP, RATE_LIMIT_REJECTIONS, REMOTE_CALLS};
use crate::rate_limiter::RateLimiter;
use crate::remote::{ApiError, ApiResponse, RemoteApi};
use rand::Rng;
use reqwest::StatusCode;
use shared::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, sleep};

/// Final result of a call after retries.
#[derive(Debug)]
pub enum CallOutcome {
    Success(ApiResponse),
    /// 403: the caller should trust whatever it has cached.
    TrustFallback(ApiResponse),
    /// 409: the resource already exists.
    Conflict(ApiResponse),
    /// 404: the resource is gone.
    Invalid(ApiResponse),
    /// Every attempt was answered with 429.
    RateLimited { attempts: u32 },
    /// Every attempt failed at the network level.
    Network { attempts: u32, error: ApiError },
    Fatal {
        status: Option<StatusCode>,
        reason: String,
    },
}

impl CallOutcome {
    /// Last HTTP status observed, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CallOutcome::Success(r)
            | CallOutcome::TrustFallback(r)
            | CallOutcome::Conflict(r)
            | CallOutcome::Invalid(r) => Some(r.status),
            CallOutcome::RateLimited { .. } => Some(StatusCode::TOO_MANY_REQUESTS),
            CallOutcome::Network { .. } => None,
            CallOutcome::Fatal { status, .. } => *status,
        }
    }
}

/// Classification of one attempt.
#[derive(Debug)]
enum Attempt {
    Done(CallOutcome),
    Unauthorized,
    RateLimited { retry_after: Option<Duration> },
    Transient(ApiError),
}

fn classify(result: Result<ApiResponse, ApiError>) -> Attempt {
    let response = match result {
        Ok(response) => response,
        Err(err) if err.is_transient() => return Attempt::Transient(err),
        Err(err) => {
            return Attempt::Done(CallOutcome::Fatal {
                status: None,
                reason: err.to_string(),
            });
        }
    };

    match response.status {
        status if status.is_success() => Attempt::Done(CallOutcome::Success(response)),
        StatusCode::UNAUTHORIZED => Attempt::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => Attempt::RateLimited {
            retry_after: response.retry_after,
        },
        StatusCode::FORBIDDEN => Attempt::Done(CallOutcome::TrustFallback(response)),
        StatusCode::CONFLICT => Attempt::Done(CallOutcome::Conflict(response)),
        StatusCode::NOT_FOUND => Attempt::Done(CallOutcome::Invalid(response)),
        status => Attempt::Done(CallOutcome::Fatal {
            status: Some(status),
            reason: response.body_excerpt().to_string(),
        }),
    }
}

/// `base * 2^attempt + jitter`, capped.
pub fn exponential_delay(base: Duration, attempt: u32, jitter: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).saturating_add(jitter).min(cap)
}

pub struct RetryPolicy {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(limiter: Arc<RateLimiter>, breaker: Arc<CircuitBreaker>, config: RetryConfig) -> Self {
        RetryPolicy {
            limiter,
            breaker,
            config,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    #[cfg(test)]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Delay after the `attempt`-th (zero based) rate limited response.
    pub fn rate_limit_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }

        let cap = Duration::from_secs(self.config.max_delay_secs);
        let max_jitter = self.config.max_jitter_secs;
        let jitter = if max_jitter.is_finite() && max_jitter > 0.0 {
            // Jitter beyond the cap would be clipped anyway.
            let max_jitter = max_jitter.min(cap.as_secs_f64());
            if max_jitter > 0.0 {
                Duration::try_from_secs_f64(rand::rng().random_range(0.0..max_jitter))
                    .unwrap_or(Duration::ZERO)
            } else {
                Duration::ZERO
            }
        } else {
            Duration::ZERO
        };

        exponential_delay(
            Duration::from_secs(self.config.base_delay_secs),
            attempt,
            jitter,
            cap,
        )
    }

    /// Delay after the `attempt`-th (one based) network failure.
    pub fn network_delay(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.config.network_step_secs).saturating_mul(attempt)
    }

    pub async fn execute_default<F, Fut>(
        &self,
        operation: &'static str,
        api: &dyn RemoteApi,
        call: F,
    ) -> CallOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ApiResponse, ApiError>>,
    {
        self.execute(operation, api, self.max_attempts(), call).await
    }

    /// Runs `call` up to `max_attempts` times. Every attempt waits for the
    /// circuit breaker and a rate limit permit first.
    pub async fn execute<F, Fut>(
        &self,
        operation: &'static str,
        api: &dyn RemoteApi,
        max_attempts: u32,
        mut call: F,
    ) -> CallOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ApiResponse, ApiError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempts = 0;
        let mut refreshed = false;

        loop {
            self.breaker.check_and_wait().await;
            self.limiter.acquire().await;

            let result = call().await;
            let status = match &result {
                Ok(response) => response.status.as_u16().to_string(),
                Err(_) => "error".to_string(),
            };
            counter!(REMOTE_CALLS, "operation" => operation, "status" => status).increment(1);

            match classify(result) {
                Attempt::Done(outcome) => return outcome,
                Attempt::Unauthorized => {
                    if refreshed {
                        return CallOutcome::Fatal {
                            status: Some(StatusCode::UNAUTHORIZED),
                            reason: "credentials rejected after refresh".into(),
                        };
                    }
                    refreshed = true;
                    tracing::warn!(operation, "Got 401, refreshing credentials");
                    if let Err(err) = api.refresh_credentials().await {
                        return CallOutcome::Fatal {
                            status: Some(StatusCode::UNAUTHORIZED),
                            reason: err.to_string(),
                        };
                    }
                }
                Attempt::RateLimited { retry_after } => {
                    self.breaker.record_rejection().await;
                    counter!(RATE_LIMIT_REJECTIONS, "operation" => operation).increment(1);
                    attempts += 1;

                    if attempts >= max_attempts {
                        tracing::error!(operation, attempts, "Rate limited, attempts exhausted");
                        return CallOutcome::RateLimited { attempts };
                    }

                    let delay = self.rate_limit_delay(attempts - 1, retry_after);
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        hinted = retry_after.is_some(),
                        "Rate limited, backing off"
                    );
                    histogram!(BACKOFF_SLEEP, "operation" => operation, "reason" => "rate_limited")
                        .record(delay.as_secs_f64());
                    sleep(delay).await;
                }
                Attempt::Transient(error) => {
                    attempts += 1;

                    if attempts >= max_attempts {
                        tracing::error!(operation, attempts, error = %error, "Network errors, attempts exhausted");
                        return CallOutcome::Network { attempts, error };
                    }

                    let delay = self.network_delay(attempts);
                    tracing::warn!(
                        operation,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Network error, retrying"
                    );
                    histogram!(BACKOFF_SLEEP, "operation" => operation, "reason" => "network")
                        .record(delay.as_secs_f64());
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::testutils::{ScriptedApi, respond, test_policy};
    use tokio::time::Instant;

    fn outcome_name(outcome: &CallOutcome) -> &'static str {
        match outcome {
            CallOutcome::Success(_) => "success",
            CallOutcome::TrustFallback(_) => "trust_fallback",
            CallOutcome::Conflict(_) => "conflict",
            CallOutcome::Invalid(_) => "invalid",
            CallOutcome::RateLimited { .. } => "rate_limited",
            CallOutcome::Network { .. } => "network",
            CallOutcome::Fatal { .. } => "fatal",
        }
    }

    #[test]
    fn test_exponential_delay_growth() {
        let base = Duration::from_secs(10);
        let cap = Duration::from_secs(300);

        let delays: Vec<Duration> = (0..3)
            .map(|attempt| exponential_delay(base, attempt, Duration::ZERO, cap))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(40)
            ]
        );

        // Jitter is additive and the cap applies to the total.
        assert_eq!(
            exponential_delay(base, 1, Duration::from_secs(3), cap),
            Duration::from_secs(23)
        );
        assert_eq!(exponential_delay(base, 6, Duration::ZERO, cap), cap);
        assert_eq!(exponential_delay(base, 40, Duration::ZERO, cap), cap);
    }

    #[test]
    fn test_rate_limit_delay_with_jitter() {
        let policy = test_policy(RetryConfig::default());
        let mut previous_floor = Duration::ZERO;
        for attempt in 0..3 {
            let delay = policy.rate_limit_delay(attempt, None);
            let floor = Duration::from_secs(10 * 2u64.pow(attempt));
            assert!(delay >= floor);
            assert!(delay < floor + Duration::from_secs(5));
            assert!(floor >= previous_floor);
            previous_floor = floor;
        }

        // A server hint is used verbatim.
        assert_eq!(
            policy.rate_limit_delay(2, Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
        assert_eq!(policy.network_delay(1), Duration::from_secs(2));
        assert_eq!(policy.network_delay(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_returns_immediately() {
        let api = ScriptedApi::new().on_get(respond(200).map(|r| r.with_handle("H1")));
        let policy = test_policy(RetryConfig::default());

        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert_eq!(outcome_name(&outcome), "success");
        assert!(matches!(outcome, CallOutcome::Success(ref r) if r.handle_id.as_deref() == Some("H1")));
        assert_eq!(api.gets(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhaustion() {
        let api = ScriptedApi::new()
            .on_get(respond(429))
            .on_get(respond(429))
            .on_get(respond(429));
        let policy = test_policy(RetryConfig {
            max_jitter_secs: 0.0,
            ..RetryConfig::default()
        });

        let start = Instant::now();
        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;

        assert!(matches!(outcome, CallOutcome::RateLimited { attempts: 3 }));
        assert_eq!(outcome.status(), Some(StatusCode::TOO_MANY_REQUESTS));
        assert_eq!(api.gets(), 3);
        // 10s + 20s of backoff; no sleep after the final attempt.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(start.elapsed() < Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_honored() {
        let api = ScriptedApi::new()
            .on_get(respond(429).map(|r| r.with_retry_after(Duration::from_secs(3))))
            .on_get(respond(200));
        let policy = test_policy(RetryConfig::default());

        let start = Instant::now();
        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;

        assert!(matches!(outcome, CallOutcome::Success(_)));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_reach_the_breaker() {
        let api = ScriptedApi::new();
        for _ in 0..5 {
            api.push_get(respond(429).map(|r| r.with_retry_after(Duration::from_secs(1))));
        }
        let policy = test_policy(RetryConfig {
            max_attempts: 5,
            max_jitter_secs: 0.0,
            ..RetryConfig::default()
        });

        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert!(matches!(outcome, CallOutcome::RateLimited { attempts: 5 }));
        assert_eq!(policy.breaker().state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_stalls_next_call() {
        let throttled = ScriptedApi::new();
        for _ in 0..5 {
            throttled.push_get(respond(429).map(|r| r.with_retry_after(Duration::from_secs(1))));
        }
        let policy = test_policy(RetryConfig {
            max_attempts: 5,
            max_jitter_secs: 0.0,
            ..RetryConfig::default()
        });

        let start = Instant::now();
        let outcome = policy
            .execute_default("get", &throttled, || throttled.get_resource("H1"))
            .await;
        assert!(matches!(outcome, CallOutcome::RateLimited { attempts: 5 }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(policy.breaker().state().await, CircuitState::Open);

        // The next call waits out the rest of the 120s window before it is sent.
        let api = ScriptedApi::new().on_get(respond(200).map(|r| r.with_handle("H4")));
        let outcome = policy.execute_default("get", &api, || api.get_resource("H4")).await;

        assert!(matches!(outcome, CallOutcome::Success(ref r) if r.handle_id.as_deref() == Some("H4")));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(120), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(125), "{elapsed:?}");
        assert_eq!(api.gets(), 1);
        assert_eq!(policy.breaker().state().await, CircuitState::Closed);
    }

    #[test]
    fn test_unusable_jitter_bound_is_ignored() {
        for max_jitter_secs in [f64::INFINITY, f64::NAN, -1.0, 1e300] {
            let policy = test_policy(RetryConfig {
                max_jitter_secs,
                ..RetryConfig::default()
            });
            let delay = policy.rate_limit_delay(0, None);
            assert!(delay >= Duration::from_secs(10), "{max_jitter_secs}");
            assert!(delay <= Duration::from_secs(300), "{max_jitter_secs}");
        }

        let policy = test_policy(RetryConfig {
            max_delay_secs: 0,
            max_jitter_secs: 5.0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.rate_limit_delay(0, None), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refreshes_once() {
        let api = ScriptedApi::new().on_get(respond(401)).on_get(respond(200));
        let policy = test_policy(RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        });

        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert!(matches!(outcome, CallOutcome::Success(_)));
        assert_eq!(api.refreshes(), 1);
        assert_eq!(api.gets(), 2);

        let api = ScriptedApi::new().on_get(respond(401)).on_get(respond(401));
        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert!(matches!(
            outcome,
            CallOutcome::Fatal {
                status: Some(StatusCode::UNAUTHORIZED),
                ..
            }
        ));
        assert_eq!(api.refreshes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_transient_statuses_are_not_retried() {
        let policy = test_policy(RetryConfig::default());

        for (status, expected) in [
            (403, "trust_fallback"),
            (409, "conflict"),
            (404, "invalid"),
            (500, "fatal"),
            (400, "fatal"),
        ] {
            let api = ScriptedApi::new().on_get(respond(status)).on_get(respond(200));
            let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
            assert_eq!(outcome_name(&outcome), expected, "status {status}");
            assert_eq!(outcome.status().map(|s| s.as_u16()), Some(status));
            assert_eq!(api.gets(), 1, "status {status} was retried");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_use_linear_backoff() {
        let api = ScriptedApi::new()
            .on_get(Err(ApiError::Timeout("30s".into())))
            .on_get(Err(ApiError::Connection("reset".into())))
            .on_get(respond(200));
        let policy = test_policy(RetryConfig::default());

        let start = Instant::now();
        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;

        assert!(matches!(outcome, CallOutcome::Success(_)));
        // 2s + 4s of backoff.
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert!(start.elapsed() < Duration::from_secs(8));

        let api = ScriptedApi::new();
        for _ in 0..3 {
            api.push_get(Err(ApiError::Timeout("30s".into())));
        }
        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert!(matches!(outcome, CallOutcome::Network { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_response_is_fatal() {
        let api = ScriptedApi::new().on_get(Err(ApiError::Malformed("not json".into())));
        let policy = test_policy(RetryConfig::default());

        let outcome = policy.execute_default("get", &api, || api.get_resource("H1")).await;
        assert!(matches!(outcome, CallOutcome::Fatal { status: None, .. }));
        assert_eq!(api.gets(), 1);
    }
}
