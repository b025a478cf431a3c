use crate::circuit_breaker::CircuitBreaker;
use crate::config::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use crate::rate_limiter::RateLimiter;
use crate::remote::{ApiError, ApiResponse, RemoteApi};
use crate::retry::RetryPolicy;
use crate::types::{CreateParams, HandleKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Create(String),
    Get(String),
    List(String),
}

type Script = Mutex<VecDeque<Result<ApiResponse, ApiError>>>;

/// Remote API double that replays scripted responses per operation and
/// records every call. Unscripted calls fail with a fatal transport error.
#[derive(Default)]
pub struct ScriptedApi {
    creates: Script,
    gets: Script,
    lists: Script,
    calls: Mutex<Vec<Call>>,
    refreshes: AtomicU32,
}

pub fn respond(status: u16) -> Result<ApiResponse, ApiError> {
    let status = StatusCode::from_u16(status).unwrap();
    Ok(ApiResponse::new(status))
}

pub fn found(handle_id: &str) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(StatusCode::OK).with_handle(handle_id))
}

pub fn created(handle_id: &str) -> Result<ApiResponse, ApiError> {
    Ok(ApiResponse::new(StatusCode::CREATED).with_handle(handle_id))
}

/// Default policy with a fresh limiter and breaker.
pub fn test_policy(config: RetryConfig) -> RetryPolicy {
    RetryPolicy::new(
        Arc::new(RateLimiter::new(&RateLimitConfig::default())),
        Arc::new(CircuitBreaker::new(&CircuitBreakerConfig::default())),
        config,
    )
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(self, response: Result<ApiResponse, ApiError>) -> Self {
        self.creates.lock().push_back(response);
        self
    }

    pub fn on_get(self, response: Result<ApiResponse, ApiError>) -> Self {
        self.push_get(response);
        self
    }

    pub fn on_list(self, response: Result<ApiResponse, ApiError>) -> Self {
        self.lists.lock().push_back(response);
        self
    }

    pub fn push_get(&self, response: Result<ApiResponse, ApiError>) {
        self.gets.lock().push_back(response);
    }

    pub fn push_create(&self, response: Result<ApiResponse, ApiError>) {
        self.creates.lock().push_back(response);
    }

    pub fn push_list(&self, response: Result<ApiResponse, ApiError>) {
        self.lists.lock().push_back(response);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn creates(&self) -> usize {
        self.count(|c| matches!(c, Call::Create(_)))
    }

    pub fn gets(&self) -> usize {
        self.count(|c| matches!(c, Call::Get(_)))
    }

    pub fn lists(&self) -> usize {
        self.count(|c| matches!(c, Call::List(_)))
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| f(c)).count()
    }

    fn next(&self, script: &Script, call: Call) -> Result<ApiResponse, ApiError> {
        let description = format!("{call:?}");
        self.calls.lock().push(call);
        script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::Transport(format!("unscripted call {description}"))))
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn create_resource(
        &self,
        entity_id: &str,
        _kind: HandleKind,
        _params: &CreateParams,
    ) -> Result<ApiResponse, ApiError> {
        self.next(&self.creates, Call::Create(entity_id.to_string()))
    }

    async fn get_resource(&self, handle_id: &str) -> Result<ApiResponse, ApiError> {
        self.next(&self.gets, Call::Get(handle_id.to_string()))
    }

    async fn list_resources(
        &self,
        entity_id: &str,
        _kind: HandleKind,
    ) -> Result<ApiResponse, ApiError> {
        self.next(&self.lists, Call::List(entity_id.to_string()))
    }

    async fn refresh_credentials(&self) -> Result<(), ApiError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
