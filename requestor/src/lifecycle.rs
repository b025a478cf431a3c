//! Resolves one handle per entity, preferring local evidence over remote calls.
//!
//! ```text
//! LOAD_REGISTRY
//!     trusted                     -> TRUST
//!     stale                       -> VERIFY
//!     absent                      -> LIST (recurring) | CREATE (fixed range)
//! VERIFY
//!     valid / 403 / throttled     -> TRUST
//!     404                         -> LIST | CREATE
//! LIST
//!     found                       -> SAVE
//!     empty / 404 / 403           -> CREATE
//! CREATE
//!     success                     -> SAVE
//!     409                         -> one LIST, then LOCAL_FALLBACK, then give up
//!     exhausted                   -> failure for this entity
//! ```
//!
//! At most one escalation is spent per unresolved state and nothing is ever
//! created twice in one call.
use crate::fallback::HandleFallback;
use crate::metrics_defs::{HANDLE_FAILED, HANDLE_RESOLVED};
use crate::registry::{HandleRegistry, RegistryKey, RegistryRecord, TrustPolicy};
use crate::remote::RemoteApi;
use crate::retry::{CallOutcome, RetryPolicy};
use crate::types::{CreateParams, HandleKind, RequestHandle};
use chrono::Utc;
use reqwest::StatusCode;
use shared::counter;
use std::fmt;
use std::sync::Arc;

/// How a handle was obtained.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandleSource {
    /// Registry record young enough to use without asking.
    Trusted,
    /// Registry record confirmed by the remote API.
    Verified,
    /// Registry record kept because verification was inconclusive.
    TrustFallback,
    /// Existing remote resource discovered by listing.
    Listed,
    Created,
    /// Recovered from previously landed artifacts.
    LocalFallback,
}

impl HandleSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            HandleSource::Trusted => "trusted",
            HandleSource::Verified => "verified",
            HandleSource::TrustFallback => "trust_fallback",
            HandleSource::Listed => "listed",
            HandleSource::Created => "created",
            HandleSource::LocalFallback => "local_fallback",
        }
    }
}

impl fmt::Display for HandleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub handle: RequestHandle,
    pub source: HandleSource,
}

#[derive(thiserror::Error, Clone, Debug, PartialEq)]
pub enum FailureReason {
    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("network errors after {attempts} attempts: {error}")]
    Network { attempts: u32, error: String },
    #[error("resource exists remotely but its id could not be recovered")]
    ConflictUnresolved,
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl FailureReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureReason::RateLimited { .. } => "rate_limited",
            FailureReason::Network { .. } => "network",
            FailureReason::ConflictUnresolved => "conflict_unresolved",
            FailureReason::Unexpected(_) => "unexpected",
        }
    }
}

/// Every fallback for one entity was exhausted.
#[derive(thiserror::Error, Clone, Debug, PartialEq)]
#[error("no {kind} handle for {entity_id}: {reason}")]
pub struct HandleError {
    pub entity_id: String,
    pub kind: HandleKind,
    pub reason: FailureReason,
    /// Last HTTP status observed, for diagnostics.
    pub last_status: Option<u16>,
}

/// Result of a standalone verification of a handle id.
#[derive(Clone, Debug, PartialEq)]
pub enum VerifyOutcome {
    Valid,
    Invalid,
    Forbidden,
    RateLimited,
    Error(String),
}

impl VerifyOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            VerifyOutcome::Valid => "valid",
            VerifyOutcome::Invalid => "invalid",
            VerifyOutcome::Forbidden => "forbidden",
            VerifyOutcome::RateLimited => "rate_limited",
            VerifyOutcome::Error(_) => "error",
        }
    }
}

enum Listing {
    Found(String),
    Absent,
    Failed {
        reason: FailureReason,
        status: Option<StatusCode>,
    },
}

/// Converts a terminal call outcome into a failure reason.
fn failure(outcome: &CallOutcome) -> FailureReason {
    match outcome {
        CallOutcome::RateLimited { attempts } => FailureReason::RateLimited { attempts: *attempts },
        CallOutcome::Network { attempts, error } => FailureReason::Network {
            attempts: *attempts,
            error: error.to_string(),
        },
        CallOutcome::Fatal { reason, .. } => FailureReason::Unexpected(reason.clone()),
        CallOutcome::Success(_) => FailureReason::Unexpected("response without a resource id".into()),
        other => FailureReason::Unexpected(format!(
            "status {}",
            other.status().map(|s| s.as_u16()).unwrap_or_default()
        )),
    }
}

pub struct RequestLifecycle {
    api: Arc<dyn RemoteApi>,
    registry: HandleRegistry,
    policy: RetryPolicy,
    trust: TrustPolicy,
    fallback: Option<Arc<dyn HandleFallback>>,
    key_fixed_range_by_window: bool,
}

impl RequestLifecycle {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        registry: HandleRegistry,
        policy: RetryPolicy,
        trust: TrustPolicy,
    ) -> Self {
        RequestLifecycle {
            api,
            registry,
            policy,
            trust,
            fallback: None,
            key_fixed_range_by_window: false,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn HandleFallback>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Key fixed range records by their date range instead of overwriting
    /// one record per entity.
    pub fn key_fixed_range_by_window(mut self, enabled: bool) -> Self {
        self.key_fixed_range_by_window = enabled;
        self
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn registry_key(&self, entity_id: &str, kind: HandleKind, params: &CreateParams) -> RegistryKey {
        let key = RegistryKey::new(entity_id, kind);
        match (kind, params.range) {
            (HandleKind::FixedRange, Some(range)) if self.key_fixed_range_by_window => {
                key.with_range(range.token())
            }
            _ => key,
        }
    }

    /// Returns the entity's handle, reusing an existing one whenever possible.
    pub async fn get_or_create_handle(
        &self,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<RequestHandle, HandleError> {
        self.resolve(entity_id, kind, params)
            .await
            .map(|resolution| resolution.handle)
    }

    /// Like [`Self::get_or_create_handle`], also reporting how the handle was
    /// obtained.
    pub async fn resolve(
        &self,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<Resolution, HandleError> {
        let result = self.resolve_inner(entity_id, kind, params).await;

        match &result {
            Ok(resolution) => {
                counter!(HANDLE_RESOLVED, "kind" => kind.as_str(), "source" => resolution.source.as_str())
                    .increment(1);
                tracing::info!(
                    entity_id,
                    %kind,
                    handle_id = %resolution.handle.handle_id,
                    source = %resolution.source,
                    "Resolved handle"
                );
            }
            Err(err) => {
                counter!(HANDLE_FAILED, "kind" => kind.as_str(), "reason" => err.reason.as_str())
                    .increment(1);
                tracing::error!(
                    entity_id,
                    %kind,
                    reason = %err.reason,
                    last_status = ?err.last_status,
                    "Could not resolve handle"
                );
            }
        }

        result
    }

    async fn resolve_inner(
        &self,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<Resolution, HandleError> {
        let key = self.registry_key(entity_id, kind, params);
        let fail = |reason: FailureReason, status: Option<StatusCode>| HandleError {
            entity_id: entity_id.to_string(),
            kind,
            reason,
            last_status: status.map(|s| s.as_u16()),
        };

        let cached = match self.registry.load(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!(entity_id, key = %key.path(), error = %e, "Registry read failed, treating as absent");
                None
            }
        };

        if let Some(record) = cached {
            if let Some(requested) = params.range.filter(|_| kind == HandleKind::FixedRange) {
                let requested = requested.token();
                if record.range.as_deref() != Some(requested.as_str()) {
                    tracing::warn!(
                        entity_id,
                        handle_id = %record.handle_id,
                        cached_range = record.range.as_deref().unwrap_or("-"),
                        requested_range = %requested,
                        "Cached fixed range handle covers a different range"
                    );
                }
            }

            if self.trust.is_trusted(&record, Utc::now()) {
                return Ok(self.trust_record(&key, record, HandleSource::Trusted).await);
            }

            let outcome = self
                .policy
                .execute_default("verify", self.api.as_ref(), || {
                    self.api.get_resource(&record.handle_id)
                })
                .await;

            match outcome {
                CallOutcome::Success(_) => {
                    return Ok(self.trust_record(&key, record, HandleSource::Verified).await);
                }
                CallOutcome::TrustFallback(_)
                | CallOutcome::RateLimited { .. }
                | CallOutcome::Network { .. } => {
                    tracing::warn!(
                        entity_id,
                        handle_id = %record.handle_id,
                        status = ?outcome.status(),
                        "Verification inconclusive, trusting cached handle"
                    );
                    return Ok(self.trust_record(&key, record, HandleSource::TrustFallback).await);
                }
                CallOutcome::Invalid(_) => {
                    tracing::info!(
                        entity_id,
                        handle_id = %record.handle_id,
                        "Cached handle no longer exists remotely"
                    );
                }
                other => return Err(fail(failure(&other), other.status())),
            }
        }

        if kind.lists_before_create() {
            match self.list(entity_id, kind).await {
                Listing::Found(handle_id) => {
                    return Ok(self.save(&key, entity_id, handle_id, kind, params, HandleSource::Listed).await);
                }
                Listing::Absent => {}
                Listing::Failed { reason, status } => return Err(fail(reason, status)),
            }
        }

        let outcome = self
            .policy
            .execute_default("create", self.api.as_ref(), || {
                self.api.create_resource(entity_id, kind, params)
            })
            .await;

        match outcome {
            CallOutcome::Success(response) => match response.handle_id {
                Some(handle_id) => {
                    Ok(self.save(&key, entity_id, handle_id, kind, params, HandleSource::Created).await)
                }
                None => Err(fail(
                    FailureReason::Unexpected("create response without a resource id".into()),
                    Some(response.status),
                )),
            },
            CallOutcome::Conflict(_) => self.recover_conflict(&key, entity_id, kind, params).await,
            other => Err(fail(failure(&other), other.status())),
        }
    }

    /// After a 409: one list, then local artifacts. Never creates again.
    async fn recover_conflict(
        &self,
        key: &RegistryKey,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<Resolution, HandleError> {
        tracing::info!(entity_id, %kind, "Resource already exists, looking it up");

        match self.list(entity_id, kind).await {
            Listing::Found(handle_id) => {
                return Ok(self.save(key, entity_id, handle_id, kind, params, HandleSource::Listed).await);
            }
            Listing::Absent => {}
            Listing::Failed { reason, .. } => {
                tracing::warn!(entity_id, reason = %reason, "Lookup after conflict failed");
            }
        }

        if let Some(fallback) = &self.fallback {
            match fallback.find_handle(entity_id, kind).await {
                Ok(Some(handle_id)) => {
                    return Ok(self
                        .save(key, entity_id, handle_id, kind, params, HandleSource::LocalFallback)
                        .await);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(entity_id, error = %e, "Local fallback scan failed"),
            }
        }

        Err(HandleError {
            entity_id: entity_id.to_string(),
            kind,
            reason: FailureReason::ConflictUnresolved,
            last_status: Some(StatusCode::CONFLICT.as_u16()),
        })
    }

    async fn list(&self, entity_id: &str, kind: HandleKind) -> Listing {
        let outcome = self
            .policy
            .execute_default("list", self.api.as_ref(), || {
                self.api.list_resources(entity_id, kind)
            })
            .await;

        match outcome {
            CallOutcome::Success(response) => match response.handle_id {
                Some(handle_id) => Listing::Found(handle_id),
                None => Listing::Absent,
            },
            CallOutcome::Invalid(_) | CallOutcome::TrustFallback(_) => Listing::Absent,
            other => Listing::Failed {
                reason: failure(&other),
                status: other.status(),
            },
        }
    }

    async fn trust_record(
        &self,
        key: &RegistryKey,
        record: RegistryRecord,
        source: HandleSource,
    ) -> Resolution {
        let now = Utc::now();
        let record = match self.registry.touch_last_verified(key, now).await {
            Ok(Some(touched)) => touched,
            Ok(None) => record,
            Err(e) => {
                tracing::warn!(key = %key.path(), error = %e, "Could not update last_verified_at");
                RegistryRecord {
                    last_verified_at: now,
                    ..record
                }
            }
        };

        Resolution {
            handle: record.into(),
            source,
        }
    }

    async fn save(
        &self,
        key: &RegistryKey,
        entity_id: &str,
        handle_id: String,
        kind: HandleKind,
        params: &CreateParams,
        source: HandleSource,
    ) -> Resolution {
        let mut handle = RequestHandle::new(entity_id, handle_id, kind, Utc::now());
        if kind == HandleKind::FixedRange {
            handle.range = params.range.map(|r| r.token());
        }

        if let Err(e) = self.registry.save(key, &RegistryRecord::from(&handle)).await {
            tracing::error!(
                entity_id,
                handle_id = %handle.handle_id,
                error = %e,
                "Registry write failed, handle will be rediscovered next run"
            );
        }

        Resolution { handle, source }
    }

    /// One bounded verification of a handle id, without touching the registry.
    pub async fn verify(&self, handle_id: &str) -> VerifyOutcome {
        let outcome = self
            .policy
            .execute_default("verify", self.api.as_ref(), || {
                self.api.get_resource(handle_id)
            })
            .await;

        match outcome {
            CallOutcome::Success(_) => VerifyOutcome::Valid,
            CallOutcome::Invalid(_) => VerifyOutcome::Invalid,
            CallOutcome::TrustFallback(_) => VerifyOutcome::Forbidden,
            CallOutcome::RateLimited { .. } => VerifyOutcome::RateLimited,
            other => VerifyOutcome::Error(failure(&other).to_string()),
        }
    }
}
