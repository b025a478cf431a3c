//! Durable registry of remote request handles, one record per entity and kind.
//!
//! Records live in the blob store at `registry/<kind>/<entity_id>.json`, or at
//! `registry/<kind>/<entity_id>/<range>.json` when keyed by a date range.
use crate::store::{BlobStore, StoreError};
use crate::types::{HandleKind, RequestHandle};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const PREFIX: &str = "registry";

#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid registry record: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RegistryKey {
    pub entity_id: String,
    pub kind: HandleKind,
    pub range: Option<String>,
}

impl RegistryKey {
    pub fn new<E: Into<String>>(entity_id: E, kind: HandleKind) -> Self {
        RegistryKey {
            entity_id: entity_id.into(),
            kind,
            range: None,
        }
    }

    pub fn with_range<R: Into<String>>(mut self, range: R) -> Self {
        self.range = Some(range.into());
        self
    }

    pub fn path(&self) -> String {
        match &self.range {
            Some(range) => format!("{PREFIX}/{}/{}/{range}.json", self.kind, self.entity_id),
            None => format!("{PREFIX}/{}/{}.json", self.kind, self.entity_id),
        }
    }
}

/// Persisted form of a [`RequestHandle`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    pub entity_id: String,
    pub kind: HandleKind,
    pub handle_id: String,
    pub created_at: DateTime<Utc>,
    pub last_verified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

impl From<&RequestHandle> for RegistryRecord {
    fn from(handle: &RequestHandle) -> Self {
        RegistryRecord {
            entity_id: handle.entity_id.clone(),
            kind: handle.kind,
            handle_id: handle.handle_id.clone(),
            created_at: handle.created_at,
            last_verified_at: handle.last_verified_at,
            range: handle.range.clone(),
        }
    }
}

impl From<RegistryRecord> for RequestHandle {
    fn from(record: RegistryRecord) -> Self {
        RequestHandle {
            entity_id: record.entity_id,
            handle_id: record.handle_id,
            kind: record.kind,
            created_at: record.created_at,
            last_verified_at: record.last_verified_at,
            range: record.range,
        }
    }
}

/// Decides whether a cached record can be used without asking the remote API.
#[derive(Clone, Copy, Debug)]
pub struct TrustPolicy {
    pub window: TimeDelta,
}

impl TrustPolicy {
    pub fn from_days(days: u32) -> Self {
        TrustPolicy {
            window: TimeDelta::days(i64::from(days)),
        }
    }

    /// Recurring handles never expire remotely, so a young enough record is
    /// trusted as is. Fixed range handles can expire and are always verified.
    pub fn is_trusted(&self, record: &RegistryRecord, now: DateTime<Utc>) -> bool {
        match record.kind {
            HandleKind::Recurring => now - record.created_at < self.window,
            HandleKind::FixedRange => false,
        }
    }
}

impl Default for TrustPolicy {
    fn default() -> Self {
        TrustPolicy::from_days(180)
    }
}

#[derive(Clone)]
pub struct HandleRegistry {
    store: Arc<dyn BlobStore>,
}

impl HandleRegistry {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        HandleRegistry { store }
    }

    pub async fn load(&self, key: &RegistryKey) -> Result<Option<RegistryRecord>, RegistryError> {
        match self.store.get(&key.path()).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Upsert: replaces any existing record for the key.
    pub async fn save(&self, key: &RegistryKey, record: &RegistryRecord) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(record)?;
        self.store.put(&key.path(), bytes).await?;
        tracing::info!(
            entity_id = %record.entity_id,
            handle_id = %record.handle_id,
            key = %key.path(),
            "Saved registry record"
        );
        Ok(())
    }

    /// Updates only `last_verified_at`. Returns the updated record, or `None`
    /// if there is nothing to touch.
    pub async fn touch_last_verified(
        &self,
        key: &RegistryKey,
        now: DateTime<Utc>,
    ) -> Result<Option<RegistryRecord>, RegistryError> {
        let Some(mut record) = self.load(key).await? else {
            return Ok(None);
        };
        record.last_verified_at = now;
        let bytes = serde_json::to_vec_pretty(&record)?;
        self.store.put(&key.path(), bytes).await?;
        Ok(Some(record))
    }

    /// Every record of a kind. Unreadable records are skipped with a warning.
    pub async fn list(&self, kind: HandleKind) -> Result<Vec<RegistryRecord>, RegistryError> {
        let prefix = format!("{PREFIX}/{kind}/");
        let mut records = Vec::new();

        for path in self.store.list(&prefix).await? {
            let Some(bytes) = self.store.get(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<RegistryRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path, error = %e, "Skipping unreadable registry record"),
            }
        }

        Ok(records)
    }
}
