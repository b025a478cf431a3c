//! Last resort after a 409: recover the handle id from previously landed
//! artifacts instead of spending more remote calls.
use crate::store::{BlobStore, StoreError};
use crate::types::HandleKind;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

#[async_trait]
pub trait HandleFallback: Send + Sync {
    async fn find_handle(
        &self,
        entity_id: &str,
        kind: HandleKind,
    ) -> Result<Option<String>, StoreError>;
}

#[derive(Deserialize)]
struct ManifestAttributes {
    #[serde(rename = "accessType")]
    access_type: Option<String>,
}

#[derive(Deserialize)]
struct ManifestRequest {
    id: Option<String>,
    #[serde(default)]
    attributes: Option<ManifestAttributes>,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    report_requests: Vec<ManifestRequest>,
}

/// Scans `<prefix>dt=<date>/app_id=<entity>/analytics.json` manifests, newest
/// partition first, for a report request of the wanted kind.
pub struct ManifestScanner {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl ManifestScanner {
    pub fn new<P: Into<String>>(store: Arc<dyn BlobStore>, prefix: P) -> Self {
        ManifestScanner {
            store,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl HandleFallback for ManifestScanner {
    async fn find_handle(
        &self,
        entity_id: &str,
        kind: HandleKind,
    ) -> Result<Option<String>, StoreError> {
        let suffix = format!("/app_id={entity_id}/analytics.json");
        let mut manifests: Vec<String> = self
            .store
            .list(&self.prefix)
            .await?
            .into_iter()
            .filter(|key| key.ends_with(&suffix) && key.contains("dt="))
            .collect();
        // dt=YYYY-MM-DD sorts lexically
        manifests.sort_unstable_by(|a, b| b.cmp(a));

        for key in manifests {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            let manifest: Manifest = match serde_json::from_slice(&bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unreadable manifest");
                    continue;
                }
            };

            let found = manifest.report_requests.into_iter().find_map(|request| {
                let access_type = request.attributes.and_then(|a| a.access_type);
                match access_type.as_deref() {
                    Some(t) if t == kind.access_type() => request.id,
                    _ => None,
                }
            });

            if let Some(handle_id) = found {
                tracing::info!(entity_id, handle_id = %handle_id, key = %key, "Found handle in landed manifest");
                return Ok(Some(handle_id));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const PREFIX: &str = "appstore/raw/analytics/";

    async fn put_manifest(store: &MemoryStore, date: &str, entity: &str, body: &str) {
        store
            .put(
                &format!("{PREFIX}dt={date}/app_id={entity}/analytics.json"),
                body.as_bytes().to_vec(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_newest_matching_manifest_wins() {
        let store = Arc::new(MemoryStore::default());
        put_manifest(
            &store,
            "2025-10-01",
            "A1",
            r#"{"report_requests": [{"id": "OLD", "attributes": {"accessType": "ONE_TIME_SNAPSHOT"}}]}"#,
        )
        .await;
        put_manifest(
            &store,
            "2025-10-20",
            "A1",
            r#"{"report_requests": [
                {"id": "ONGOING-1", "attributes": {"accessType": "ONGOING"}},
                {"id": "NEW", "attributes": {"accessType": "ONE_TIME_SNAPSHOT"}}
            ]}"#,
        )
        .await;
        put_manifest(
            &store,
            "2025-10-25",
            "A2",
            r#"{"report_requests": [{"id": "OTHER", "attributes": {"accessType": "ONE_TIME_SNAPSHOT"}}]}"#,
        )
        .await;

        let scanner = ManifestScanner::new(store, PREFIX);
        assert_eq!(
            scanner.find_handle("A1", HandleKind::FixedRange).await.unwrap(),
            Some("NEW".into())
        );
        assert_eq!(
            scanner.find_handle("A1", HandleKind::Recurring).await.unwrap(),
            Some("ONGOING-1".into())
        );
        assert_eq!(
            scanner.find_handle("A3", HandleKind::FixedRange).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_unreadable_manifest_is_skipped() {
        let store = Arc::new(MemoryStore::default());
        put_manifest(&store, "2025-10-25", "A1", "not json").await;
        put_manifest(
            &store,
            "2025-10-24",
            "A1",
            r#"{"report_requests": [{"id": "H9", "attributes": {"accessType": "ONGOING"}}]}"#,
        )
        .await;

        let scanner = ManifestScanner::new(store, PREFIX);
        assert_eq!(
            scanner.find_handle("A1", HandleKind::Recurring).await.unwrap(),
            Some("H9".into())
        );
    }
}
