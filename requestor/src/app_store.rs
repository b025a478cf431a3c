//! App Store Connect binding of [`RemoteApi`].
//!
//! Report requests are JSON:API resources:
//! - `POST /analyticsReportRequests` creates one for an app.
//! - `GET /analyticsReportRequests/{id}` fetches one.
//! - `GET /apps/{id}/analyticsReportRequests?filter[accessType]=...` lists them.
use crate::config::ApiConfig;
use crate::remote::{ApiError, ApiResponse, RemoteApi};
use crate::types::{CreateParams, HandleKind};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::header::{AUTHORIZATION, RETRY_AFTER};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use url::Url;

/// Where bearer tokens come from.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Result<String, ApiError>;
}

/// Reads the token from an environment variable every time it is asked, so
/// an external process can rotate it.
pub struct EnvTokenSource {
    var: String,
}

impl EnvTokenSource {
    pub fn new<V: Into<String>>(var: V) -> Self {
        EnvTokenSource { var: var.into() }
    }
}

impl TokenSource for EnvTokenSource {
    fn token(&self) -> Result<String, ApiError> {
        match std::env::var(&self.var) {
            Ok(token) if !token.trim().is_empty() => Ok(token.trim().to_string()),
            _ => Err(ApiError::Credentials(format!("{} is not set", self.var))),
        }
    }
}

#[derive(Deserialize)]
struct ResourceId {
    id: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Data {
    One(ResourceId),
    Many(Vec<ResourceId>),
}

#[derive(Deserialize)]
struct Document {
    data: Option<Data>,
}

/// Extracts `data.id`, or the first `data[].id` of a collection.
fn parse_handle_id(body: &str) -> Result<Option<String>, ApiError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let document: Document =
        serde_json::from_str(body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    Ok(match document.data {
        Some(Data::One(resource)) => Some(resource.id),
        Some(Data::Many(resources)) => resources.into_iter().next().map(|r| r.id),
        None => None,
    })
}

/// `Retry-After` in delta seconds. HTTP dates are ignored.
fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct AppStoreClient {
    client: reqwest::Client,
    base_url: Url,
    token_source: Box<dyn TokenSource>,
    token: RwLock<String>,
}

impl AppStoreClient {
    pub fn new(config: &ApiConfig, token_source: Box<dyn TokenSource>) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        let token = token_source.token()?;

        Ok(AppStoreClient {
            client,
            base_url: config.base_url.clone(),
            token_source,
            token: RwLock::new(token),
        })
    }

    /// Appends escaped path segments, so ids can never alter the route.
    fn url(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::Transport(format!("invalid base URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.read())
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<ApiResponse, ApiError> {
        let response = request
            .header(AUTHORIZATION, self.bearer())
            .send()
            .await?;

        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let body = response.text().await?;

        let handle_id = if status.is_success() {
            parse_handle_id(&body)?
        } else {
            None
        };

        tracing::debug!(status = status.as_u16(), handle_id = ?handle_id, "App Store Connect response");

        Ok(ApiResponse {
            status,
            retry_after,
            handle_id,
            body,
        })
    }
}

#[async_trait]
impl RemoteApi for AppStoreClient {
    async fn create_resource(
        &self,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<ApiResponse, ApiError> {
        let url = self.url(&["analyticsReportRequests"])?;
        let body = json!({
            "data": {
                "type": "analyticsReportRequests",
                "attributes": { "accessType": kind.access_type() },
                "relationships": {
                    "app": { "data": { "type": "apps", "id": entity_id } }
                }
            }
        });

        tracing::info!(
            entity_id,
            access_type = kind.access_type(),
            range = ?params.range.map(|r| r.token()),
            "Creating analytics report request"
        );
        self.send(self.client.post(url).json(&body)).await
    }

    async fn get_resource(&self, handle_id: &str) -> Result<ApiResponse, ApiError> {
        let url = self.url(&["analyticsReportRequests", handle_id])?;
        self.send(self.client.get(url)).await
    }

    async fn list_resources(
        &self,
        entity_id: &str,
        kind: HandleKind,
    ) -> Result<ApiResponse, ApiError> {
        let mut url = self.url(&["apps", entity_id, "analyticsReportRequests"])?;
        url.query_pairs_mut()
            .append_pair("filter[accessType]", kind.access_type());
        self.send(self.client.get(url)).await
    }

    async fn refresh_credentials(&self) -> Result<(), ApiError> {
        let token = self.token_source.token()?;
        *self.token.write() = token;
        tracing::info!("Refreshed App Store Connect credentials");
        Ok(())
    }
}
