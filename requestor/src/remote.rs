use crate::types::{CreateParams, HandleKind};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::time::Duration;

/// What every remote call surfaces, regardless of the binding.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiResponse {
    pub status: StatusCode,
    /// Server supplied retry hint (`Retry-After`).
    pub retry_after: Option<Duration>,
    /// Identifier of the created or found resource, parsed on success.
    pub handle_id: Option<String>,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode) -> Self {
        ApiResponse {
            status,
            retry_after: None,
            handle_id: None,
            body: String::new(),
        }
    }

    pub fn with_handle<H: Into<String>>(mut self, handle_id: H) -> Self {
        self.handle_id = Some(handle_id.into());
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    #[cfg(test)]
    pub fn with_body<B: Into<String>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Short body excerpt for diagnostics.
    pub fn body_excerpt(&self) -> &str {
        let end = self
            .body
            .char_indices()
            .nth(300)
            .map(|(i, _)| i)
            .unwrap_or(self.body.len());
        &self.body[..end]
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("http client error: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("could not obtain credentials: {0}")]
    Credentials(String),
}

impl ApiError {
    /// Network level failures that are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Timeout(_) | ApiError::Connection(_))
    }
}

/// True if any cause in the chain is an I/O error from a dropped connection.
fn is_connection_drop(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

impl From<reqwest::Error> for ApiError {
    // Bodies are read as text and parsed separately, so a body or decode
    // error from reqwest means the stream broke, not that the payload is bad.
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_connect()
            || err.is_request()
            || err.is_body()
            || err.is_decode()
            || is_connection_drop(&err)
        {
            ApiError::Connection(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// The remote calls the lifecycle manager depends on.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn create_resource(
        &self,
        entity_id: &str,
        kind: HandleKind,
        params: &CreateParams,
    ) -> Result<ApiResponse, ApiError>;

    async fn get_resource(&self, handle_id: &str) -> Result<ApiResponse, ApiError>;

    async fn list_resources(
        &self,
        entity_id: &str,
        kind: HandleKind,
    ) -> Result<ApiResponse, ApiError>;

    /// Obtain fresh credentials after the server rejected the current ones.
    async fn refresh_credentials(&self) -> Result<(), ApiError>;
}
