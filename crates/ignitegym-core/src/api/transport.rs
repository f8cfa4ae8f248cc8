//! Wire-level request/response types and the `Transport` seam.
//!
//! `ApiClient` never talks to reqwest directly. It hands an `ApiRequest` and a
//! header snapshot to a `Transport`, which lets the refresh logic replay the
//! exact same request and lets tests script the backend.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use reqwest::{header, multipart, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::models::AvatarUpload;

use super::ApiError;

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    /// Single-file multipart form under the given field name.
    Multipart { field: String, file: AvatarUpload },
}

/// A request as issued by a caller. Cloneable so it can be replayed verbatim.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    /// Whether an expired-token 401 should go through the refresh path.
    pub intercept: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            intercept: true,
        }
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, field: impl Into<String>, file: AvatarUpload) -> Self {
        self.body = RequestBody::Multipart {
            field: field.into(),
            file,
        };
        self
    }

    /// Mark as a credential exchange that must never trigger a refresh.
    pub fn without_intercept(mut self) -> Self {
        self.intercept = false;
        self
    }
}

/// Default headers attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderBag {
    headers: BTreeMap<String, String>,
}

impl HeaderBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn remove(&mut self, name: &str) {
        self.headers.remove(&name.to_ascii_lowercase());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Access token carried in the `Authorization` header, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.get(header::AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
    }

    pub fn set_bearer(&mut self, token: &str) {
        self.insert(header::AUTHORIZATION.as_str(), format!("Bearer {}", token));
    }

    pub fn clear_bearer(&mut self) {
        self.remove(header::AUTHORIZATION.as_str());
    }

    /// Copy of these headers with the access token replaced.
    pub fn with_bearer(&self, token: &str) -> Self {
        let mut headers = self.clone();
        headers.set_bearer(token);
        headers
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into the matching `ApiError`.
    pub fn error_for_status(self) -> Result<Self, ApiError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ApiError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

/// Sends a request and returns the raw response.
///
/// Implementations report transport failures (DNS, TLS, timeouts) as errors
/// and every HTTP status, including 4xx/5xx, as an `ApiResponse`.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
        headers: &'a HeaderBag,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>>;
}

/// Production transport backed by reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn execute(&self, request: &ApiRequest, headers: &HeaderBag) -> Result<ApiResponse, ApiError> {
        let url = self.url(&request.path);
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut builder = self
            .client
            .request(method, &url)
            .header(header::ACCEPT, "application/json");
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart { field, file } => {
                let part = multipart::Part::bytes(file.bytes.clone())
                    .file_name(file.file_name.clone())
                    .mime_str(&file.mime_type)?;
                builder.multipart(multipart::Form::new().part(field.clone(), part))
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(url.clone())
            } else {
                ApiError::NetworkError(e)
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!(method = request.method.as_str(), url = %url, status = status, "Response received");
        Ok(ApiResponse::new(status, body))
    }
}

impl Transport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a ApiRequest,
        headers: &'a HeaderBag,
    ) -> BoxFuture<'a, Result<ApiResponse, ApiError>> {
        self.execute(request, headers).boxed()
    }
}
