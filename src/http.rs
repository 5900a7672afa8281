//! Physical HTTP round trips.
//!
//! [`HttpTransport`] is the injected base transport and [`Recorder`] wraps it so
//! that every call, successful or not, yields a [`RoundTripInfo`] and a log line.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::redirect::Policy;
use reqwest::{Client as ReqwestClient, Method, StatusCode};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::digest::OciDigest;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// A request as it goes on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A fully received response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }
}

/// Executes a single HTTP request. Implementations must not follow redirects
/// or retry on their own.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`HttpTransport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ReqwestClient,
}

impl ReqwestTransport {
    pub fn new(timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = ReqwestClient::builder().redirect(Policy::none());
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Use a preconfigured client. It should have redirects disabled.
    pub fn with_client(client: ReqwestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// What was sent.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: Url,
    pub authorization: Option<String>,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    pub body_size: u64,
    pub started_at: DateTime<Utc>,
}

/// What came back.
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub body: Bytes,
    pub challenge: Option<String>,
    pub location: Option<String>,
    pub link: Option<String>,
    /// SHA-256 of the response body
    pub digest: OciDigest,
    pub size: u64,
}

impl ResponseSnapshot {
    /// Body as text, for error reporting.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<HttpResponse> for ResponseSnapshot {
    fn from(response: HttpResponse) -> Self {
        let header = |name: HeaderName| {
            response
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            status: response.status,
            challenge: header(WWW_AUTHENTICATE),
            location: header(LOCATION),
            link: header(LINK),
            digest: OciDigest::sha256(&response.body),
            size: response.body.len() as u64,
            body: response.body,
        }
    }
}

/// Record of one physical round trip. Exactly one of `response` and `error`
/// is set.
#[derive(Debug, Clone)]
pub struct RoundTripInfo {
    pub request: RequestSnapshot,
    pub response: Option<ResponseSnapshot>,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl RoundTripInfo {
    fn log(&self) {
        let elapsed_ms = self.elapsed.as_millis() as u64;
        match (&self.response, &self.error) {
            (Some(response), _) => info!(
                method = %self.request.method,
                url = %self.request.url,
                status = response.status.as_u16(),
                elapsed_ms,
                sent = self.request.body_size,
                received = response.size,
                authorization = ?self.request.authorization,
                accept = ?self.request.accept,
                content_type = ?self.request.content_type,
                challenge = ?response.challenge,
                location = ?response.location,
                "round trip"
            ),
            (None, error) => warn!(
                method = %self.request.method,
                url = %self.request.url,
                elapsed_ms,
                authorization = ?self.request.authorization,
                error = error.as_deref().unwrap_or("no response"),
                "round trip failed"
            ),
        }
    }
}

/// Wraps the base transport and records every call it makes.
#[derive(Clone)]
pub struct Recorder {
    base: Arc<dyn HttpTransport>,
}

impl Recorder {
    pub fn new(base: Arc<dyn HttpTransport>) -> Self {
        Self { base }
    }

    /// Execute the request exactly once.
    pub async fn round_trip(&self, request: HttpRequest) -> RoundTripInfo {
        let header = |name: HeaderName| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let snapshot = RequestSnapshot {
            method: request.method.clone(),
            url: request.url.clone(),
            authorization: header(AUTHORIZATION),
            accept: header(ACCEPT),
            content_type: header(CONTENT_TYPE),
            body_size: request.body.len() as u64,
            started_at: Utc::now(),
        };

        let started = Instant::now();
        let outcome = self.base.send(request).await;
        let elapsed = started.elapsed();

        let (response, error) = match outcome {
            Ok(response) => (Some(ResponseSnapshot::from(response)), None),
            Err(err) => (None, Some(err.to_string())),
        };

        let info = RoundTripInfo {
            request: snapshot,
            response,
            elapsed,
            error,
        };
        info.log();
        info
    }
}
