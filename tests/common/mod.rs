//! An in-memory registry that speaks just enough of the distribution and
//! ORAS referrers APIs to run every check against.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue, LINK, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use url::Url;

use regcheck::digest::OciDigest;
use regcheck::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use regcheck::models::Descriptor;
use regcheck::{AuthMode, Authenticator, Client, Credentials, Options, Recorder};

pub const REGISTRY_HOST: &str = "registry.test";
pub const AUTH_HOST: &str = "auth.test";
pub const BLOB_HOST: &str = "blobs.test";
pub const DATA_HOST: &str = "data.test";

pub const TOKEN: &str = "tkn";

/// How the referrers listing points at its next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    Token,
    Link,
}

pub struct MockRegistry {
    pub page_size: usize,
    pub pagination: Pagination,
    /// Serve every blob with an extra byte appended
    pub corrupt_blobs: bool,
    /// Replace the last referrer of a listing with the first
    pub duplicate_referrer: bool,
    /// Leave the last referrer out of a listing
    pub hide_referrer: bool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    uploads: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Bytes>,
    manifests: HashMap<String, Bytes>,
    referrers: HashMap<String, Vec<Descriptor>>,
    requests: Vec<HttpRequest>,
    token_calls: usize,
}

impl Default for MockRegistry {
    fn default() -> Self {
        Self {
            page_size: 10,
            pagination: Pagination::Token,
            corrupt_blobs: false,
            duplicate_referrer: false,
            hide_referrer: false,
            state: Mutex::new(State::default()),
        }
    }
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the defaults adjusted by `configure`.
    pub fn with(configure: impl FnOnce(&mut Self)) -> Self {
        let mut registry = Self::default();
        configure(&mut registry);
        registry
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Number of requests with `method` whose path contains `needle`.
    pub fn count(&self, method: Method, needle: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.url.path().contains(needle))
            .count()
    }

    pub fn token_calls(&self) -> usize {
        self.state.lock().unwrap().token_calls
    }

    fn serve_registry(&self, state: &mut State, request: &HttpRequest) -> HttpResponse {
        let path = request.url.path().trim_start_matches('/').to_string();
        let segments: Vec<&str> = path.split('/').collect();

        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["v2", ""]) => HttpResponse::new(StatusCode::OK),

            ("POST", ["v2", repo, "blobs", "uploads", ""]) => {
                let id = uuid::Uuid::new_v4().to_string();
                state.uploads.insert(id.clone(), Vec::new());
                with_header(
                    HttpResponse::new(StatusCode::ACCEPTED),
                    LOCATION,
                    &format!("/v2/{}/blobs/uploads/{}", repo, id),
                )
            }

            ("PATCH", ["v2", repo, "blobs", "uploads", id]) => match state.uploads.get_mut(*id) {
                Some(upload) => {
                    upload.extend_from_slice(&request.body);
                    with_header(
                        HttpResponse::new(StatusCode::ACCEPTED),
                        LOCATION,
                        &format!("https://{}/v2/{}/blobs/uploads/{}?_state=patched", REGISTRY_HOST, repo, id),
                    )
                }
                None => HttpResponse::new(StatusCode::NOT_FOUND),
            },

            ("PUT", ["v2", repo, "blobs", "uploads", id]) => {
                let Some(digest) = query(&request.url, "digest") else {
                    return HttpResponse::new(StatusCode::BAD_REQUEST);
                };
                let Some(data) = state.uploads.remove(*id) else {
                    return HttpResponse::new(StatusCode::NOT_FOUND);
                };
                if OciDigest::sha256(&data).to_string() != digest {
                    return HttpResponse::new(StatusCode::BAD_REQUEST);
                }
                state.blobs.insert(digest.clone(), Bytes::from(data));
                with_header(
                    HttpResponse::new(StatusCode::CREATED),
                    LOCATION,
                    &format!("/v2/{}/blobs/{}", repo, digest),
                )
            }

            ("GET", ["v2", _repo, "blobs", digest]) => {
                if state.blobs.contains_key(*digest) {
                    with_header(
                        HttpResponse::new(StatusCode::TEMPORARY_REDIRECT),
                        LOCATION,
                        &format!("https://{}/{}", BLOB_HOST, digest),
                    )
                } else {
                    HttpResponse::new(StatusCode::NOT_FOUND)
                }
            }

            ("PUT", ["v2", repo, "manifests", reference]) => {
                let digest = OciDigest::sha256(&request.body);
                let media_type = request
                    .headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();

                let manifest: Value = match serde_json::from_slice(&request.body) {
                    Ok(value) => value,
                    Err(_) => return HttpResponse::new(StatusCode::BAD_REQUEST),
                };
                if let Some(subject) = manifest["subject"]["digest"].as_str() {
                    let mut desc = Descriptor::new(media_type, digest.clone(), request.body.len() as i64);
                    desc.artifact_type = manifest["artifactType"].as_str().map(str::to_string);
                    state.referrers.entry(subject.to_string()).or_default().push(desc);
                }

                state
                    .manifests
                    .insert(format!("{}/{}", repo, reference), request.body.clone());
                state
                    .manifests
                    .insert(format!("{}/{}", repo, digest), request.body.clone());
                with_header(
                    HttpResponse::new(StatusCode::CREATED),
                    LOCATION,
                    &format!("/v2/{}/manifests/{}", repo, digest),
                )
            }

            ("GET", ["v2", repo, "manifests", reference]) => {
                match state.manifests.get(&format!("{}/{}", repo, reference)) {
                    Some(body) => {
                        let mut response = HttpResponse::new(StatusCode::OK);
                        response.body = body.clone();
                        response
                    }
                    None => HttpResponse::new(StatusCode::NOT_FOUND),
                }
            }

            ("GET", ["oras", "artifacts", "v1", _repo, "manifests", subject, "referrers"]) => {
                self.list_referrers(state, request, subject)
            }

            _ => HttpResponse::new(StatusCode::NOT_FOUND),
        }
    }

    fn list_referrers(&self, state: &State, request: &HttpRequest, subject: &str) -> HttpResponse {
        let mut all = state.referrers.get(subject).cloned().unwrap_or_default();
        if self.hide_referrer {
            all.pop();
        }
        if self.duplicate_referrer && all.len() > 1 {
            let first = all[0].clone();
            if let Some(last) = all.last_mut() {
                *last = first;
            }
        }

        let offset = query(&request.url, "nextToken")
            .or_else(|| query(&request.url, "last"))
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0)
            .min(all.len());
        let end = (offset + self.page_size).min(all.len());

        let mut body = json!({ "digest": subject, "referrers": &all[offset..end] });
        let mut response = HttpResponse::new(StatusCode::OK);
        if end < all.len() {
            match self.pagination {
                Pagination::Token => body["@nextToken"] = json!(end.to_string()),
                Pagination::Link => {
                    response = with_header(
                        response,
                        LINK,
                        &format!(r#"<{}?last={}>; rel="next""#, request.url.path(), end),
                    )
                }
            }
        }
        response.body = Bytes::from(body.to_string());
        response
    }

    fn serve_content(&self, state: &State, request: &HttpRequest) -> HttpResponse {
        let digest = request.url.path().trim_start_matches('/');
        match state.blobs.get(digest) {
            Some(blob) => {
                let mut body = blob.to_vec();
                if self.corrupt_blobs {
                    body.push(b'!');
                }
                let mut response = HttpResponse::new(StatusCode::OK);
                response.body = Bytes::from(body);
                response
            }
            None => HttpResponse::new(StatusCode::NOT_FOUND),
        }
    }
}

#[async_trait]
impl HttpTransport for MockRegistry {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        let response = match request.url.host_str() {
            Some(AUTH_HOST) => {
                state.token_calls += 1;
                let mut response = HttpResponse::new(StatusCode::OK);
                response.body = Bytes::from(json!({ "access_token": TOKEN }).to_string());
                response
            }
            Some(BLOB_HOST) => self.serve_content(&state, &request),
            Some(DATA_HOST) => HttpResponse::new(StatusCode::FORBIDDEN),
            Some(REGISTRY_HOST) if authorized(&request) => self.serve_registry(&mut state, &request),
            Some(REGISTRY_HOST) => with_header(
                HttpResponse::new(StatusCode::UNAUTHORIZED),
                WWW_AUTHENTICATE,
                &format!(
                    r#"Bearer realm="https://{}/token",service="{}",scope="repository:*:pull,push""#,
                    AUTH_HOST, REGISTRY_HOST
                ),
            ),
            _ => return Err(TransportError::Other(format!("no route to {}", request.url))),
        };

        Ok(response)
    }
}

fn authorized(request: &HttpRequest) -> bool {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN) || v.starts_with("Basic "))
}

fn query(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn with_header(mut response: HttpResponse, name: reqwest::header::HeaderName, value: &str) -> HttpResponse {
    response.headers.insert(name, HeaderValue::from_str(value).unwrap());
    response
}

/// Client for the mock registry using `mode` for registry calls.
pub fn client(registry: Arc<MockRegistry>, mode: AuthMode) -> Client {
    let authenticator = Authenticator::new(Recorder::new(registry), Credentials::new("user", "pass"));
    Client::new(Url::parse(&format!("https://{}", REGISTRY_HOST)).unwrap(), authenticator, mode)
}

/// Options pointing at the mock registry.
pub fn options() -> Options {
    Options {
        login_server: REGISTRY_HOST.to_string(),
        data_endpoint: Some(DATA_HOST.to_string()),
        username: Some("user".to_string()),
        password: Some("pass".to_string()),
        ..Default::default()
    }
}
