//! Authenticated requests against the registry.
//!
//! Implements the registry token flow for a single logical request:
//! 1. Send the request as-is
//! 2. On a 401 with a Bearer challenge, parse realm, service and scope
//! 3. Request a token from the realm
//! 4. Re-issue the original request once with the token
//!
//! Nothing is cached; every bearer request negotiates its own token.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use regex::Regex;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::{RegistryError, Result};
use crate::http::{HttpRequest, Recorder, RoundTripInfo};
use crate::request::{RegistryRequest, header_value};

const SCHEME_BEARER: &str = "bearer";

const CLAIM_REALM: &str = "realm";
const CLAIM_SERVICE: &str = "service";
const CLAIM_SCOPE: &str = "scope";

static AUTH_HEADER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(realm|service|scope)="([^"]*)"#).expect("auth header regex is valid")
});

/// Authorization to use for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Basic,
    Bearer,
}

/// Registry login credentials
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Configured, non-empty username.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    fn basic_header(&self, username: &str) -> String {
        let password = self.password.as_deref().unwrap_or_default();
        format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A parsed `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub scheme: String,
    pub realm: Option<String>,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl AuthChallenge {
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));

        let mut params: HashMap<String, String> = HashMap::new();
        for captures in AUTH_HEADER_REGEX.captures_iter(rest) {
            params.insert(captures[1].to_lowercase(), captures[2].to_string());
        }

        Self {
            scheme: scheme.to_lowercase(),
            realm: params.remove(CLAIM_REALM),
            service: params.remove(CLAIM_SERVICE),
            scope: params.remove(CLAIM_SCOPE),
        }
    }

    pub fn is_bearer(&self) -> bool {
        self.scheme == SCHEME_BEARER
    }
}

// Token response from the auth service. Docker's token server sends both
// fields, other registries only `access_token`.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    token: Option<String>,
}

/// Executes logical requests under a chosen [`AuthMode`].
#[derive(Clone)]
pub struct Authenticator {
    recorder: Recorder,
    credentials: Credentials,
}

impl Authenticator {
    pub fn new(recorder: Recorder, credentials: Credentials) -> Self {
        Self {
            recorder,
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Perform one logical request.
    ///
    /// For [`AuthMode::Bearer`] a 401 with a Bearer challenge triggers one token
    /// exchange and one re-issue of the request; the re-issued result is
    /// returned whatever its status.
    pub async fn execute(&self, request: &mut RegistryRequest, mode: AuthMode) -> Result<RoundTripInfo> {
        let http = match mode {
            AuthMode::None | AuthMode::Bearer => request.to_http()?,
            AuthMode::Basic => {
                let username = self.credentials.username().ok_or_else(|| {
                    RegistryError::Configuration("basic auth requires a username".to_string())
                })?;
                let header = self.credentials.basic_header(username);
                let mut http = request.to_http()?;
                http.headers.insert(AUTHORIZATION, header_value(&header)?);
                http
            }
        };

        if mode != AuthMode::Bearer {
            return self.dispatch(http).await;
        }

        let info = self.dispatch(http).await?;

        let challenge = match &info.response {
            Some(response) if response.status == StatusCode::UNAUTHORIZED => {
                response.challenge.as_deref().map(AuthChallenge::parse)
            }
            _ => None,
        };
        let Some(challenge) = challenge.filter(AuthChallenge::is_bearer) else {
            return Ok(info);
        };

        debug!(realm = ?challenge.realm, service = ?challenge.service, scope = ?challenge.scope, "bearer challenge");
        let token = self.fetch_token(&challenge).await?;

        let mut retry = request.to_http()?;
        retry
            .headers
            .insert(AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        self.dispatch(retry).await
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<RoundTripInfo> {
        let method = request.method.clone();
        let url = request.url.to_string();

        let info = self.recorder.round_trip(request).await;
        match &info.error {
            Some(message) => Err(RegistryError::Transport {
                method,
                url,
                message: message.clone(),
            }),
            None => Ok(info),
        }
    }

    /// Obtain a token from the challenge's realm.
    async fn fetch_token(&self, challenge: &AuthChallenge) -> Result<String> {
        let realm = challenge
            .realm
            .as_deref()
            .ok_or_else(|| RegistryError::TokenExchange("challenge carries no realm".to_string()))?;
        let mut url = Url::parse(realm)
            .map_err(|e| RegistryError::TokenExchange(format!("invalid realm {}: {}", realm, e)))?;

        if challenge.service.is_some() || challenge.scope.is_some() {
            let mut query = url.query_pairs_mut();
            if let Some(service) = &challenge.service {
                query.append_pair(CLAIM_SERVICE, service);
            }
            if let Some(scope) = &challenge.scope {
                query.append_pair(CLAIM_SCOPE, scope);
            }
        }

        let mut headers = HeaderMap::new();
        if let Some(username) = self.credentials.username() {
            headers.insert(
                AUTHORIZATION,
                header_value(&self.credentials.basic_header(username))?,
            );
        }

        let info = self
            .recorder
            .round_trip(HttpRequest {
                method: Method::GET,
                url,
                headers,
                body: Bytes::new(),
            })
            .await;

        let response = match (info.response, info.error) {
            (Some(response), _) => response,
            (None, error) => {
                return Err(RegistryError::TokenExchange(
                    error.unwrap_or_else(|| "no response from token endpoint".to_string()),
                ));
            }
        };

        if response.status != StatusCode::OK {
            return Err(RegistryError::TokenExchange(format!(
                "get access token failed, expected: {}, got: {}",
                StatusCode::OK,
                response.status
            )));
        }

        let token: TokenResponse = serde_json::from_slice(&response.body)
            .map_err(|e| RegistryError::TokenExchange(format!("invalid token response: {}", e)))?;

        token
            .access_token
            .or(token.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::TokenExchange("token response carries no access_token".to_string()))
    }
}
