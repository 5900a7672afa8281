use std::io::Read;

use bytes::Bytes;
use reqwest::{Method, StatusCode};
use tracing::{debug, info};
use url::Url;

use crate::error::{RegistryError, Result};
use crate::http::ResponseSnapshot;
use crate::models::{Descriptor, MEDIA_TYPE_OCTET_STREAM};
use crate::request::RegistryRequest;
use crate::transport::{AuthMode, Authenticator};

// Blob routes
const ROUTE_INITIATE_BLOB_UPLOAD: &str = "/v2/{name}/blobs/uploads/";
const ROUTE_BLOB: &str = "/v2/{name}/blobs/{digest}";

// Manifest routes
const ROUTE_MANIFEST: &str = "/v2/{name}/manifests/{reference}";

/// Content-addressable operations against one registry.
///
/// Every push returns the [`Descriptor`] of what was sent and every pull is
/// verified against the descriptor it was asked for.
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    authenticator: Authenticator,
    auth_mode: AuthMode,
}

impl Client {
    /// Create a client for the registry at `base_url`, authenticating
    /// registry calls with `auth_mode`.
    pub fn new(base_url: Url, authenticator: Authenticator, auth_mode: AuthMode) -> Self {
        Self {
            base_url,
            authenticator,
            auth_mode,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// Resolve a route or a `Location` header against the registry. Absolute
    /// URLs are returned unchanged.
    pub fn resolve(&self, location: &str) -> Result<Url> {
        Ok(self.base_url.join(location)?)
    }

    /// Execute the request and require the `expected` status code.
    pub async fn round_trip(
        &self,
        request: &mut RegistryRequest,
        expected: StatusCode,
        mode: AuthMode,
    ) -> Result<ResponseSnapshot> {
        let info = self.authenticator.execute(request, mode).await?;
        let response = info.response.ok_or_else(|| RegistryError::Transport {
            method: request.method.clone(),
            url: request.url.to_string(),
            message: info.error.unwrap_or_else(|| "no response".to_string()),
        })?;

        if response.status != expected {
            return Err(RegistryError::UnexpectedStatus {
                method: request.method.clone(),
                url: request.url.to_string(),
                expected,
                got: response.status,
                body: response.body_text(),
            });
        }

        Ok(response)
    }

    /// Upload a blob in three steps: initiate, PATCH the whole stream, then
    /// complete with the digest computed while the stream was sent.
    pub async fn push_blob<R: Read + Send + 'static>(&self, repo: &str, data: R) -> Result<Descriptor> {
        // Initiate blob upload
        let route = ROUTE_INITIATE_BLOB_UPLOAD.replace("{name}", repo);
        let mut initiate = RegistryRequest::new(Method::POST, self.resolve(&route)?);
        let response = self
            .round_trip(&mut initiate, StatusCode::ACCEPTED, self.auth_mode)
            .await?;
        let upload_url = self.location(&initiate, &response)?;

        // Upload blob
        let mut upload = RegistryRequest::new(Method::PATCH, upload_url)
            .content_type(MEDIA_TYPE_OCTET_STREAM)
            .body(data);
        let response = self
            .round_trip(&mut upload, StatusCode::ACCEPTED, self.auth_mode)
            .await?;
        let mut complete_url = self.location(&upload, &response)?;

        let (Some(digest), Some(size)) = (upload.body_digest(), upload.body_size()) else {
            return Err(RegistryError::Configuration("blob body was not transmitted".to_string()));
        };

        // Complete upload
        complete_url
            .query_pairs_mut()
            .append_pair("digest", &digest.to_string());
        let mut complete = RegistryRequest::new(Method::PUT, complete_url);
        self.round_trip(&mut complete, StatusCode::CREATED, self.auth_mode)
            .await?;

        debug!(repo, %digest, size, "pushed blob");
        Ok(Descriptor::new(MEDIA_TYPE_OCTET_STREAM, digest, size as i64))
    }

    /// Download a blob through its redirect and verify digest and size.
    pub async fn pull_blob(&self, repo: &str, desc: &Descriptor) -> Result<Bytes> {
        let route = ROUTE_BLOB
            .replace("{name}", repo)
            .replace("{digest}", &desc.digest.to_string());

        // Obtain the content location
        let mut locate = RegistryRequest::get(self.resolve(&route)?);
        let response = self
            .round_trip(&mut locate, StatusCode::TEMPORARY_REDIRECT, self.auth_mode)
            .await?;
        let content_url = self.location(&locate, &response)?;

        // Download content; the redirect target is never sent credentials
        let mut download = RegistryRequest::get(content_url);
        let response = self
            .round_trip(&mut download, StatusCode::OK, AuthMode::None)
            .await?;

        verify(&format!("blob {}", desc.digest), desc, &response)?;
        Ok(response.body)
    }

    /// Push manifest bytes exactly as given under `reference`.
    pub async fn push_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        manifest: Bytes,
    ) -> Result<Descriptor> {
        let mut request = RegistryRequest::new(Method::PUT, self.manifest_url(repo, reference)?)
            .content_type(media_type)
            .bytes_body(manifest);
        self.round_trip(&mut request, StatusCode::CREATED, self.auth_mode)
            .await?;

        let (Some(digest), Some(size)) = (request.body_digest(), request.body_size()) else {
            return Err(RegistryError::Configuration("manifest body was not transmitted".to_string()));
        };

        info!(repo, reference, %digest, size, "pushed manifest");
        Ok(Descriptor::new(media_type, digest, size as i64))
    }

    /// Pull a manifest by tag or digest and verify it against `desc`.
    pub async fn pull_manifest(&self, repo: &str, reference: &str, desc: &Descriptor) -> Result<Bytes> {
        let mut request =
            RegistryRequest::get(self.manifest_url(repo, reference)?).accept(desc.media_type.as_str());
        let response = self
            .round_trip(&mut request, StatusCode::OK, self.auth_mode)
            .await?;

        verify(&format!("manifest {}:{}", repo, reference), desc, &response)?;
        Ok(response.body)
    }

    fn manifest_url(&self, repo: &str, reference: &str) -> Result<Url> {
        let route = ROUTE_MANIFEST
            .replace("{name}", repo)
            .replace("{reference}", reference);
        self.resolve(&route)
    }

    fn location(&self, request: &RegistryRequest, response: &ResponseSnapshot) -> Result<Url> {
        let location = response
            .location
            .as_deref()
            .ok_or_else(|| RegistryError::MissingHeader {
                header: "Location",
                url: request.url.to_string(),
            })?;
        self.resolve(location)
    }
}

/// Check downloaded content against the descriptor it was requested by.
fn verify(subject: &str, desc: &Descriptor, response: &ResponseSnapshot) -> Result<()> {
    if response.size as i64 != desc.size {
        return Err(RegistryError::Integrity {
            subject: subject.to_string(),
            field: "size",
            expected: desc.size.to_string(),
            got: response.size.to_string(),
        });
    }

    if response.digest != desc.digest {
        return Err(RegistryError::Integrity {
            subject: subject.to_string(),
            field: "digest",
            expected: desc.digest.to_string(),
            got: response.digest.to_string(),
        });
    }

    Ok(())
}
