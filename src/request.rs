use std::fmt;
use std::io::{Cursor, Read};

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use url::Url;

use crate::digest::{DigestReader, OciDigest};
use crate::error::{RegistryError, Result};
use crate::http::HttpRequest;

type BodyReader = DigestReader<Box<dyn Read + Send>>;

/// A logical request to the registry.
///
/// The body is read exactly once, the first time the request is turned into
/// an [`HttpRequest`]. Its digest and size are known from then on and the
/// drained bytes are reused if the request has to be sent again.
pub struct RegistryRequest {
    pub method: Method,
    pub url: Url,
    pub accept: Option<String>,
    pub content_type: Option<String>,
    body: Option<BodyReader>,
    payload: Option<Bytes>,
}

impl RegistryRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            accept: None,
            content_type: None,
            body: None,
            payload: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn accept(mut self, media_type: impl Into<String>) -> Self {
        self.accept = Some(media_type.into());
        self
    }

    pub fn content_type(mut self, media_type: impl Into<String>) -> Self {
        self.content_type = Some(media_type.into());
        self
    }

    pub fn body<R: Read + Send + 'static>(mut self, reader: R) -> Self {
        self.body = Some(DigestReader::new(Box::new(reader)));
        self.payload = None;
        self
    }

    pub fn bytes_body(self, data: Bytes) -> Self {
        self.body(Cursor::new(data))
    }

    /// Digest of the transmitted body, once it has been drained.
    pub fn body_digest(&self) -> Option<OciDigest> {
        match (&self.body, &self.payload) {
            (Some(reader), Some(_)) => Some(reader.digest()),
            _ => None,
        }
    }

    /// Size of the transmitted body, once it has been drained.
    pub fn body_size(&self) -> Option<u64> {
        match (&self.body, &self.payload) {
            (Some(reader), Some(_)) => Some(reader.size()),
            _ => None,
        }
    }

    fn drain_body(&mut self) -> Result<Bytes> {
        if let Some(payload) = &self.payload {
            return Ok(payload.clone());
        }

        let Some(reader) = self.body.as_mut() else {
            return Ok(Bytes::new());
        };

        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer)?;
        let payload = Bytes::from(buffer);
        self.payload = Some(payload.clone());
        Ok(payload)
    }

    /// Build the physical request, draining the body on first use.
    pub(crate) fn to_http(&mut self) -> Result<HttpRequest> {
        let body = self.drain_body()?;

        let mut headers = HeaderMap::new();
        if let Some(accept) = &self.accept {
            headers.insert(ACCEPT, header_value(accept)?);
        }
        if let Some(content_type) = &self.content_type {
            headers.insert(CONTENT_TYPE, header_value(content_type)?);
        }

        Ok(HttpRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers,
            body,
        })
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RegistryError::Configuration(format!("invalid header value {:?}: {}", value, e)))
}

impl fmt::Debug for RegistryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("accept", &self.accept)
            .field("content_type", &self.content_type)
            .field("body_size", &self.body_size())
            .finish()
    }
}
