use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::OciDigest;

pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_ARTIFACT_MANIFEST: &str = "application/vnd.cncf.oras.artifact.manifest.v1+json";
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Annotation carrying the creation time of an artifact.
pub const ANNOTATION_CREATED: &str = "io.cncf.oras.artifact.created";

/// Represents a descriptor for a content blob in an OCI registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content
    pub media_type: String,
    /// Digest of the referenced content
    pub digest: OciDigest,
    /// Size of the referenced content in bytes
    pub size: i64,
    /// Artifact type, set on referrer descriptors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: OciDigest, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            artifact_type: None,
        }
    }

    /// Descriptor for the given bytes, computed locally.
    pub fn for_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, OciDigest::sha256(data), data.len() as i64)
    }

    /// The same content under another media type.
    pub fn with_media_type(&self, media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            ..self.clone()
        }
    }
}

/// Represents an OCI image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version of the manifest
    pub schema_version: i32,
    /// Media type of the manifest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Descriptor for the config blob
    pub config: Descriptor,
    /// Descriptors for the layer blobs
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Represents an ORAS artifact manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    /// Media type of the artifact manifest
    pub media_type: String,
    /// Type of the artifact
    pub artifact_type: String,
    /// Descriptors for the artifact blobs
    #[serde(default)]
    pub blobs: Vec<Descriptor>,
    /// Manifest this artifact refers to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Minimal image config pushed as the config blob
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
}

/// One page of a referrers listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReferrersResponse {
    /// Digest of the subject the listing is for
    #[serde(default)]
    pub digest: Option<String>,
    /// Continuation token, absent on the last page
    #[serde(default, rename = "@nextToken", alias = "nextToken")]
    pub next_token: Option<String>,
    /// Referrers on this page; OCI image-index listings name the field `manifests`
    #[serde(default, alias = "manifests")]
    pub referrers: Vec<Descriptor>,
}
