use std::io::Cursor;

use bytes::Bytes;
use chrono::Utc;
use tracing::info;

use crate::client::Client;
use crate::error::{RegistryError, Result};
use crate::models::{Descriptor, ImageConfig, ImageManifest, MEDIA_TYPE_IMAGE_MANIFEST};

pub const CHECK_HEALTH_AUTHOR: &str = "ACR Check Health";
pub const CHECK_HEALTH_MEDIA_TYPE: &str = "application/acr.checkhealth.test";

/// Layer content, stamped with the time it was generated.
pub fn test_layer(now: &str) -> String {
    format!("Test layer authored by {} at {}", CHECK_HEALTH_AUTHOR, now)
}

/// An image whose blobs are in the registry but whose manifest is not yet.
#[derive(Debug, Clone)]
pub struct StagedImage {
    pub manifest: Bytes,
    pub descriptor: Descriptor,
}

impl Client {
    /// Push a config blob and one layer blob, then serialise the manifest that
    /// ties them together without pushing it.
    pub async fn stage_image(&self, repo: &str) -> Result<StagedImage> {
        let config = ImageConfig {
            author: Some(CHECK_HEALTH_AUTHOR.to_string()),
            created: None,
        };
        let config_bytes = serde_json::to_vec(&config)?;

        // Upload config blob
        let config_desc = self.push_blob(repo, Cursor::new(config_bytes)).await?;

        // Upload a layer
        let layer = test_layer(&Utc::now().to_rfc3339());
        let layer_desc = self.push_blob(repo, Cursor::new(layer.into_bytes())).await?;

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_IMAGE_MANIFEST.to_string()),
            config: config_desc.with_media_type(CHECK_HEALTH_MEDIA_TYPE),
            layers: vec![layer_desc.with_media_type(CHECK_HEALTH_MEDIA_TYPE)],
            annotations: None,
        };

        let manifest = Bytes::from(serde_json::to_vec(&manifest)?);
        let descriptor = Descriptor::for_bytes(MEDIA_TYPE_IMAGE_MANIFEST, &manifest);
        Ok(StagedImage {
            manifest,
            descriptor,
        })
    }

    /// Push a staged image manifest and confirm the registry received exactly
    /// the staged bytes.
    pub async fn push_staged(&self, repo: &str, tag: &str, staged: &StagedImage) -> Result<Descriptor> {
        let pushed = self
            .push_manifest(repo, tag, MEDIA_TYPE_IMAGE_MANIFEST, staged.manifest.clone())
            .await?;

        if pushed != staged.descriptor {
            return Err(RegistryError::Integrity {
                subject: format!("manifest {}:{}", repo, tag),
                field: "digest",
                expected: staged.descriptor.digest.to_string(),
                got: pushed.digest.to_string(),
            });
        }

        Ok(pushed)
    }

    /// Create and push a simple OCI image.
    pub async fn push_image(&self, repo: &str, tag: &str) -> Result<Descriptor> {
        info!("push OCI image {}:{}", repo, tag);
        let staged = self.stage_image(repo).await?;
        self.push_staged(repo, tag, &staged).await
    }

    /// Pull an image by tag or digest and verify the manifest and every blob
    /// it references.
    pub async fn pull_image(&self, repo: &str, reference: &str, desc: &Descriptor) -> Result<ImageManifest> {
        info!("pull OCI image {}:{}", repo, reference);

        let manifest_bytes = self.pull_manifest(repo, reference, desc).await?;
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        // Pull config blob
        self.pull_blob(repo, &manifest.config).await?;

        // Pull layer blobs
        if manifest.layers.is_empty() {
            return Err(RegistryError::InvalidManifest(format!(
                "image {}:{} has no layers",
                repo, reference
            )));
        }
        for layer in &manifest.layers {
            self.pull_blob(repo, layer).await?;
        }

        Ok(manifest)
    }
}
