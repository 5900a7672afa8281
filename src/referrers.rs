//! Referrers: artifacts pushed against a subject manifest and discovered
//! again through the ORAS referrers listing.

use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;

use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::{info, warn};
use url::Url;

use crate::client::Client;
use crate::digest::OciDigest;
use crate::error::{RegistryError, Result};
use crate::http::ResponseSnapshot;
use crate::image::{CHECK_HEALTH_MEDIA_TYPE, test_layer};
use crate::models::{
    ANNOTATION_CREATED, ArtifactManifest, Descriptor, MEDIA_TYPE_ARTIFACT_MANIFEST, ReferrersResponse,
};
use crate::request::RegistryRequest;

pub const CHECK_HEALTH_ARTIFACT_TYPE: &str = "application/acr.checkhealth.artifact.test";

/// Upper bound on referrers pushed by one check.
pub const MAX_REFERRERS: usize = 100;

const ROUTE_REFERRERS: &str = "/oras/artifacts/v1/{name}/manifests/{digest}/referrers";

const QUERY_NEXT_TOKEN: &str = "nextToken";

/// Clamp a requested referrer count into `1..=MAX_REFERRERS`.
pub fn clamp_referrer_count(count: i64) -> usize {
    let clamped = count.clamp(1, MAX_REFERRERS as i64) as usize;
    if clamped as i64 != count {
        warn!(requested = count, adjusted = clamped, "referrer count limited to 1..={}", MAX_REFERRERS);
    }
    clamped
}

/// Where the next page of a listing lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// Repeat the listing with `?nextToken=<token>`.
    Token(String),
    /// Follow the URL from a `Link: <url>; rel="next"` header.
    Link(Url),
}

impl Continuation {
    pub fn next_url(&self, listing: &Url) -> Url {
        match self {
            Continuation::Token(token) => {
                let mut url = listing.clone();
                url.query_pairs_mut().clear().append_pair(QUERY_NEXT_TOKEN, token);
                url
            }
            Continuation::Link(url) => url.clone(),
        }
    }
}

/// One page of a referrers listing.
#[derive(Debug, Clone)]
pub struct ReferrersPage {
    pub items: Vec<Descriptor>,
    pub next: Option<Continuation>,
}

impl ReferrersPage {
    /// Parse a listing response for `subject` fetched from `url`. A
    /// continuation token in the body takes precedence over a `Link` header.
    pub fn parse(url: &Url, subject: &OciDigest, response: &ResponseSnapshot) -> Result<Self> {
        let body: ReferrersResponse = serde_json::from_slice(&response.body)?;

        if let Some(digest) = body.digest.as_deref().filter(|d| !d.is_empty()) {
            if digest != subject.to_string() {
                return Err(RegistryError::ReferrersMismatch(format!(
                    "listing is for {}, expected: {}",
                    digest, subject
                )));
            }
        }

        let next = match body.next_token.filter(|t| !t.is_empty()) {
            Some(token) => Some(Continuation::Token(token)),
            None => match response.link.as_deref().and_then(next_link) {
                Some(link) => Some(Continuation::Link(url.join(link)?)),
                None => None,
            },
        };

        Ok(Self {
            items: body.referrers,
            next,
        })
    }
}

/// Extract the target of the `rel="next"` link-value of a `Link` header that
/// may list several links.
pub fn next_link(header: &str) -> Option<&str> {
    let mut rest = header;

    while let Some(start) = rest.find('<') {
        let end = start + rest[start..].find('>')?;
        let target = &rest[start + 1..end];

        // Parameters of this link-value run up to the next one
        let tail = &rest[end + 1..];
        let (params, next) = match tail.find(',') {
            Some(comma) => (&tail[..comma], &tail[comma + 1..]),
            None => (tail, ""),
        };

        let is_next = params.split(';').any(|param| {
            param
                .trim()
                .strip_prefix("rel=")
                .map(|rel| rel.trim_matches('"').split_whitespace().any(|r| r == "next"))
                .unwrap_or(false)
        });
        if is_next {
            return Some(target);
        }
        rest = next;
    }

    None
}

/// Compare discovered referrers against the ones that were pushed.
///
/// Every discovered entry must equal exactly one expected entry on digest,
/// size, media type and artifact type, and every expected entry must be
/// matched.
pub fn match_referrers(discovered: &[Descriptor], expected: &[Descriptor]) -> Result<()> {
    if discovered.len() != expected.len() {
        return Err(RegistryError::ReferrersMismatch(format!(
            "unexpected referrers count, expected: {}, got: {}",
            expected.len(),
            discovered.len()
        )));
    }

    let mut matched: HashSet<&OciDigest> = HashSet::new();
    for got in discovered {
        if !expected.iter().any(|want| want == got) {
            return Err(RegistryError::ReferrersMismatch(format!(
                "discovered referrer {} was not pushed",
                got.digest
            )));
        }
        if !matched.insert(&got.digest) {
            return Err(RegistryError::DuplicateReferrer(got.digest.clone()));
        }
    }

    if let Some(missing) = expected.iter().find(|want| !matched.contains(&want.digest)) {
        return Err(RegistryError::ReferrersMismatch(format!(
            "pushed referrer {} was not discovered",
            missing.digest
        )));
    }

    Ok(())
}

impl Client {
    /// Push `count` artifacts, each with one small blob, whose subject is
    /// `subject`. Returns their descriptors in push order.
    pub async fn push_referrers(&self, repo: &str, subject: &Descriptor, count: i64) -> Result<Vec<Descriptor>> {
        let count = clamp_referrer_count(count);
        let mut referrers = Vec::with_capacity(count);

        for i in 0..count {
            // Push artifact blob
            let layer = format!("{}  ~ {}", test_layer(&Utc::now().to_rfc3339()), i);
            let blob = self.push_blob(repo, Cursor::new(layer.into_bytes())).await?;

            let annotations = (i % 2 == 0)
                .then(|| BTreeMap::from([(ANNOTATION_CREATED.to_string(), Utc::now().to_rfc3339())]));

            let artifact = ArtifactManifest {
                media_type: MEDIA_TYPE_ARTIFACT_MANIFEST.to_string(),
                artifact_type: CHECK_HEALTH_ARTIFACT_TYPE.to_string(),
                blobs: vec![blob.with_media_type(CHECK_HEALTH_MEDIA_TYPE)],
                subject: Some(Descriptor::new(
                    subject.media_type.clone(),
                    subject.digest.clone(),
                    subject.size,
                )),
                annotations,
            };
            let artifact_bytes = Bytes::from(serde_json::to_vec(&artifact)?);

            let tag = format!("art-{}-{}", i + 1, Utc::now().timestamp());
            info!("push ORAS artifact {}:{}", repo, tag);

            // Push artifact
            let mut desc = self
                .push_manifest(repo, &tag, MEDIA_TYPE_ARTIFACT_MANIFEST, artifact_bytes)
                .await?;
            desc.artifact_type = Some(CHECK_HEALTH_ARTIFACT_TYPE.to_string());
            referrers.push(desc);
        }

        Ok(referrers)
    }

    /// Enumerate every page of the referrers listing for `subject`.
    pub async fn discover_referrers(&self, repo: &str, subject: &OciDigest) -> Result<Vec<Descriptor>> {
        let route = ROUTE_REFERRERS
            .replace("{name}", repo)
            .replace("{digest}", &subject.to_string());
        let listing = self.resolve(&route)?;

        let mut referrers = Vec::new();
        let mut url = listing.clone();
        let mut page = 0;

        loop {
            page += 1;
            info!(page, url = %url, "enumerating referrers");

            let mut request = RegistryRequest::get(url.clone());
            let response = self
                .round_trip(&mut request, StatusCode::OK, self.auth_mode())
                .await?;

            let ReferrersPage { items, next } = ReferrersPage::parse(&url, subject, &response)?;
            referrers.extend(items);

            match next {
                Some(continuation) => url = continuation.next_url(&listing),
                None => break,
            }
        }

        info!("found {} referrers", referrers.len());
        Ok(referrers)
    }

    /// Discover the referrers of `subject`, match them against `expected`, and
    /// pull every one of them back.
    pub async fn verify_referrers(&self, repo: &str, subject: &Descriptor, expected: &[Descriptor]) -> Result<()> {
        info!("discover referrers for {}@{}", repo, subject.digest);

        let discovered = self.discover_referrers(repo, &subject.digest).await?;
        match_referrers(&discovered, expected)?;

        for referrer in &discovered {
            info!("pull referrer {}@{}", repo, referrer.digest);

            // Pull artifact manifest
            let bytes = self
                .pull_manifest(repo, &referrer.digest.to_string(), referrer)
                .await?;
            let artifact: ArtifactManifest = serde_json::from_slice(&bytes)?;

            // Pull artifact blob
            let blob = artifact.blobs.first().ok_or_else(|| {
                RegistryError::InvalidManifest(format!("artifact {} has no blobs", referrer.digest))
            })?;
            self.pull_blob(repo, blob).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpResponse;
    use crate::models::MEDIA_TYPE_OCTET_STREAM;
    use reqwest::header::{HeaderValue, LINK};

    fn referrer(content: &[u8]) -> Descriptor {
        let mut desc = Descriptor::for_bytes(MEDIA_TYPE_ARTIFACT_MANIFEST, content);
        desc.artifact_type = Some(CHECK_HEALTH_ARTIFACT_TYPE.to_string());
        desc
    }

    fn listing() -> Url {
        Url::parse("https://registry.test/oras/artifacts/v1/repo/manifests/sha256:abc/referrers").unwrap()
    }

    fn subject() -> OciDigest {
        OciDigest::sha256(b"subject")
    }

    fn page(body: String, link: Option<&'static str>) -> ResponseSnapshot {
        let mut response = HttpResponse::new(StatusCode::OK);
        response.body = Bytes::from(body);
        if let Some(link) = link {
            response.headers.insert(LINK, HeaderValue::from_static(link));
        }
        ResponseSnapshot::from(response)
    }

    #[test]
    fn test_clamp_referrer_count() {
        assert_eq!(clamp_referrer_count(0), 1);
        assert_eq!(clamp_referrer_count(-5), 1);
        assert_eq!(clamp_referrer_count(1), 1);
        assert_eq!(clamp_referrer_count(42), 42);
        assert_eq!(clamp_referrer_count(100), 100);
        assert_eq!(clamp_referrer_count(1000), 100);
    }

    #[test]
    fn test_next_link() {
        assert_eq!(
            next_link(r#"</v2/repo/referrers?last=2>; rel="next""#),
            Some("/v2/repo/referrers?last=2")
        );
        assert_eq!(next_link("<https://r.test/p2>; rel=next"), Some("https://r.test/p2"));
        assert_eq!(next_link(r#"</p0>; rel="prev""#), None);
        assert_eq!(next_link("no brackets"), None);

        // only the rel of the link itself counts
        assert_eq!(next_link(r#"</p0>; rel="prev", </p2>; rel="next""#), Some("/p2"));
        assert_eq!(next_link(r#"</p2>; rel="next", </p0>; rel="prev""#), Some("/p2"));
        assert_eq!(next_link(r#"</p0>; rel="prev", </p9>; title="next""#), None);
    }

    #[test]
    fn test_page_with_token() {
        let body = format!(
            r#"{{"@nextToken":"X","referrers":[{}]}}"#,
            serde_json::to_string(&referrer(b"a")).unwrap()
        );
        let parsed = ReferrersPage::parse(&listing(), &subject(), &page(body, None)).unwrap();

        assert_eq!(parsed.items, vec![referrer(b"a")]);
        assert_eq!(parsed.next, Some(Continuation::Token("X".to_string())));
        assert_eq!(
            parsed.next.unwrap().next_url(&listing()).query(),
            Some("nextToken=X")
        );
    }

    #[test]
    fn test_page_with_relative_link() {
        let parsed = ReferrersPage::parse(
            &listing(),
            &subject(),
            &page(r#"{"referrers":[]}"#.to_string(), Some(r#"</next/page?last=1>; rel="next""#)),
        )
        .unwrap();

        let next = parsed.next.unwrap();
        assert_eq!(
            next.next_url(&listing()).as_str(),
            "https://registry.test/next/page?last=1"
        );
    }

    #[test]
    fn test_last_page_has_no_continuation() {
        let parsed =
            ReferrersPage::parse(&listing(), &subject(), &page(r#"{"@nextToken":"","referrers":[]}"#.to_string(), None))
                .unwrap();
        assert!(parsed.next.is_none());
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_page_for_another_subject_is_rejected() {
        let other = OciDigest::sha256(b"other");
        let body = format!(r#"{{"digest":"{}","referrers":[]}}"#, other);
        let err = ReferrersPage::parse(&listing(), &subject(), &page(body, None)).unwrap_err();
        assert!(matches!(err, RegistryError::ReferrersMismatch(_)));

        let body = format!(r#"{{"digest":"{}","referrers":[]}}"#, subject());
        assert!(ReferrersPage::parse(&listing(), &subject(), &page(body, None)).is_ok());
    }

    #[test]
    fn test_match_referrers_in_any_order() {
        let expected = vec![referrer(b"a"), referrer(b"b"), referrer(b"c")];
        let discovered = vec![referrer(b"c"), referrer(b"a"), referrer(b"b")];
        assert!(match_referrers(&discovered, &expected).is_ok());
    }

    #[test]
    fn test_match_referrers_count_mismatch() {
        let expected = vec![referrer(b"a"), referrer(b"b")];
        let err = match_referrers(&[referrer(b"a")], &expected).unwrap_err();
        assert!(matches!(err, RegistryError::ReferrersMismatch(_)));
    }

    #[test]
    fn test_match_referrers_duplicate() {
        let expected = vec![referrer(b"a"), referrer(b"b")];
        let discovered = vec![referrer(b"a"), referrer(b"a")];
        let err = match_referrers(&discovered, &expected).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateReferrer(d) if d == referrer(b"a").digest));
    }

    #[test]
    fn test_match_referrers_compares_all_fields() {
        let expected = vec![referrer(b"a")];

        let mut wrong_type = referrer(b"a");
        wrong_type.artifact_type = None;
        assert!(match_referrers(&[wrong_type], &expected).is_err());

        let wrong_media = referrer(b"a").with_media_type(MEDIA_TYPE_OCTET_STREAM);
        assert!(match_referrers(&[wrong_media], &expected).is_err());

        let mut wrong_size = referrer(b"a");
        wrong_size.size += 1;
        assert!(match_referrers(&[wrong_size], &expected).is_err());
    }
}
