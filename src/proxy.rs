use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reqwest::StatusCode;
use tracing::{info, instrument};
use tokio::net::lookup_host;
use url::{Host, Url};

use crate::client::Client;
use crate::config::Options;
use crate::error::{RegistryError, Result};
use crate::http::{HttpTransport, Recorder};
use crate::models::Descriptor;
use crate::request::RegistryRequest;
use crate::stats::Observations;
use crate::transport::{AuthMode, Authenticator};

// Ping routes
const ROUTE_FRONTEND_PING: &str = "/v2/";
const ROUTE_DATA_ENDPOINT_PING: &str = "/";

pub const CHECK_HEALTH_REPO_PREFIX: &str = "acrcheckhealth";

/// Runs named health checks against one registry.
pub struct Proxy {
    options: Options,
    client: Client,
    observations: Observations,
}

impl Proxy {
    /// Create a proxy that sends every request through `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>, options: Options) -> Result<Self> {
        options.validate()?;

        let base_url = host_url(options.scheme(), &options.login_server)?;
        let recorder = Recorder::new(transport);
        let authenticator = Authenticator::new(recorder, options.credentials());
        let client = Client::new(base_url, authenticator, options.auth_mode());

        Ok(Self {
            options,
            client,
            observations: Observations::new(),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Step timings recorded so far.
    pub fn observations(&self) -> &Observations {
        &self.observations
    }

    /// Resolve the login server and the data endpoint before talking to them.
    #[instrument(skip(self), fields(login_server = %self.options.login_server))]
    pub async fn resolve_endpoints(&self) -> Result<Vec<(String, Vec<SocketAddr>)>> {
        let mut hosts = vec![self.options.login_server.as_str()];
        hosts.extend(self.options.data_endpoint.as_deref().filter(|d| !d.is_empty()));

        let mut resolved = Vec::with_capacity(hosts.len());
        for host in hosts {
            let addrs = self.step("resolve endpoint", resolve(self.options.scheme(), host)).await?;
            info!(host, addresses = ?addrs, "resolved");
            resolved.push((host.to_string(), addrs));
        }
        Ok(resolved)
    }

    /// Ping the frontend with each auth mode, then the data endpoint.
    #[instrument(skip(self), fields(login_server = %self.options.login_server))]
    pub async fn ping(&self) -> Result<()> {
        info!("pinging frontend");
        let frontend = self.client.resolve(ROUTE_FRONTEND_PING)?;

        self.step("ping frontend anonymously", self.expect(&frontend, StatusCode::UNAUTHORIZED, AuthMode::None))
            .await?;

        if self.options.has_username() {
            self.step("ping frontend with basic auth", self.expect(&frontend, StatusCode::OK, AuthMode::Basic))
                .await?;
        }

        if !self.options.basic_auth_only {
            self.step("ping frontend with bearer auth", self.expect(&frontend, StatusCode::OK, AuthMode::Bearer))
                .await?;
        }

        if let Some(data_endpoint) = self.options.data_endpoint.as_deref().filter(|d| !d.is_empty()) {
            info!("pinging data endpoint");
            let url = host_url(self.options.scheme(), data_endpoint)?.join(ROUTE_DATA_ENDPOINT_PING)?;
            self.step("ping data endpoint", self.expect(&url, StatusCode::FORBIDDEN, AuthMode::None))
                .await?;
        }

        info!("ping was successful");
        Ok(())
    }

    /// Push a small image and pull it back.
    #[instrument(skip(self), fields(login_server = %self.options.login_server))]
    pub async fn check_health(&self) -> Result<()> {
        let (repo, tag) = session_names();

        let desc = self.step("push image", self.client.push_image(&repo, &tag)).await?;
        self.step("pull image", self.client.pull_image(&repo, &tag, &desc))
            .await?;

        info!("check-health was successful");
        Ok(())
    }

    /// Push an image and `count` referrers of it, discover and verify the
    /// referrers, then pull the image back.
    #[instrument(skip(self), fields(login_server = %self.options.login_server))]
    pub async fn check_referrers(&self, count: i64) -> Result<()> {
        let (repo, tag) = session_names();

        let subject = self.step("push image", self.client.push_image(&repo, &tag)).await?;
        let pushed = self
            .step("push referrers", self.client.push_referrers(&repo, &subject, count))
            .await?;
        self.step("verify referrers", self.client.verify_referrers(&repo, &subject, &pushed))
            .await?;

        info!("subject for {} referrers was pushed as {}:{}", pushed.len(), repo, tag);
        self.step("pull image", self.client.pull_image(&repo, &tag, &subject))
            .await?;

        info!("check-referrers was successful");
        Ok(())
    }

    /// Like [`Proxy::check_referrers`], but the referrers are pushed and
    /// verified before the subject manifest exists in the registry.
    #[instrument(skip(self), fields(login_server = %self.options.login_server))]
    pub async fn check_referrers_out_of_order(&self, count: i64) -> Result<()> {
        let (repo, tag) = session_names();

        let staged = self.step("stage subject", self.client.stage_image(&repo)).await?;
        let subject = staged.descriptor.clone();
        info!("subject {}@{} staged without manifest", repo, subject.digest);

        let pushed = self
            .step("push referrers", self.client.push_referrers(&repo, &subject, count))
            .await?;
        self.step("verify referrers", self.client.verify_referrers(&repo, &subject, &pushed))
            .await?;

        let pushed_subject: Descriptor = self
            .step("push subject", self.client.push_staged(&repo, &tag, &staged))
            .await?;
        self.step("pull subject", self.client.pull_image(&repo, &tag, &pushed_subject))
            .await?;

        info!("check-referrers (out of order) was successful");
        Ok(())
    }

    async fn expect(&self, url: &Url, expected: StatusCode, mode: AuthMode) -> Result<()> {
        let mut request = RegistryRequest::get(url.clone());
        self.client.round_trip(&mut request, expected, mode).await?;
        Ok(())
    }

    /// Run one step of a check, recording its duration and naming it in any
    /// error it returns.
    async fn step<T>(&self, name: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let result = fut.await;
        self.observations
            .record(name, started.elapsed().as_millis() as u64);
        result.map_err(|e| e.in_step(name))
    }
}

fn host_url(scheme: &str, host: &str) -> Result<Url> {
    Url::parse(&format!("{}://{}", scheme, host.trim_end_matches('/')))
        .map_err(|e| RegistryError::Configuration(format!("invalid registry host {:?}: {}", host, e)))
}

async fn resolve(scheme: &str, host: &str) -> Result<Vec<SocketAddr>> {
    let url = host_url(scheme, host)?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RegistryError::Configuration(format!("no port for {}", host)))?;

    match url.host() {
        Some(Host::Ipv4(ip)) => Ok(vec![SocketAddr::new(ip.into(), port)]),
        Some(Host::Ipv6(ip)) => Ok(vec![SocketAddr::new(ip.into(), port)]),
        Some(Host::Domain(domain)) => {
            let addrs: Vec<SocketAddr> = lookup_host((domain, port))
                .await
                .map_err(|e| RegistryError::Resolve {
                    host: host.to_string(),
                    message: e.to_string(),
                })?
                .collect();
            if addrs.is_empty() {
                return Err(RegistryError::Resolve {
                    host: host.to_string(),
                    message: "no addresses".to_string(),
                });
            }
            Ok(addrs)
        }
        None => Err(RegistryError::Configuration(format!("invalid registry host {:?}", host))),
    }
}

/// Fresh repository and tag names for one check.
fn session_names() -> (String, String) {
    let now = Utc::now();
    (
        format!("{}{}", CHECK_HEALTH_REPO_PREFIX, now.timestamp()),
        now.timestamp().to_string(),
    )
}
