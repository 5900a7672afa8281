use std::env;
use std::fmt;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::{RegistryError, Result};
use crate::transport::{AuthMode, Credentials};

/// Session options shared by every check.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Registry login server, such as myregistry.azurecr.io
    pub login_server: String,
    /// Registry data endpoint, such as myregistry.southindia.data.azurecr.io
    pub data_endpoint: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Access the registry over plain HTTP
    pub insecure: bool,
    /// Only use basic auth against the registry
    pub basic_auth_only: bool,
    /// Per-request timeout of the HTTP transport
    pub timeout_secs: Option<u64>,
}

impl Options {
    /// Load options from `config/default`, `config/<RUN_MODE>` and
    /// `REGCHECK_*` environment variables, in increasing precedence.
    pub fn load() -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "dev".into());

        let config = Config::builder()
            .set_default("insecure", false)?
            .set_default("basic_auth_only", false)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("REGCHECK").try_parsing(true))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.login_server.trim().is_empty() {
            return Err(RegistryError::Configuration("login server name required".to_string()));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Auth mode for registry calls in this session.
    pub fn auth_mode(&self) -> AuthMode {
        if self.basic_auth_only {
            AuthMode::Basic
        } else {
            AuthMode::Bearer
        }
    }

    pub fn scheme(&self) -> &'static str {
        if self.insecure { "http" } else { "https" }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn has_username(&self) -> bool {
        self.username.as_deref().is_some_and(|u| !u.is_empty())
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("login_server", &self.login_server)
            .field("data_endpoint", &self.data_endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .field("basic_auth_only", &self.basic_auth_only)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}
