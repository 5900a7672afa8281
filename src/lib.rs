// Re-export modules needed for testing
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod http;
pub mod image;
pub mod models;
pub mod proxy;
pub mod referrers;
pub mod request;
pub mod stats;
pub mod transport;

pub use client::Client;
pub use config::Options;
pub use error::{RegistryError, Result};
pub use http::{HttpTransport, Recorder, ReqwestTransport};
pub use proxy::Proxy;
pub use transport::{AuthMode, Authenticator, Credentials};
