use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use regcheck::{Options, Proxy, ReqwestTransport};

/// Check the health of a container registry
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// Registry username
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Registry password
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Registry data endpoint, pinged if set
    #[arg(short, long, global = true)]
    data_endpoint: Option<String>,

    /// Use plain HTTP instead of HTTPS
    #[arg(long, global = true)]
    insecure: bool,

    /// Only use basic auth against the registry
    #[arg(long, global = true)]
    basic_auth_only: bool,

    /// Per-request timeout in seconds
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Log at trace level for regcheck itself, including auth challenges
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ping the registry frontend and data endpoint
    Ping {
        /// Registry login server, such as myregistry.azurecr.io
        login_server: Option<String>,
    },

    /// Push an image to the registry and pull it back
    CheckHealth {
        /// Registry login server, such as myregistry.azurecr.io
        login_server: Option<String>,
    },

    /// Push an image with referrers, discover them and pull everything back
    CheckReferrers {
        /// Registry login server, such as myregistry.azurecr.io
        login_server: Option<String>,

        /// Number of referrers to push, between 1 and 100
        #[arg(long, default_value_t = 1)]
        referrers: i64,

        /// Push the referrers before the subject manifest
        #[arg(long)]
        out_of_order: bool,
    },
}

impl Commands {
    fn login_server(&self) -> Option<&str> {
        match self {
            Commands::Ping { login_server }
            | Commands::CheckHealth { login_server }
            | Commands::CheckReferrers { login_server, .. } => login_server.as_deref(),
        }
    }
}

/// Overlay command line flags on the loaded options.
fn merge_options(mut options: Options, cli: &Cli) -> Options {
    let global = &cli.global;

    if let Some(login_server) = cli.command.login_server() {
        options.login_server = login_server.to_string();
    }
    if global.username.is_some() {
        options.username = global.username.clone();
    }
    if global.password.is_some() {
        options.password = global.password.clone();
    }
    if global.data_endpoint.is_some() {
        options.data_endpoint = global.data_endpoint.clone();
    }
    if global.timeout.is_some() {
        options.timeout_secs = global.timeout;
    }
    options.insecure |= global.insecure;
    options.basic_auth_only |= global.basic_auth_only;

    options
}

async fn run(proxy: &Proxy, command: &Commands) -> Result<()> {
    proxy
        .resolve_endpoints()
        .await
        .context("name resolution failed")?;
    proxy.ping().await.context("ping failed")?;

    match command {
        Commands::Ping { .. } => {}
        Commands::CheckHealth { .. } => {
            proxy.check_health().await.context("check-health failed")?;
        }
        Commands::CheckReferrers {
            referrers,
            out_of_order,
            ..
        } => {
            if *out_of_order {
                proxy
                    .check_referrers_out_of_order(*referrers)
                    .await
                    .context("check-referrers failed")?;
            } else {
                proxy
                    .check_referrers(*referrers)
                    .await
                    .context("check-referrers failed")?;
            }
        }
    }

    Ok(())
}

/// `--trace` raises only this crate, dependencies stay at info.
fn log_filter(trace: bool) -> EnvFilter {
    if trace {
        EnvFilter::new("info,regcheck=trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt().with_env_filter(log_filter(cli.global.trace)).init();

    let options = Options::load().context("failed to load configuration")?;
    let options = merge_options(options, &cli);
    info!(?options, "starting");

    let transport = ReqwestTransport::new(options.timeout()).context("failed to build HTTP client")?;
    let proxy = Proxy::new(Arc::new(transport), options)?;

    let result = run(&proxy, &cli.command).await;

    info!(observations = %proxy.observations().to_json(), "step timings");
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}
