//!
//! supportline server binary
//! -------------------------
//! Command-line entry point for the support-chat HTTP service. Configuration comes from
//! `SUPPORTLINE_*` environment variables, overridden by CLI flags.

use anyhow::{Context, Result};
use std::env;

use supportline::config::{has_flag, DirectoryBackend, IdentityBackend, ServiceConfig};

const USAGE: &str = "supportline Server

USAGE:
  supportline_server [--http-port N] [--identity-url URL] [--generation-url URL] [--local-identity]

OPTIONS:
  --http-port N           HTTP port (env: SUPPORTLINE_HTTP_PORT, default 3000)
  --identity-url URL      GoTrue-compatible identity service (env: SUPPORTLINE_IDENTITY_URL,
                          key: SUPPORTLINE_IDENTITY_KEY). Unset uses the in-process gateway.
  --generation-url URL    Answer generation service (env: SUPPORTLINE_GENERATION_URL,
                          default http://127.0.0.1:8000)
  --local-identity        Force the in-process identity gateway.

ENVIRONMENT:
  SUPPORTLINE_PUBLIC_URL          External origin for OAuth callbacks; https enables Secure cookies.
  SUPPORTLINE_DIRECTORY_URL/_KEY  PostgREST resource directory. Unset keeps resources in memory.
  SUPPORTLINE_HTTP_TIMEOUT_SECS   Outbound request timeout (default 30).
";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber with env filter if provided
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();

    if has_flag(&args, "--help") || has_flag(&args, "-h") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = ServiceConfig::from_env()
        .and_then(|c| c.apply_args(&args))
        .context("Invalid configuration")?;

    let identity = match &config.identity {
        IdentityBackend::Local => "local".to_string(),
        IdentityBackend::Remote { url, .. } => url.clone(),
    };
    let directory = match &config.directory {
        DirectoryBackend::Memory => "memory".to_string(),
        DirectoryBackend::Rest { url, .. } => url.clone(),
    };
    println!(
        "supportline starting: http={}, identity={}, directory={}, generation={}",
        config.http_port, identity, directory, config.generation_url
    );
    tracing::info!(
        target: "startup",
        "Using port: http={}, identity={}, directory={}, public_url={}",
        config.http_port, identity, directory, config.public_url
    );
    if matches!(config.identity, IdentityBackend::Local) {
        tracing::warn!(target: "startup", "in-process identity gateway: accounts and sessions are lost on restart");
    }

    supportline::server::run(config).await
}
