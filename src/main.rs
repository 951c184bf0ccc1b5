//! Campus Sync - command-line probe
//!
//! Fetches one API path through the sync client, using and renewing the
//! persisted session, and prints the JSON result.

use anyhow::Context;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use campus_sync::{Config, QueryKey, QueryOptions, SyncClient};

const DEFAULT_PATH: &str = "/auth/profile/";

/// Entry point for the `campus-sync` binary.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the sync client, restoring any persisted session
/// 4. Start background cache gc task
/// 5. Fetch the requested path and print it
/// 6. Tear down background work
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" for this crate, can be overridden with RUST_LOG
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campus_sync=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env();
    info!(
        "Configuration loaded: base_url={}, token_dir={}, gc_interval={}s",
        config.api_base_url,
        config.token_dir.display(),
        config.gc_interval
    );

    let client = SyncClient::init(config).context("failed to build sync client")?;
    client.spawn_gc();

    let path = std::env::args().nth(1).unwrap_or_else(|| DEFAULT_PATH.to_string());
    let key = QueryKey::new(path.as_str());

    let outcome = client
        .fetch_path::<Value>(&key, path.as_str(), QueryOptions::new())
        .await;
    client.teardown();

    let data = outcome.with_context(|| format!("GET {} failed", path))?;
    println!("{}", serde_json::to_string_pretty(&data)?);
    Ok(())
}
