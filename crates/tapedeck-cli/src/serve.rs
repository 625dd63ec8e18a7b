//! Standalone proxy
//!
//! Starts a proxy session, optionally binds it to a snapshot right away, and
//! prints the base URL on stdout so a parent process can pick it up. Runs
//! until Ctrl-C, then flushes as a passing test would.

use serde_json::json;
use tapedeck_core::{ProxyOptions, ProxySession, Result, Settings};
use tracing::info;

use crate::ServeArgs;

pub async fn run(args: ServeArgs, json_output: bool) -> Result<()> {
    let options = options_for(&args)?;
    let session = ProxySession::start_on(options, args.port).await?;

    if let (Some(snapshot), Some(work_dir)) = (&args.snapshot, &args.work_dir) {
        let mode = session.configure(snapshot, work_dir).await?;
        info!("Configured {} in {} mode", snapshot.display(), mode);
    }

    if json_output {
        println!("{}", json!({ "listening": session.base_url() }));
    } else {
        println!("Listening: {}", session.base_url());
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");

    let outcome = session.stop(false).await?;
    if outcome.persisted {
        if let Some(path) = &outcome.snapshot_path {
            info!(
                "Wrote {} exchange(s) to {}",
                outcome.exchange_count,
                path.display()
            );
        }
    }
    Ok(())
}

/// Environment settings, overridden by whatever was given on the command line
fn options_for(args: &ServeArgs) -> Result<ProxyOptions> {
    let mut settings = Settings::from_env()?;
    if let Some(upstream) = &args.upstream {
        settings.upstream_url = upstream.clone();
    }
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    if let Some(order) = args.order {
        settings.order = order;
    }
    if let Some(rules) = &args.rules {
        settings.rules_file = Some(rules.clone());
    }
    ProxyOptions::from_settings(&settings)
}
