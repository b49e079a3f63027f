//! Backend and web front services that authenticate each other with workload identity mTLS
//! instead of API keys.
//!
//! One binary, two roles: `server` runs the backend behind an mTLS listener, `client` runs
//! the web front that calls it.

pub mod cli;
pub mod client;
pub mod identity;
pub mod server;
pub mod telemetry;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token cancelled on Ctrl-C.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                trigger.cancel();
            }
            Err(e) => warn!(error = %e, "Unable to listen for Ctrl-C"),
        }
    });
    token
}
