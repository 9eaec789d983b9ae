//! Main entrypoint for the calllink terminal client.
//!
//! Loads configuration from the environment, initializes logging, wires the
//! HTTP call API and the WebSocket transport into a session manager, then
//! runs the requested command.

use anyhow::Context;
use calllink_client::{
    config::Config,
    console::{self, Cli, Command},
};
use calllink_core::{CallSessionManager, HttpCallApi};
use calllink_ws::WsTransport;
use clap::Parser;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(api_url = %config.api_url, signaling_url = %config.signaling_url, "Configuration loaded.");

    // --- 3. Wire the session manager ---
    let api = Arc::new(HttpCallApi::new(config.api_url.clone(), config.token()));
    let transport = Arc::new(WsTransport::new(config.token()));
    let manager = CallSessionManager::new(api, transport, config.session_config());

    // --- 4. Run the command ---
    match cli.command {
        Command::Call {
            kind,
            callee,
            language,
        } => {
            let stdin = BufReader::new(tokio::io::stdin());
            let status = console::run_call(&manager, kind.into(), callee, &language, stdin)
                .await
                .context("Call failed")?;
            println!("Call finished: {status}");
        }
        Command::History { kind } => {
            let calls = manager
                .call_history(kind.map(Into::into))
                .await
                .context("Failed to load call history")?;
            if calls.is_empty() {
                println!("No calls yet.");
            }
            for call in &calls {
                println!("{}", console::format_record(call));
            }
        }
        Command::Counselors { language } => {
            let counselors = manager
                .available_counselors(&language)
                .await
                .context("Failed to load counselors")?;
            if counselors.is_empty() {
                println!("No counselors available for '{language}'.");
            }
            for counselor in &counselors {
                println!("{}", console::format_counselor(counselor));
            }
        }
    }
    Ok(())
}
