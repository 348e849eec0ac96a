//! shuttled — serve or restore a snapshot over the local network.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;

use shuttle_core::config::ShuttleConfig;
use shuttle_core::KeyMaterial;
use shuttle_transfer::{PairingCredentials, TransferClient, TransferServer, TransferState};

mod snapshot;

use snapshot::{DirectorySink, DirectorySource};

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_serve(config: ShuttleConfig, dir: PathBuf) -> Result<()> {
    let source = DirectorySource::open(&dir)
        .with_context(|| format!("failed to index {}", dir.display()))?;

    let key = KeyMaterial::generate().context("failed to generate transfer key")?;
    let credentials = PairingCredentials::generate(config.identity.user_id.clone());

    let mut server = TransferServer::new(config, key.clone(), credentials.clone());
    let port = server.prepare().await.context("failed to prepare transfer channel")?;

    // Shown to the user; the receiving device needs all three.
    println!("port: {port}");
    println!("code: {:03}", credentials.code);
    println!("key:  {}", key.to_hex().as_str());
    drop(key);

    let state = server.state();
    let watcher = tokio::spawn(watch_state(state.subscribe()));
    let result = server.run(source).await;
    state.close();
    let _ = watcher.await;

    result.context("transfer failed")?;
    println!("Snapshot sent.");
    Ok(())
}

async fn cmd_receive(
    config: ShuttleConfig,
    host: &str,
    port: &str,
    code: &str,
    key_hex: &str,
    out_dir: Option<&str>,
) -> Result<()> {
    let port: u16 = port.parse().context("port must be a number")?;
    let code: u16 = code.parse().context("code must be a number")?;
    if code > 999 {
        bail!("code must be between 000 and 999");
    }
    let key = KeyMaterial::from_hex(key_hex.trim()).context("invalid transfer key")?;

    let addr = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}"))?
        .next()
        .with_context(|| format!("no address for {host}"))?;

    let out_dir = out_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| config.storage.output_dir.clone());
    let sink = DirectorySink::create(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    tracing::info!(addr = %addr, out_dir = %out_dir.display(), "receiving snapshot");

    let credentials = PairingCredentials::new(config.identity.user_id.clone(), code);
    let client = TransferClient::new(config, key, credentials);

    let state = client.state();
    let watcher = tokio::spawn(watch_state(state.subscribe()));
    let result = client.run(addr, sink).await;
    state.close();
    let _ = watcher.await;

    result.context("transfer failed")?;
    println!("Snapshot restored to {}.", out_dir.display());
    Ok(())
}

/// Log every state change until the session closes.
async fn watch_state(mut rx: watch::Receiver<TransferState>) {
    loop {
        let state = rx.borrow_and_update().clone();
        match &state {
            TransferState::Transporting { .. } | TransferState::Importing { .. } => {
                tracing::debug!(state = %state, "transfer progress")
            }
            TransferState::Failed(reason) => tracing::warn!(reason = ?reason, "transfer failed"),
            other => tracing::info!(state = %other, "transfer state"),
        }
        if state == TransferState::Closed || rx.changed().await.is_err() {
            break;
        }
    }
}

fn print_usage() {
    println!("Usage: shuttled <command>");
    println!();
    println!("Commands:");
    println!("  serve <dir>                                       Serve a directory snapshot");
    println!("  receive <host> <port> <code> <key-hex> [out-dir]  Restore a snapshot");
    println!();
    println!("Environment:");
    println!("  SHUTTLE_CONFIG   Config file path");
    println!("  RUST_LOG         Log filter (e.g. shuttle_transfer=debug)");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = ShuttleConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ShuttleConfig::load().context("failed to load config")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["serve", dir] => cmd_serve(config, PathBuf::from(dir)).await,
        ["receive", host, port, code, key] => {
            cmd_receive(config, host, port, code, key, None).await
        }
        ["receive", host, port, code, key, out] => {
            cmd_receive(config, host, port, code, key, Some(*out)).await
        }
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
