//! EK Mesh Node - CLI for one overlay networking node
//!
//! Relays OCPP-style requests between charging stations and the CSMS.
//!
//! # Usage
//!
//! ```bash
//! # CSMS root accepting downstream nodes
//! mesh-node --name CSMS --listen 0.0.0.0:9000
//!
//! # Relay under the CSMS, accepting its own children
//! mesh-node --name B --listen 0.0.0.0:9001 --uplink-url ws://localhost:9000
//!
//! # Leaf station with a signing key and a trusted CSMS key
//! mesh-node --name A --uplink-url ws://localhost:9001 --uplink-id B \
//!     --signing-seed <64 hex chars> --trust CSMS=<64 hex chars>
//! ```
//!
//! # Demo Scenario
//!
//! 1. Start CSMS, then B under it, then A under B
//! 2. A and B advertise their reachable nodes upward
//! 3. CSMS can now address A by id and relay through B

mod link;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use link::{LinkContext, WsLinks};
use mesh_core::{
    Ed25519Signer, FrameRejected, KeyRing, NodeBuilder, NodeConfig, ObserverError, RequestEvent, ResponseEvent,
    SignaturePolicy,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Frames queued between the links and the node
const INBOX_CAPACITY: usize = 256;

/// EK overlay mesh networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node identifier
    #[arg(short, long)]
    name: String,

    /// Address accepting downstream nodes (e.g. 0.0.0.0:9000)
    #[arg(long)]
    listen: Option<String>,

    /// WebSocket URL of the uplink; the node id is appended as last path segment
    #[arg(long)]
    uplink_url: Option<String>,

    /// Node id of the uplink
    #[arg(long, default_value = "CSMS")]
    uplink_id: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Signature policy JSON file
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Verify request signatures at relays, not only at the destination
    #[arg(long)]
    verify_at_relays: bool,

    /// Ed25519 signing seed as 64 hex characters
    #[arg(long)]
    signing_seed: Option<String>,

    /// Key id attached to signatures (defaults to the node name)
    #[arg(long)]
    key_id: Option<String>,

    /// Trusted verifying key as keyId=hex (can be repeated)
    #[arg(long)]
    trust: Vec<String>,

    /// Initial uplink reconnect delay in milliseconds
    #[arg(long, default_value = "1000")]
    reconnect_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let uplink = args.uplink_url.as_ref().map(|_| args.uplink_id.clone());

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║              EK Mesh Node - Overlay Networking               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  Listen:   {:<50} ║", args.listen.as_deref().unwrap_or("-"));
    println!("║  Uplink:   {:<50} ║", uplink.as_deref().unwrap_or("- (root)"));
    println!(
        "║  URL:      {:<50} ║",
        truncate(args.uplink_url.as_deref().unwrap_or("-"), 50)
    );
    println!("║  Timeout:  {:<50} ║", format!("{}s", args.request_timeout));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let policy = match &args.policy {
        Some(path) => load_policy(path)?,
        None => SignaturePolicy::new(),
    };

    let mut config = NodeConfig::new(&args.name)
        .with_request_timeout(Duration::from_secs(args.request_timeout))
        .with_signature_policy(policy);
    if args.verify_at_relays {
        config = config.with_verify_at_relays(true);
    }
    if let Some(uplink) = &uplink {
        config = config.with_uplink(uplink.clone());
    }

    let mut keys = KeyRing::new();
    for entry in &args.trust {
        let Some((key_id, hex_key)) = entry.split_once('=') else {
            return Err(format!("invalid --trust entry '{}', expected keyId=hex", entry).into());
        };
        keys.insert_hex(key_id, hex_key)?;
        info!("Trusting key {}", key_id);
    }

    let mut builder = NodeBuilder::new(config).with_verifier(Arc::new(keys));

    if let Some(seed_hex) = &args.signing_seed {
        let seed: [u8; 32] = hex::decode(seed_hex)?
            .try_into()
            .map_err(|_| "signing seed must be 32 bytes")?;
        let key_id = args.key_id.clone().unwrap_or_else(|| args.name.clone());
        let signer = Ed25519Signer::from_seed(key_id.clone(), seed);
        info!(
            "Signing as {} (public key {})",
            key_id,
            hex::encode(signer.verifying_key().as_bytes())
        );
        builder = builder.with_signer(Arc::new(signer));
    }

    let links = Arc::new(WsLinks::new());
    let node = builder.build(links.clone());

    node.inbound().request_received().subscribe(|event: RequestEvent| async move {
        info!(
            "Request {} {} for {} via {:?}",
            event.action, event.request_id, event.destination, event.network_path
        );
        Ok::<(), ObserverError>(())
    });
    node.inbound().response_sent().subscribe(|event: ResponseEvent| async move {
        info!(
            "Answered {} {} with {} after {:?}",
            event.action, event.request_id, event.result, event.runtime
        );
        Ok::<(), ObserverError>(())
    });

    node.inbound().frame_rejected().subscribe(|event: FrameRejected| async move {
        warn!("Dropped {} byte frame from {}: {}", event.frame_len, event.from, event.reason);
        Ok::<(), ObserverError>(())
    });

    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let server = node.serve(inbox_rx);

    let ctx = LinkContext {
        node: node.clone(),
        links: links.clone(),
        inbox: inbox_tx,
    };

    if let Some(addr) = args.listen.clone() {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = link::listen(&addr, ctx).await {
                error!("Listener on {} stopped: {}", addr, e);
            }
        });
    }

    if let (Some(url), Some(uplink_id)) = (args.uplink_url.clone(), uplink) {
        let delay = Duration::from_millis(args.reconnect_delay_ms.max(1));
        tokio::spawn(link::maintain_uplink(
            url,
            uplink_id,
            ctx.clone(),
            delay,
            Duration::from_secs(60),
        ));
    }

    info!("Node {} running, Ctrl-C to stop", node.node_id());
    tokio::signal::ctrl_c().await?;

    info!("Shutting down; links open: {:?}", links.connected());
    server.abort();

    Ok(())
}

/// Read a signature policy from a JSON file
fn load_policy(path: &Path) -> Result<SignaturePolicy, Box<dyn std::error::Error>> {
    let json = std::fs::read_to_string(path)?;
    let policy = SignaturePolicy::from_json(&json)?;
    info!("Loaded {} signature rules from {}", policy.rules.len(), path.display());
    Ok(policy)
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
