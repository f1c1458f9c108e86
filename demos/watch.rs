//! # Example: Watch a fleet
//!
//! Loads a fleet file, connects to the event server and logs every bus message
//! until Ctrl-C. Entities are printed with their confirmed version on exit.
//!
//! ```text
//! RUST_LOG=fleetwatch=debug cargo run --example watch -- fleet.yaml ws://localhost:8000/ws
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fleetwatch::{FleetFile, FleetWatchBuilder, Message, Subscribe, Topic, TraceWriter};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Track deployments across a fleet")]
struct Args {
    /// YAML fleet file (settings + entities).
    fleet: PathBuf,
    /// Event server, ws:// or wss://.
    uri: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let file = FleetFile::load(&args.fleet)?;

    let trace: Arc<dyn Subscribe> = Arc::new(TraceWriter::new());
    let fw = FleetWatchBuilder::from_fleet_file(&file)?
        .with_subscribers(vec![trace])
        .build()?;

    fw.bus().subscribe_fn(Topic::Converged, |m: &Message| {
        if let Message::Converged(c) = m {
            println!("[converged] {} -> {} in {:.1}s", c.entity_id, c.version, c.duration);
        }
    });
    fw.bus().subscribe_fn(Topic::FleetConverged, |m: &Message| {
        if let Message::FleetConverged(f) = m {
            println!("[fleet] every entity is on {}", f.version);
        }
    });
    fw.bus().subscribe_fn(Topic::ReconcileFailed, |m: &Message| {
        if let Message::ReconcileFailed(f) = m {
            println!(
                "[failed] {} never reached {} (last seen {:?})",
                f.entity_id, f.target_version, f.last_observed
            );
        }
    });

    fw.connect(&args.uri)?;
    println!("watching {} entities via {}", fw.registry().len(), args.uri);

    let res = fw.run_until_signal().await;

    for entity in fw.registry().list() {
        let state = if entity.is_degraded() { "degraded" } else { "ok" };
        println!(
            "{:<16} {:<12} {}",
            entity.id,
            entity.version.as_deref().unwrap_or("-"),
            state
        );
    }
    println!("{:?}", fw.reconciler().stats());
    res?;
    Ok(())
}
