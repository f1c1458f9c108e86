//! # Example: Simulated rollout
//!
//! Runs without any server. A fake probe makes each entity report the new
//! version only after a few polls; `entity-updated` assertions are published
//! locally on the bus, as the transport would do for real frames.
//!
//! - `api` converges on the 3rd poll
//! - `web` converges on the 2nd poll (its duplicate assertion is ignored)
//! - `worker` never catches up and gives up after `max_attempts`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fleetwatch::{
    BackoffPolicy, Config, Entity, EntityUpdated, FleetWatch, Message, Observed, ProbeError,
    StatusProbe, Topic,
};

/// Reports `target` once an entity has been polled `after` times.
struct RollingProbe {
    target: String,
    after: HashMap<String, u32>,
    polls: Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl StatusProbe for RollingProbe {
    async fn probe(&self, entity: &Entity) -> Result<Observed, ProbeError> {
        let n = {
            let mut polls = self.polls.lock();
            let n = polls.entry(entity.id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let after = self.after.get(&entity.id).copied().unwrap_or(u32::MAX);
        println!("[probe] {} poll #{n}", entity.id);
        if n >= after {
            Ok(Observed::version(self.target.clone()))
        } else {
            Ok(Observed::version("v1"))
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cfg = Config {
        max_attempts: 4,
        backoff: BackoffPolicy::fixed(Duration::from_millis(200)),
        ..Config::default()
    };

    let probe = RollingProbe {
        target: "v2".into(),
        after: HashMap::from([("api".into(), 3), ("web".into(), 2)]),
        polls: Mutex::new(HashMap::new()),
    };

    let entities: Vec<Entity> = ["api", "web", "worker"]
        .into_iter()
        .map(|id| {
            Entity::new(id, id.to_uppercase(), format!("http://{id}.local/status"))
                .with_version("v1")
        })
        .collect();

    let fw = FleetWatch::builder(cfg)
        .with_entities(entities)
        .with_probe(Arc::new(probe))
        .build()?;

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    for topic in [Topic::Converged, Topic::ReconcileFailed] {
        let tx = done_tx.clone();
        fw.bus().subscribe_fn(topic, move |m: &Message| {
            println!("[bus] {m:?}");
            let _ = tx.send(());
        });
    }

    for id in ["api", "web", "worker"] {
        fw.bus()
            .publish(Message::EntityUpdated(EntityUpdated::new(id, "v2")));
    }
    let dup = fw.reconciler().notify(&EntityUpdated::new("web", "v2"));
    println!("[main] second assertion for web: {dup:?}");

    for _ in 0..3 {
        done_rx.recv().await;
    }

    for e in fw.registry().list() {
        println!(
            "[registry] {} version={:?} history={:?}",
            e.id,
            e.version,
            fw.registry().history(&e.id).iter().map(|r| r.version.clone()).collect::<Vec<_>>()
        );
    }
    println!("[stats] {:?}", fw.reconciler().stats());

    fw.shutdown().await?;
    Ok(())
}
