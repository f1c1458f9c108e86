//! # FleetWatch: one explicit runtime context.
//!
//! Owns the bus, the registry, the reconciler and (once connected) the
//! transport. Nothing is global: two contexts in one process share nothing.
//!
//! ## Wiring
//! ```text
//! FleetWatch::builder(cfg)
//!     .with_entities(..)        ──► EntityRegistry::from_entities()
//!     .with_probe(..)           ──► Arc<dyn StatusProbe>   (default: HttpProbe)
//!     .with_subscribers(..)     ──► bus.subscribe_all()
//!     .with_handler(topic, ..)  ──► bus.subscribe(topic)
//!     .build()                  ──► Reconciler::new() subscribes "entity-updated"
//!
//! connect(uri) ──► Connection::spawn(uri, bus, cfg, token.child_token())
//!
//! ws frame ──► Bus ──► "entity-updated" ──► Reconciler ──► ReconcileTask
//!                                                            │
//!              Bus ◄── converged / entity-degraded / reconcile-failed
//! ```
//!
//! ## Shutdown
//! 1. transport loop cancelled (no new frames)
//! 2. reconciler stops admission, cancels tasks, waits up to `Config::grace`
//!
//! [`FleetWatch::run_until_signal`] does the same on SIGINT/SIGTERM/SIGQUIT
//! (Ctrl-C elsewhere).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{Config, FleetFile};
use crate::error::{RuntimeError, TransportError};
use crate::events::{Bus, Subscribe, Topic};
use crate::reconcile::{HttpProbe, Reconciler, StatusProbe};
use crate::registry::{Entity, EntityRegistry};
use crate::transport::{Connection, TransportHandle};

/// Builder for [`FleetWatch`].
pub struct FleetWatchBuilder {
    cfg: Config,
    entities: Vec<Entity>,
    probe: Option<Arc<dyn StatusProbe>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    handlers: Vec<(Topic, Arc<dyn Subscribe>)>,
}

impl FleetWatchBuilder {
    /// Starts from a configuration with no entities.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            entities: Vec::new(),
            probe: None,
            subscribers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Starts from a parsed fleet file (settings and entities).
    pub fn from_fleet_file(file: &FleetFile) -> Result<Self, RuntimeError> {
        Ok(Self::new(file.config()?).with_entities(file.entities()))
    }

    /// Entities seeded into the registry.
    pub fn with_entities(mut self, entities: Vec<Entity>) -> Self {
        self.entities = entities;
        self
    }

    /// Replaces the default HTTP status probe.
    pub fn with_probe(mut self, probe: Arc<dyn StatusProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Handlers receiving every topic.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Adds a handler for a single topic.
    pub fn with_handler(mut self, topic: impl Into<Topic>, handler: Arc<dyn Subscribe>) -> Self {
        self.handlers.push((topic.into(), handler));
        self
    }

    /// Builds the context. Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<FleetWatch, RuntimeError> {
        let registry = EntityRegistry::from_entities(self.entities, self.cfg.history_len)?;
        let probe: Arc<dyn StatusProbe> = match self.probe {
            Some(p) => p,
            None => Arc::new(HttpProbe::new(self.cfg.poll_timeout())?),
        };

        let bus = Bus::new();
        for sub in self.subscribers {
            bus.subscribe_all(sub);
        }
        for (topic, handler) in self.handlers {
            bus.subscribe(topic, handler);
        }

        let reconciler = Reconciler::new(bus.clone(), registry.clone(), probe, &self.cfg)?;
        tracing::info!(entities = registry.len(), "fleetwatch context ready");

        Ok(FleetWatch {
            cfg: self.cfg,
            bus,
            registry,
            reconciler,
            transport: Mutex::new(None),
            token: CancellationToken::new(),
        })
    }
}

/// Runtime context: bus, registry, reconciler and transport.
pub struct FleetWatch {
    cfg: Config,
    bus: Bus,
    registry: EntityRegistry,
    reconciler: Reconciler,
    transport: Mutex<Option<Arc<TransportHandle>>>,
    token: CancellationToken,
}

impl FleetWatch {
    /// Returns a builder.
    pub fn builder(cfg: Config) -> FleetWatchBuilder {
        FleetWatchBuilder::new(cfg)
    }

    /// Effective configuration.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Message bus shared by every component of this context.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Registry of tracked entities.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Reconciliation engine.
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Live transport, if [`connect`](Self::connect) was called.
    pub fn transport(&self) -> Option<Arc<TransportHandle>> {
        self.transport.lock().clone()
    }

    /// Opens the real-time connection to `uri`.
    ///
    /// Only one transport per context; a second call fails with
    /// [`RuntimeError::AlreadyConnected`].
    pub fn connect(&self, uri: &str) -> Result<Arc<TransportHandle>, RuntimeError> {
        if self.token.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        let mut slot = self.transport.lock();
        if let Some(live) = slot.as_ref() {
            return Err(RuntimeError::AlreadyConnected {
                uri: live.uri().to_string(),
            });
        }
        let handle = Arc::new(Connection::spawn(
            uri,
            self.bus.clone(),
            &self.cfg,
            self.token.child_token(),
        )?);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Stops the transport, then the reconciler (bounded by `Config::grace`).
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.token.cancel();
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            transport.shutdown().await;
        }
        let res = self.reconciler.shutdown(self.cfg.grace).await;
        tracing::info!(ok = res.is_ok(), "fleetwatch stopped");
        res
    }

    /// Waits for a termination signal, then calls [`shutdown`](Self::shutdown).
    pub async fn run_until_signal(&self) -> Result<(), RuntimeError> {
        if let Err(err) = wait_for_shutdown_signal().await {
            tracing::error!(error = %err, "signal listener failed; shutting down");
        } else {
            tracing::info!("shutdown signal received");
        }
        self.shutdown().await
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, ProbeError};
    use crate::events::{EntityUpdated, HandlerFn, Message};
    use crate::reconcile::Observed;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FixedProbe(&'static str);

    #[async_trait]
    impl StatusProbe for FixedProbe {
        async fn probe(&self, _entity: &Entity) -> Result<Observed, ProbeError> {
            Ok(Observed::version(self.0))
        }
    }

    fn entity(id: &str) -> Entity {
        Entity::new(id, id, format!("http://{id}.invalid/status"))
    }

    #[tokio::test]
    async fn test_published_update_converges_registry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fw = FleetWatch::builder(Config::default())
            .with_entities(vec![entity("api")])
            .with_probe(Arc::new(FixedProbe("v2")))
            .with_handler(
                Topic::Converged,
                HandlerFn::arc("collect", move |m: &Message| {
                    let _ = tx.send(m.clone());
                }),
            )
            .build()
            .unwrap();

        fw.bus()
            .publish(Message::EntityUpdated(EntityUpdated::new("api", "v2")));

        let Some(Message::Converged(c)) = rx.recv().await else {
            panic!("expected a converged message");
        };
        assert_eq!(c.entity_id, "api");
        assert_eq!(c.version, "v2");
        assert_eq!(fw.registry().get("api").unwrap().version.as_deref(), Some("v2"));
        assert_eq!(fw.reconciler().stats().converged, 1);

        fw.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribers_see_every_topic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let all: Arc<dyn Subscribe> = HandlerFn::arc("all", move |m: &Message| {
            let _ = tx.send(m.topic());
        });
        let fw = FleetWatch::builder(Config::default())
            .with_probe(Arc::new(FixedProbe("v1")))
            .with_subscribers(vec![all])
            .build()
            .unwrap();

        fw.bus().publish(
            Message::from_parts("timeline", serde_json::json!({"note": "hi"})).unwrap(),
        );
        assert_eq!(rx.recv().await, Some(Topic::from("timeline")));
        fw.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_single_transport_per_context() {
        let fw = FleetWatch::builder(Config::default())
            .with_probe(Arc::new(FixedProbe("v1")))
            .build()
            .unwrap();

        let handle = fw.connect("ws://127.0.0.1:9/events").unwrap();
        assert_eq!(handle.uri(), "ws://127.0.0.1:9/events");
        assert!(fw.transport().is_some());

        let err = fw.connect("ws://127.0.0.1:9/other").unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyConnected { ref uri } if uri == "ws://127.0.0.1:9/events"));

        fw.shutdown().await.unwrap();
        assert!(fw.transport().is_none());
        assert!(handle.is_shutting_down());

        let err = fw.connect("ws://127.0.0.1:9/events").unwrap_err();
        assert!(matches!(err, RuntimeError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_uri_is_reported() {
        let fw = FleetWatch::builder(Config::default())
            .with_probe(Arc::new(FixedProbe("v1")))
            .build()
            .unwrap();
        let err = fw.connect("http://example.invalid").unwrap_err();
        assert_eq!(err.as_label(), "transport_invalid_uri");
        assert!(fw.transport().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_entities_rejected() {
        let res = FleetWatch::builder(Config::default())
            .with_entities(vec![entity("api"), entity("api")])
            .with_probe(Arc::new(FixedProbe("v1")))
            .build();
        assert!(matches!(
            res,
            Err(RuntimeError::Config(ConfigError::DuplicateEntity(ref id))) if id == "api"
        ));
    }

    #[tokio::test]
    async fn test_builder_from_fleet_file() {
        let file = FleetFile::from_yaml_str(
            r#"
settings:
  max_attempts: 3
entities:
  - id: web
    status_url: http://web.internal/status
    version: v1
"#,
        )
        .unwrap();
        let fw = FleetWatchBuilder::from_fleet_file(&file)
            .unwrap()
            .with_probe(Arc::new(FixedProbe("v1")))
            .build()
            .unwrap();
        assert_eq!(fw.config().max_attempts, 3);
        assert_eq!(fw.registry().get("web").unwrap().version.as_deref(), Some("v1"));
        fw.shutdown().await.unwrap();
    }

    #[test]
    fn test_build_requires_runtime() {
        let res = FleetWatch::builder(Config::default())
            .with_probe(Arc::new(FixedProbe("v1")))
            .build();
        assert!(matches!(res, Err(RuntimeError::NoRuntime)));
    }
}
