//! The top-level scheduler.
//!
//! A [`Runner`] listens on the create topic and turns each request into a
//! running [`Handler`]. Every handler's cancellation token is a child of the
//! runner's, so stopping the runner stops its handlers too.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use archway_bus::{Broker, Subscriber};
use archway_dagger::{DirJail, Jail, NoJail};
use bytes::Bytes;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasmtime::{Config, Engine};

use crate::config::RunnerConfig;
use crate::error::{Result, RuntimeError};
use crate::handler::{Handler, HandlerHandle};
use crate::message::{BusMessage, ControlMessage, CreateHandler, Event};
use crate::telemetry::{execution_counter_name, Metrics, Telemetry, TracingTelemetry};

type Registry = Arc<Mutex<BTreeMap<String, HandlerHandle>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, BTreeMap<String, HandlerHandle>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates, tracks and stops handlers.
///
/// # Example
///
/// ```ignore
/// let broker = Broker::new();
/// let runner = Arc::new(Runner::new(broker.clone(), RunnerConfig::default())?);
/// let cancel = CancellationToken::new();
/// let task = Arc::clone(&runner).start(cancel.clone());
///
/// runner.create("h1", "orders", std::fs::read("handler.wasm")?);
/// runner.publish_event("orders", Event::new("e1", "payload"));
///
/// cancel.cancel();
/// task.await?;
/// ```
pub struct Runner {
    broker: Broker<BusMessage>,
    engine: Engine,
    config: RunnerConfig,
    jail: Arc<dyn Jail>,
    telemetry: Arc<dyn Telemetry>,
    metrics: Arc<Metrics>,
    handlers: Registry,
}

impl Runner {
    /// Build a runner. Fuel metering is switched on in the engine when the
    /// config asks for it.
    pub fn new(broker: Broker<BusMessage>, config: RunnerConfig) -> Result<Self> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(config.fuel_per_invocation.is_some());
        let engine = Engine::new(&engine_config).map_err(|e| RuntimeError::link("engine", e))?;

        let jail: Arc<dyn Jail> = match &config.jail_root {
            Some(root) => Arc::new(DirJail::new(root)),
            None => Arc::new(NoJail),
        };

        Ok(Self {
            broker,
            engine,
            config,
            jail,
            telemetry: Arc::new(TracingTelemetry),
            metrics: Arc::new(Metrics::new()),
            handlers: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Override the jail built from `jail_root`.
    pub fn with_jail(mut self, jail: Arc<dyn Jail>) -> Self {
        self.jail = jail;
        self
    }

    pub fn broker(&self) -> &Broker<BusMessage> {
        &self.broker
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// A live handler by id.
    pub fn handler(&self, id: &str) -> Option<HandlerHandle> {
        lock(&self.handlers).get(id).cloned()
    }

    /// Every live handler, ordered by id.
    pub fn handlers(&self) -> Vec<HandlerHandle> {
        lock(&self.handlers).values().cloned().collect()
    }

    /// Publish a create request on the create topic.
    pub fn create(
        &self,
        id: impl Into<String>,
        topic: impl Into<String>,
        module: impl Into<Bytes>,
    ) -> usize {
        let request = CreateHandler {
            id: id.into(),
            topic: topic.into(),
            module: module.into(),
        };
        self.broker.publish(
            &self.config.create_topic,
            ControlMessage::Create(request).into(),
        )
    }

    /// Publish a destroy request on the destroy topic.
    pub fn destroy(&self, id: impl Into<String>) -> usize {
        self.broker.publish(
            &self.config.destroy_topic,
            ControlMessage::Destroy { id: id.into() }.into(),
        )
    }

    /// Publish an event on a data topic.
    pub fn publish_event(&self, topic: &str, event: Event) -> usize {
        self.broker.publish(topic, event.into())
    }

    /// Subscribe to the create topic and run the management loop until
    /// `cancel` fires or the bus goes away.
    ///
    /// The subscription exists when this returns, so create requests
    /// published afterwards are never missed.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let control = self.broker.attach();
        self.broker
            .subscribe(&control, [self.config.create_topic.as_str()]);
        tokio::spawn(self.manage(control, cancel))
    }

    async fn manage(self: Arc<Self>, mut control: Subscriber<BusMessage>, cancel: CancellationToken) {
        info!(topic = %self.config.create_topic, "runner started");
        let scope = cancel.child_token();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                Some(finished) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = finished {
                        warn!(error = %e, "handler task failed");
                    }
                }
                message = control.next_message() => {
                    let Some(message) = message else { break };
                    match message.payload {
                        BusMessage::Control(ControlMessage::Create(request)) => {
                            let (id, topic) = (request.id.clone(), request.topic.clone());
                            if let Err(e) = self.spawn_handler(request, &scope, &mut tasks).await {
                                self.telemetry.handler_create_failed(&id, &topic, &e);
                            }
                        }
                        other => debug!(message = ?other, "ignoring message on create topic"),
                    }
                }
            }
        }

        drop(control);
        scope.cancel();
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                warn!(error = %e, "handler task failed");
            }
        }
        info!("runner stopped");
    }

    async fn spawn_handler(
        &self,
        request: CreateHandler,
        scope: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> Result<()> {
        if lock(&self.handlers).contains_key(&request.id) {
            return Err(RuntimeError::DuplicateHandler(request.id));
        }

        let id = request.id.clone();
        let metric = self
            .metrics
            .counter(&execution_counter_name(&request.topic, &request.id));
        let cancel = scope.child_token();
        let (engine, config, jail, telemetry) = (
            self.engine.clone(),
            self.config.clone(),
            Arc::clone(&self.jail),
            Arc::clone(&self.telemetry),
        );
        let handler = tokio::task::spawn_blocking(move || {
            Handler::new(&request, &engine, &config, jail, telemetry, metric, cancel)
        })
        .await
        .map_err(|_| RuntimeError::GuestLost(id.clone()))??;

        let subscriber = handler.subscribe(&self.broker, &self.config.destroy_topic);
        lock(&self.handlers).insert(id.clone(), handler.handle().clone());

        let registry = Arc::clone(&self.handlers);
        tasks.spawn(async move {
            handler.run(subscriber).await;
            lock(&registry).remove(&id);
        });
        Ok(())
    }
}
