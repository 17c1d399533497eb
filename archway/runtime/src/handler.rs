//! A handler binds one guest instance to one data topic.
//!
//! Lifecycle: `Created → Subscribed → Running → Terminated`. A handler
//! leaves `Running` only when a destroy request names it, when its
//! cancellation token fires, or when the bus goes away. Guest failures are
//! reported and the loop carries on.

use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use archway_bus::{Broker, Subscriber};
use archway_dagger::{Jail, Process};
use collection_literals::btree;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use wasmtime::Engine;

use crate::config::RunnerConfig;
use crate::error::{Result, RuntimeError};
use crate::guest::Guest;
use crate::message::{BusMessage, ControlMessage, CreateHandler, Event};
use crate::telemetry::{Invocation, Telemetry};

/// Where a handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Guest linked and entry point found.
    Created,
    /// Listening on its data topic and the destroy topic.
    Subscribed,
    /// Processing messages.
    Running,
    /// Stopped; the guest and its process are gone.
    Terminated,
}

/// Shared view of a handler, used to observe and stop it from outside.
#[derive(Debug, Clone)]
pub struct HandlerHandle {
    id: String,
    topic: String,
    state: Arc<watch::Sender<HandlerState>>,
    executions: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl HandlerHandle {
    fn new(id: String, topic: String, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(HandlerState::Created);
        Self {
            id,
            topic,
            state: Arc::new(state),
            executions: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> HandlerState {
        *self.state.borrow()
    }

    fn set_state(&self, state: HandlerState) {
        debug!(handler_id = %self.id, ?state, "handler state");
        self.state.send_replace(state);
    }

    /// Wait until the handler reaches `state`.
    pub async fn wait_for(&self, state: HandlerState) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once matched.
        let _ = rx.wait_for(|current| *current == state).await;
    }

    /// How many times this handler has invoked its guest entry point.
    ///
    /// Starts at zero for every handler, even one recreated under an id
    /// used before.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Ask the handler to stop after its current invocation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// One guest instance driven by bus messages.
pub struct Handler {
    id: String,
    topic: String,
    /// Moved onto the blocking pool for each invocation.
    guest: Option<Guest>,
    handle: HandlerHandle,
    telemetry: Arc<dyn Telemetry>,
    /// Shared `<topic>-<id>` metric; outlives the handler.
    metric: Arc<AtomicU64>,
}

impl Handler {
    /// Build the process and guest for a create request.
    ///
    /// This compiles the module, so it belongs on a blocking thread.
    /// `metric` is bumped alongside the handler's own execution count.
    pub fn new(
        request: &CreateHandler,
        engine: &Engine,
        config: &RunnerConfig,
        jail: Arc<dyn Jail>,
        telemetry: Arc<dyn Telemetry>,
        metric: Arc<AtomicU64>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let mut process = Process::new(format!("{}+{}", request.topic, request.id))
            .with_jail(jail)
            .with_config(config.process_config());
        process.set_env(btree! {
            "RUN_ID".to_string() => request.id.clone(),
        });

        let guest = Guest::instantiate(engine, &request.module, process, config)?;
        let handle = HandlerHandle::new(request.id.clone(), request.topic.clone(), cancel);
        telemetry.handler_created(&request.id, &request.topic);

        Ok(Self {
            id: request.id.clone(),
            topic: request.topic.clone(),
            guest: Some(guest),
            handle,
            telemetry,
            metric,
        })
    }

    pub fn handle(&self) -> &HandlerHandle {
        &self.handle
    }

    /// Attach to `broker` and listen on the data topic plus `destroy_topic`.
    pub fn subscribe(&self, broker: &Broker<BusMessage>, destroy_topic: &str) -> Subscriber<BusMessage> {
        let subscriber = broker.attach();
        broker.subscribe(&subscriber, [self.topic.as_str(), destroy_topic]);
        self.handle.set_state(HandlerState::Subscribed);
        subscriber
    }

    /// Process messages until destroyed or cancelled, then tear down.
    pub async fn run(mut self, mut subscriber: Subscriber<BusMessage>) {
        self.handle.set_state(HandlerState::Running);
        let cancel = self.handle.cancel.clone();

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = subscriber.next_message() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message.payload {
                BusMessage::Event(event) => {
                    if let Err(e) = self.execute(event).await {
                        warn!(handler_id = %self.id, error = %e, "stopping handler");
                        break;
                    }
                }
                BusMessage::Control(ControlMessage::Destroy { id }) => {
                    if id == self.id {
                        debug!(handler_id = %self.id, "destroy requested");
                        cancel.cancel();
                        break;
                    }
                }
                BusMessage::Control(ControlMessage::Create(request)) => {
                    debug!(handler_id = %self.id, other = %request.id, "ignoring create request");
                }
            }
        }

        drop(subscriber);
        self.teardown().await;
    }

    /// Invoke the guest once for `event`.
    ///
    /// Only a lost guest is an error here; traps and fuel exhaustion are
    /// reported through telemetry.
    async fn execute(&mut self, event: Event) -> Result<()> {
        let mut guest = self
            .guest
            .take()
            .ok_or_else(|| RuntimeError::GuestLost(self.id.clone()))?;

        let run_id = Uuid::new_v4();
        let process = guest.process_mut();
        process.set_env(btree! {
            "HANDLER_ID".to_string() => self.id.clone(),
            "RUN_ID".to_string() => run_id.to_string(),
            "EVENT_ID".to_string() => event.id.clone(),
            "TOPIC".to_string() => self.topic.clone(),
        });
        process.set_stdin(Cursor::new(event.payload.clone()));

        let started = Instant::now();
        let joined = tokio::task::spawn_blocking(move || {
            let outcome = guest.invoke();
            (guest, outcome)
        })
        .await;
        let duration = started.elapsed();
        self.handle.executions.fetch_add(1, Ordering::Relaxed);
        self.metric.fetch_add(1, Ordering::Relaxed);

        let outcome = match joined {
            Ok((guest, outcome)) => {
                self.guest = Some(guest);
                outcome.map_err(|e| e.to_string())
            }
            Err(e) => Err(format!("guest task failed: {}", e)),
        };
        self.telemetry.invocation(&Invocation {
            handler_id: self.id.clone(),
            run_id,
            event_id: event.id,
            topic: self.topic.clone(),
            duration,
            outcome,
        });

        if self.guest.is_none() {
            return Err(RuntimeError::GuestLost(self.id.clone()));
        }
        Ok(())
    }

    /// Close the guest's descriptors and drop it off the async runtime.
    async fn teardown(&mut self) {
        if let Some(mut guest) = self.guest.take() {
            let closed = tokio::task::spawn_blocking(move || {
                guest.process_mut().close_all();
            })
            .await;
            if let Err(e) = closed {
                warn!(handler_id = %self.id, error = %e, "guest teardown failed");
            }
        }
        self.handle.set_state(HandlerState::Terminated);
        self.telemetry
            .handler_terminated(&self.id, &self.topic, self.handle.executions());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::TracingTelemetry;
    use archway_dagger::NoJail;

    const COUNTER: &str = r#"
(module
  (global $n (mut i64) (i64.const 0))
  (func (export "cwa_main") (result i64)
    (global.set $n (i64.add (global.get $n) (i64.const 1)))
    (global.get $n)))
"#;

    fn handler(id: &str, topic: &str, module: &str) -> Result<Handler> {
        handler_with_metric(id, topic, module, Arc::new(AtomicU64::new(0)))
    }

    fn handler_with_metric(
        id: &str,
        topic: &str,
        module: &str,
        metric: Arc<AtomicU64>,
    ) -> Result<Handler> {
        let request = CreateHandler {
            id: id.to_string(),
            topic: topic.to_string(),
            module: module.as_bytes().to_vec().into(),
        };
        Handler::new(
            &request,
            &Engine::default(),
            &RunnerConfig::default(),
            Arc::new(NoJail),
            Arc::new(TracingTelemetry),
            metric,
            CancellationToken::new(),
        )
    }

    #[test]
    fn new_handler_is_created_with_process_name() {
        let handler = handler("h1", "orders", COUNTER).unwrap();
        assert_eq!(handler.handle().state(), HandlerState::Created);
        assert_eq!(handler.handle().id(), "h1");
        assert_eq!(handler.handle().topic(), "orders");

        let process = handler.guest.as_ref().unwrap().process();
        assert_eq!(process.name(), "orders+h1");
        assert_eq!(process.getenv("RUN_ID"), Some("h1"));
    }

    #[test]
    fn missing_entry_point_never_subscribes() {
        let result = handler("h1", "orders", r#"(module)"#);
        assert!(matches!(result, Err(RuntimeError::MissingEntryPoint(_))));
    }

    #[tokio::test]
    async fn subscribe_then_cancel_terminates() {
        let broker = Broker::new();
        let handler = handler("h1", "orders", COUNTER).unwrap();
        let subscriber = handler.subscribe(&broker, "destroy");
        let handle = handler.handle().clone();
        assert_eq!(handle.state(), HandlerState::Subscribed);
        assert_eq!(broker.topic_subscribers("orders"), 1);
        assert_eq!(broker.topic_subscribers("destroy"), 1);

        let task = tokio::spawn(handler.run(subscriber));
        handle.wait_for(HandlerState::Running).await;
        handle.cancel();
        task.await.unwrap();

        assert_eq!(handle.state(), HandlerState::Terminated);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_run_sequentially_and_are_counted() {
        let broker = Broker::new();
        let handler = handler("h1", "orders", COUNTER).unwrap();
        let subscriber = handler.subscribe(&broker, "destroy");
        let handle = handler.handle().clone();

        for i in 0..3 {
            broker.publish("orders", BusMessage::Event(Event::new(format!("e{}", i), "x")));
        }
        broker.publish(
            "destroy",
            BusMessage::Control(ControlMessage::Destroy { id: "h1".to_string() }),
        );
        // Queued after the destroy; never processed.
        broker.publish("orders", BusMessage::Event(Event::new("late", "x")));

        handler.run(subscriber).await;
        assert_eq!(handle.executions(), 3);
        assert_eq!(handle.state(), HandlerState::Terminated);
    }

    #[tokio::test]
    async fn destroy_for_other_id_is_ignored() {
        let broker = Broker::new();
        let handler = handler("h1", "orders", COUNTER).unwrap();
        let subscriber = handler.subscribe(&broker, "destroy");
        let handle = handler.handle().clone();

        broker.publish(
            "destroy",
            BusMessage::Control(ControlMessage::Destroy { id: "h2".to_string() }),
        );
        broker.publish("orders", BusMessage::Event(Event::new("e1", "x")));
        // Dropping the broker ends the loop once the queue drains.
        drop(broker);

        handler.run(subscriber).await;
        assert_eq!(handle.executions(), 1);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn executions_are_per_handler_while_metric_accumulates() {
        let metric = Arc::new(AtomicU64::new(0));

        for round in 0..2 {
            let broker = Broker::new();
            let handler = handler_with_metric("h1", "orders", COUNTER, Arc::clone(&metric)).unwrap();
            let subscriber = handler.subscribe(&broker, "destroy");
            let handle = handler.handle().clone();
            assert_eq!(handle.executions(), 0);

            broker.publish("orders", BusMessage::Event(Event::new(format!("e{}", round), "x")));
            broker.publish("orders", BusMessage::Event(Event::new("again", "x")));
            drop(broker);

            handler.run(subscriber).await;
            assert_eq!(handle.executions(), 2);
        }

        assert_eq!(metric.load(Ordering::Relaxed), 4);
    }
}
