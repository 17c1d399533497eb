//! # archway-runtime
//!
//! The scheduler side of archway: it runs sandboxed WebAssembly guests in
//! response to messages on a publish/subscribe bus.
//!
//! ## Core Concepts
//!
//! ### Handlers
//!
//! A **Handler** binds one guest instance to one data topic. Each handler
//! owns exactly one [`Guest`], and that guest owns exactly one
//! [`Process`](archway_dagger::Process): its descriptor table, streams and
//! environment. Nothing is shared between handlers.
//!
//! For every [`Event`] on its topic, a handler:
//!
//! 1. generates a fresh run id,
//! 2. sets the guest environment to `HANDLER_ID`, `RUN_ID`, `EVENT_ID` and
//!    `TOPIC`,
//! 3. makes the event payload the guest's `stdin://`,
//! 4. invokes the entry point (`cwa_main` by default) to completion,
//! 5. counts the execution and reports it through [`Telemetry`].
//!
//! Invocations of one handler never overlap. A trapping guest is reported
//! and the handler moves on to the next event.
//!
//! ### The Runner
//!
//! The [`Runner`] listens on the create control topic. A create request
//! carries an id, a data topic and a module; the runner links the module,
//! subscribes the new handler to its topic and to the destroy topic, and
//! spawns its loop. A destroy request naming the handler stops it between
//! invocations.
//!
//! ```text
//!   create topic ──► Runner ──spawns──► Handler(id, topic) ──► Guest ──► Process
//!                                          ▲        ▲
//!                    data topic ───────────┘        │
//!                    destroy topic ─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use archway_bus::Broker;
//! use archway_runtime::{Event, Runner, RunnerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let broker = Broker::new();
//! let runner = Arc::new(Runner::new(broker, RunnerConfig::default())?);
//! let cancel = CancellationToken::new();
//! let manager = Arc::clone(&runner).start(cancel.clone());
//!
//! runner.create("h1", "orders", std::fs::read("handler.wasm")?);
//! runner.publish_event("orders", Event::new("e1", "hello"));
//!
//! cancel.cancel(); // stops the runner and every handler it spawned
//! manager.await?;
//! ```

pub mod config;
pub mod error;
pub mod guest;
pub mod handler;
pub mod message;
pub mod runner;
pub mod telemetry;

pub use config::RunnerConfig;
pub use error::{Result, RuntimeError};
pub use guest::{Guest, GuestState};
pub use handler::{Handler, HandlerHandle, HandlerState};
pub use message::{BusMessage, ControlMessage, CreateHandler, Event};
pub use runner::Runner;
pub use telemetry::{execution_counter_name, Invocation, Metrics, Telemetry, TracingTelemetry};
