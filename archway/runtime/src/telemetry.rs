//! Observability hooks for handlers.
//!
//! Handlers report through an injected [`Telemetry`] object instead of
//! logging directly, so tests can capture what happened. Execution counts
//! live in a shared [`Metrics`] registry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RuntimeError;

/// One guest invocation, as reported after it returns.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub handler_id: String,
    pub run_id: Uuid,
    pub event_id: String,
    pub topic: String,
    pub duration: Duration,
    /// The entry point's return value, or the error message.
    pub outcome: std::result::Result<i64, String>,
}

/// Receives handler lifecycle and invocation reports.
pub trait Telemetry: Send + Sync {
    fn handler_created(&self, id: &str, topic: &str);

    fn handler_create_failed(&self, id: &str, topic: &str, error: &RuntimeError);

    fn invocation(&self, invocation: &Invocation);

    fn handler_terminated(&self, id: &str, topic: &str, executions: u64);
}

/// Reports everything as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn handler_created(&self, id: &str, topic: &str) {
        info!(handler_id = id, topic, "handler created");
    }

    fn handler_create_failed(&self, id: &str, topic: &str, error: &RuntimeError) {
        error!(handler_id = id, topic, error = %error, "creating handler failed");
    }

    fn invocation(&self, invocation: &Invocation) {
        match &invocation.outcome {
            Ok(ret) => info!(
                handler_id = %invocation.handler_id,
                run_id = %invocation.run_id,
                event_id = %invocation.event_id,
                topic = %invocation.topic,
                exec_dur = ?invocation.duration,
                ret,
                "guest invocation"
            ),
            Err(e) => warn!(
                handler_id = %invocation.handler_id,
                run_id = %invocation.run_id,
                event_id = %invocation.event_id,
                topic = %invocation.topic,
                exec_dur = ?invocation.duration,
                error = %e,
                "guest invocation failed"
            ),
        }
    }

    fn handler_terminated(&self, id: &str, topic: &str, executions: u64) {
        info!(handler_id = id, topic, executions, "handler terminated");
    }
}

/// Named counters shared by every handler of a runner.
///
/// Counters are created on first use and never removed, so a handler's
/// count survives its termination.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, Arc<AtomicU64>>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for `name`, created at zero if missing.
    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry(name.to_string()).or_default())
    }

    /// Current value of `name`, or zero if it was never created.
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Name of the execution counter for a handler.
pub fn execution_counter_name(topic: &str, id: &str) -> String {
    format!("{}-{}", topic, id)
}
