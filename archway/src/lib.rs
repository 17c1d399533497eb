//! Archway: sandboxed WebAssembly handlers driven by a publish/subscribe bus.
//!
//! - [`dagger`]: the host side of the guest ABI. Descriptors, URL-addressed
//!   resources and bounds-checked guest memory.
//! - [`bus`]: the in-process broker handlers listen on.
//! - [`runtime`]: handlers, the runner that creates them, and their config.

pub use archway_bus as bus;
pub use archway_dagger as dagger;
pub use archway_runtime as runtime;

pub use archway_bus::Broker;
pub use archway_runtime::{Event, Runner, RunnerConfig};
