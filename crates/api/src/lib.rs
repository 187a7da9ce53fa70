//! Corral runtime façade.
//!
//! Front-ends talk to the store through [`Runtime`]: namespace/type/name and
//! label-selector queries become store lists and watches, and `delete` drives
//! the teardown, finalizer wait, destroy sequence. [`CoreRuntime`] also wires
//! the reconciliation engine and optional subsystems into a supervisor.

#![forbid(unsafe_code)]

mod config;
mod item;
mod logger;
mod query;
mod runtime;

pub use config::RuntimeConfig;
pub use item::ResourceItem;
pub use logger::ResourceLogger;
pub use query::QueryOptions;
pub use runtime::{CoreRuntime, CoreRuntimeBuilder, ListResult, Runtime, Subsystem};
