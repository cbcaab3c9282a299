//! Shared data model for the worker supervisor and simulated storage engine.
//!
//! Every other crate in this workspace depends on `miniflare-core` for the option
//! surface (`WorkerOptions`, bindings, durable object designators, namespace
//! identity) and the `ERR_*` error taxonomy, so that validation, routing, and
//! storage all agree on the same shapes.

pub mod cf;
pub mod durable_object;
pub mod error;
pub mod log;
pub mod namespace;
pub mod queue;
pub mod worker;

pub use cf::CfProperties;
pub use durable_object::DurableObjectDesignator;
pub use error::{LifecycleError, OptionError, ValidationPath};
pub use log::{LogLevel, LogRecord};
pub use namespace::{NamespaceId, PersistTarget, PluginKind};
pub use queue::QueueConsumer;
pub use worker::{BindingValue, Module, PersistOptions, RoutePattern, Source, WorkerOptions};
