//! Worker Supervisor: owns the worker tree and mounts, serialises config
//! commits through a fair FIFO mutex, and exposes the in-process loopback
//! server the (out-of-scope) runtime calls back into (spec §4.7, §4.8).

pub mod loopback;
pub mod mutex;
pub mod reload;
pub mod supervisor;

pub use loopback::{CustomServiceHandler, LoopbackState, PluginHandler};
pub use mutex::FifoMutex;
pub use reload::{ReloadBus, ReloadEvent};
pub use supervisor::{RuntimeHandle, Supervisor, SupervisorError};
