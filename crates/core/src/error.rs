//! Option-validation and lifecycle error taxonomy (spec §7 "Option errors" / "Runtime lifecycle").

use thiserror::Error;

/// A single path segment of a structured validation failure, e.g. `workers[1].bindings["FOO"]`.
pub type ValidationPath = String;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("no workers were provided")]
    NoWorkers,

    #[error("duplicate worker name: {0:?}")]
    DuplicateName(String),

    #[error("validation failed at {path}: {message}")]
    Validation {
        path: ValidationPath,
        message: String,
    },

    #[error("mount {0:?} has no name")]
    MountNoName(String),

    #[error("mounts may not themselves declare mounts: {0:?}")]
    MountNested(String),

    #[error("failed to set up mount {name:?}: {source}")]
    Mount {
        name: String,
        #[source]
        source: Box<OptionError>,
    },

    #[error(
        "worker {worker:?} declares a different unsafeUniqueKey for durable object class {class_name:?} \
         (service {service_name:?}) than a previous declaration"
    )]
    DifferentUniqueKeys {
        worker: String,
        service_name: String,
        class_name: String,
    },

    #[error("queue {0:?} has more than one consumer")]
    MultipleConsumers(String),

    #[error("queue {0:?} cannot be its own dead letter queue")]
    DeadLetterQueueCycle(String),
}

impl OptionError {
    /// Stable machine-readable code, matching the `ERR_*` taxonomy of spec §7.
    pub fn code(&self) -> &'static str {
        match self {
            OptionError::NoWorkers => "ERR_NO_WORKERS",
            OptionError::DuplicateName(_) => "ERR_DUPLICATE_NAME",
            OptionError::Validation { .. } => "ERR_VALIDATION",
            OptionError::MountNoName(_) => "ERR_MOUNT_NO_NAME",
            OptionError::MountNested(_) => "ERR_MOUNT_NESTED",
            OptionError::Mount { .. } => "ERR_MOUNT",
            OptionError::DifferentUniqueKeys { .. } => "ERR_DIFFERENT_UNIQUE_KEYS",
            OptionError::MultipleConsumers(_) => "ERR_MULTIPLE_CONSUMERS",
            OptionError::DeadLetterQueueCycle(_) => "ERR_DEAD_LETTER_QUEUE_CYCLE",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("runtime failed to start or apply the updated configuration")]
    RuntimeFailure,

    #[error("supervisor has been disposed")]
    Disposed,
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::RuntimeFailure => "ERR_RUNTIME_FAILURE",
            LifecycleError::Disposed => "ERR_DISPOSED",
        }
    }
}
