//! Error types for php-embed.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`EngineError`]: Lifecycle, evaluation and configuration errors
//! - [`CodecError`]: Host value to engine value conversion errors
//! - [`CallbackError`]: Failures inside the native callback boundary

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level engine errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// the embedded engine, from initialization to script evaluation.
#[derive(Error, Debug)]
pub enum EngineError {
    /// An engine is already active on this runtime.
    #[error("Cannot activate multiple engine instances")]
    AlreadyInitialized,

    /// The engine has not been initialized, or was already destroyed.
    #[error("Engine is not running")]
    NotRunning,

    /// The native runtime refused to start.
    #[error("Native engine failed to initialize: {reason}")]
    NativeInitFailed {
        /// Description of the initialization failure.
        reason: String,
    },

    /// The superglobal environment for a request could not be built.
    #[error("Failed to create server values: {reason}")]
    EnvironmentBuildFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The native request could not be initialized.
    #[error("Failed to initialize context: {reason}")]
    ContextInitFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The context is not between a successful startup and its shutdown.
    #[error("Context is not active (state: {state})")]
    ContextNotActive {
        /// The state the context was found in.
        state: String,
    },

    /// Evaluating a script string failed.
    #[error("Error executing script '{script}' in context: {message}")]
    EvalFailed {
        /// The script source that failed.
        script: String,
        /// The runtime's own error or exception message.
        message: String,
    },

    /// Executing a script file failed.
    #[error("Error executing script '{}' in context: {message}", path.display())]
    ExecFailed {
        /// The script path that failed.
        path: PathBuf,
        /// The runtime's own error message.
        message: String,
    },

    /// The request was already finished and flushed.
    #[error("Request already finished")]
    AlreadyFinished,

    /// Both an output sink and an HTTP response sink were supplied.
    #[error("Conflicting output targets: both an output sink and a response sink were set")]
    ConflictingOutputTarget,

    /// A receiver with this name is already defined.
    #[error("Failed to define duplicate receiver '{name}'")]
    DuplicateReceiver {
        /// The receiver name.
        name: String,
    },

    /// A host value could not be converted.
    #[error("Value conversion failed: {0}")]
    Codec(#[from] CodecError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors converting host values into engine values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The host value category has no engine representation.
    #[error("Unable to create value of unknown type '{type_name}'")]
    UnsupportedType {
        /// Name of the offending type, for diagnostics.
        type_name: String,
    },

    /// The native runtime could not allocate a value.
    #[error("Unable to instantiate engine value: {reason}")]
    AllocationFailed {
        /// Description of the allocation failure.
        reason: String,
    },

    /// Custom error raised by a `Serialize` implementation.
    #[error("{0}")]
    Custom(String),
}

/// Errors raised while answering a callback from the native runtime.
///
/// These never cross the native boundary: they are logged and turned into a
/// script exception or a neutral "not found" answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallbackError {
    /// The engine is not running.
    #[error("Engine is not running")]
    EngineNotRunning,

    /// No context is registered under the handle.
    #[error("Unknown context handle {handle:#x}")]
    UnknownContext {
        /// The native context handle.
        handle: usize,
    },

    /// No receiver is defined under the name.
    #[error("Unknown receiver '{name}'")]
    UnknownReceiver {
        /// The receiver name.
        name: String,
    },

    /// The receiver has no live object for the instance handle.
    #[error("Receiver '{receiver}' has no object for instance {instance:#x}")]
    UnknownInstance {
        /// The receiver name.
        receiver: String,
        /// The native instance handle.
        instance: usize,
    },

    /// The receiver constructor rejected the arguments.
    #[error("Receiver '{receiver}' rejected construction: {reason}")]
    ConstructorRejected {
        /// The receiver name.
        receiver: String,
        /// Reason given by the constructor.
        reason: String,
    },
}

impl EngineError {
    /// Create a new `NativeInitFailed` error.
    pub fn native_init_failed(reason: impl Into<String>) -> Self {
        Self::NativeInitFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `EnvironmentBuildFailed` error.
    pub fn environment_build_failed(reason: impl Into<String>) -> Self {
        Self::EnvironmentBuildFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ContextInitFailed` error.
    pub fn context_init_failed(reason: impl Into<String>) -> Self {
        Self::ContextInitFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ContextNotActive` error.
    pub fn context_not_active(state: impl ToString) -> Self {
        Self::ContextNotActive {
            state: state.to_string(),
        }
    }

    /// Create a new `EvalFailed` error.
    pub fn eval_failed(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EvalFailed {
            script: script.into(),
            message: message.into(),
        }
    }

    /// Create a new `ExecFailed` error.
    pub fn exec_failed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ExecFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a new `DuplicateReceiver` error.
    pub fn duplicate_receiver(name: impl Into<String>) -> Self {
        Self::DuplicateReceiver { name: name.into() }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error was raised by script code.
    pub fn is_script_failure(&self) -> bool {
        matches!(self, Self::EvalFailed { .. } | Self::ExecFailed { .. })
    }

    /// Returns `true` if this error comes from a lifecycle transition.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            Self::AlreadyInitialized
                | Self::NotRunning
                | Self::NativeInitFailed { .. }
                | Self::EnvironmentBuildFailed { .. }
                | Self::ContextInitFailed { .. }
                | Self::ContextNotActive { .. }
                | Self::ConflictingOutputTarget
        )
    }
}

impl CodecError {
    /// Create a new `UnsupportedType` error.
    pub fn unsupported(type_name: impl Into<String>) -> Self {
        Self::UnsupportedType {
            type_name: type_name.into(),
        }
    }

    /// Create a new `AllocationFailed` error.
    pub fn allocation_failed(reason: impl Into<String>) -> Self {
        Self::AllocationFailed {
            reason: reason.into(),
        }
    }
}

impl serde::ser::Error for CodecError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}
