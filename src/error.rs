//! Error taxonomy for the bridge.

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;
use crate::value::ObjectHandle;

/// A script-side error packaged for crossing the boundary.
///
/// Carries everything the main context needs to re-dispatch a worker's
/// uncaught error into the worker owner object's error handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptError {
    pub message: String,
    pub stack: String,
    pub filename: String,
    pub line: u32,
    pub thread_name: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
            filename: String::new(),
            line: 0,
            thread_name: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.filename.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({}:{})", self.message, self.filename, self.line)
        }
    }
}

/// Everything that can go wrong inside the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// No object was ever registered under this handle.
    ObjectNotFound(ObjectHandle),
    /// The handle existed, was weak, and its target has been collected.
    CollectedHandle(ObjectHandle),
    /// More than one overload ranked best for the given arguments.
    AmbiguousOverload {
        class: String,
        method: String,
        candidates: usize,
    },
    /// No overload accepts the given arguments.
    NoMatchingOverload {
        class: String,
        method: String,
        arg_count: usize,
    },
    /// No class descriptor stored under this name.
    ClassNotFound(String),
    /// An error raised by the script engine during a call.
    EngineException(ScriptError),
    /// Caller misuse (e.g. registering a handle twice).
    InvalidArgument(String),
    /// A second engine instance was bound to a thread that already owns one.
    InstanceAlreadyBoundOnThread(InstanceId),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::ObjectNotFound(handle) => {
                write!(f, "no object registered for handle id={}", handle)
            }
            BridgeError::CollectedHandle(handle) => {
                write!(
                    f,
                    "attempt to use cleared object reference id={} (target collected)",
                    handle
                )
            }
            BridgeError::AmbiguousOverload {
                class,
                method,
                candidates,
            } => write!(
                f,
                "ambiguous overload for {}.{}: {} candidates rank equally",
                class, method, candidates
            ),
            BridgeError::NoMatchingOverload {
                class,
                method,
                arg_count,
            } => write!(
                f,
                "failed resolving {}.{} with {} argument(s)",
                class, method, arg_count
            ),
            BridgeError::ClassNotFound(name) => write!(f, "class not found: {}", name),
            BridgeError::EngineException(err) => write!(f, "script engine exception: {}", err),
            BridgeError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            BridgeError::InstanceAlreadyBoundOnThread(id) => write!(
                f,
                "there is an existing engine instance on this thread with id={}",
                id
            ),
        }
    }
}

impl std::error::Error for BridgeError {}
