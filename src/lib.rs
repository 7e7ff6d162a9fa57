//! Bridge between managed host objects and an embedded script engine.
//!
//! The bridge keeps the two object graphs in lockstep: host objects get
//! integer handles and script-side shadows, calls from any host thread
//! marshal onto the owning context's affinity thread, collected objects
//! are reported back to the engine, and worker contexts exchange
//! messages with the main context through a handshake-gated protocol.
//!
//! Entry point is [`bridge::Bridge`]; the engine plugs in through
//! [`engine::ScriptEngine`] and host classes are described to the
//! resolver through [`classes::ClassResolutionService`].

pub mod bridge;
pub mod classes;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gc_bridge;
pub mod identity;
pub mod instance;
pub mod resolver;
pub mod scheduler;
pub mod value;
pub mod worker;

// Core API
pub use bridge::{Bridge, BridgeBuilder};
pub use config::BridgeConfig;
pub use engine::ScriptEngine;
pub use error::{BridgeError, ScriptError};
pub use instance::{current_instance, EngineInstance, InstanceId};
pub use value::{HostObject, ObjectHandle, PackagedArg, TypeTag, Value};
pub use worker::{Envelope, WorkerId, WorkerState, MAIN_WORKER_ID};
