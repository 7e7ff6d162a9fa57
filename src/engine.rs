//! The script engine seam.
//!
//! Everything the bridge asks of the embedded engine goes through this
//! trait: dispatching calls into script, collection notifications,
//! shadow-object lifecycle, and the worker callbacks. The bridge
//! guarantees that every method is invoked on the affinity thread of the
//! instance named by the first parameter.

use crate::error::{BridgeError, ScriptError};
use crate::instance::InstanceId;
use crate::value::{ObjectHandle, PackagedArg, TypeTag, Value};
use crate::worker::WorkerId;

pub trait ScriptEngine: Send + Sync {
    /// Invoke `method` on the script-side counterpart of `handle`.
    ///
    /// `is_constructor` is meaningful only for the reserved initializer
    /// and tells the engine whether the initializer runs as part of
    /// object construction.
    fn invoke(
        &self,
        instance: InstanceId,
        handle: ObjectHandle,
        method: &str,
        return_type: TypeTag,
        is_constructor: bool,
        args: &[PackagedArg],
    ) -> Result<Value, BridgeError>;

    /// Host-side objects behind these handles have been collected; the
    /// engine should drop the matching script-side state. An empty slice
    /// requests a full sweep.
    fn notify_collected(&self, instance: InstanceId, handles: &[ObjectHandle]);

    /// Materialize a script-side shadow for a freshly registered host
    /// object.
    fn create_script_shadow(&self, instance: InstanceId, handle: ObjectHandle, class_name: &str);

    /// Deliver a host-side error into script. With `discarded` the error
    /// was suppressed by policy and is surfaced through the engine's
    /// discard hook instead of being thrown.
    fn raise_to_script(&self, instance: InstanceId, error: &ScriptError, discarded: bool);

    /// Load and run the entry module of a freshly spawned worker.
    fn run_worker_module(&self, instance: InstanceId, path: &str) -> Result<(), BridgeError>;

    /// A message from the main context arrived on a worker's thread.
    fn on_worker_message(&self, instance: InstanceId, payload: &str);

    /// A message from worker `worker` arrived on the main thread.
    fn on_worker_object_message(&self, instance: InstanceId, worker: WorkerId, payload: &str);

    /// The worker is terminating; runs on the worker's thread before its
    /// queue shuts down.
    fn on_worker_terminate(&self, instance: InstanceId);

    /// An uncaught error from worker `worker` bubbled up to the main
    /// thread.
    fn on_worker_error(&self, instance: InstanceId, worker: WorkerId, error: &ScriptError);

    /// The main-side shadow of a closed worker should be released.
    fn clear_worker_shadow(&self, instance: InstanceId, worker: WorkerId);
}
