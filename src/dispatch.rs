//! Host-to-script call dispatch.
//!
//! Every call into script must run on the owning instance's affinity
//! thread. A caller already on that thread (or running with
//! multithreaded scripting enabled) invokes inline; any other caller
//! packages the call as a task, posts it to the affinity queue, and
//! blocks on a completion channel until the result crosses back.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{BridgeError, ScriptError};
use crate::instance::EngineInstance;
use crate::resolver::RESERVED_INITIALIZER;
use crate::scheduler::Task;
use crate::value::{package_args, HostObject, ObjectHandle, TypeTag, Value};

impl EngineInstance {
    /// Call a script-side method on `target`'s shadow and wait for the
    /// result.
    pub fn call_script(
        self: &Arc<Self>,
        target: &Arc<dyn HostObject>,
        method: &str,
        return_type: TypeTag,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        self.dispatch(target, method, return_type, false, None, args)
    }

    /// Like [`call_script`](Self::call_script), sleeping `delay` before
    /// the call is posted.
    pub fn call_script_delayed(
        self: &Arc<Self>,
        target: &Arc<dyn HostObject>,
        method: &str,
        return_type: TypeTag,
        delay: Duration,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        self.dispatch(target, method, return_type, false, Some(delay), args)
    }

    /// Full dispatch entry point.
    ///
    /// `is_constructor` is forwarded to the engine only for the reserved
    /// initializer, as a trailing boolean argument.
    pub fn dispatch(
        self: &Arc<Self>,
        target: &Arc<dyn HostObject>,
        method: &str,
        return_type: TypeTag,
        is_constructor: bool,
        delay: Option<Duration>,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let handle = self.identity().lookup_handle(target).ok_or_else(|| {
            BridgeError::InvalidArgument(format!(
                "cannot find object id for instance of class {}",
                target.class_name()
            ))
        })?;

        let mut call_args = args.to_vec();
        if method == RESERVED_INITIALIZER {
            call_args.push(Value::Bool(is_constructor));
        }

        if self.config().multithreaded_scripting || self.scheduler().is_current() {
            return self.invoke_on_thread(handle, method, return_type, is_constructor, &call_args);
        }

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let (tx, rx) = oneshot::channel();
        let instance = Arc::clone(self);
        let method = method.to_string();
        let posted = self.scheduler().post(Task::Call(Box::new(move || {
            let result =
                instance.invoke_on_thread(handle, &method, return_type, is_constructor, &call_args);
            // The receiver may have given up; nothing to do then.
            let _ = tx.send(result);
        })));

        if !posted {
            return Err(terminated(self.id(), "call was not dispatched"));
        }

        match rx.blocking_recv() {
            Ok(result) => result,
            // Queue closed with our task still in it.
            Err(_) => Err(terminated(self.id(), "call did not complete")),
        }
    }

    /// Register `obj` and materialize its script-side shadow, both on
    /// first crossing. Must run on the affinity thread; use
    /// [`init_instance_from_any_thread`](Self::init_instance_from_any_thread)
    /// elsewhere.
    pub fn init_instance(&self, obj: &Arc<dyn HostObject>) -> Result<ObjectHandle, BridgeError> {
        debug_assert!(
            self.config().multithreaded_scripting || self.scheduler().is_current(),
            "init_instance called off the affinity thread of instance {}",
            self.id()
        );
        if let Some(handle) = self.identity().lookup_handle(obj) {
            return Ok(handle);
        }
        let handle = self.identity().allocate(Arc::clone(obj));
        self.engine()
            .create_script_shadow(self.id(), handle, obj.class_name());
        log::debug!(
            "instance {}: created shadow for {} (id={})",
            self.id(),
            obj.class_name(),
            handle
        );
        Ok(handle)
    }

    /// [`init_instance`](Self::init_instance) callable from any thread,
    /// marshaling to the affinity thread when necessary.
    pub fn init_instance_from_any_thread(
        self: &Arc<Self>,
        obj: &Arc<dyn HostObject>,
    ) -> Result<ObjectHandle, BridgeError> {
        if self.config().multithreaded_scripting || self.scheduler().is_current() {
            return self.init_instance(obj);
        }

        let (tx, rx) = oneshot::channel();
        let instance = Arc::clone(self);
        let obj = Arc::clone(obj);
        let posted = self.scheduler().post(Task::Call(Box::new(move || {
            let _ = tx.send(instance.init_instance(&obj));
        })));

        if !posted {
            return Err(terminated(self.id(), "shadow was not created"));
        }

        match rx.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(terminated(self.id(), "shadow creation did not complete")),
        }
    }

    fn invoke_on_thread(
        &self,
        handle: ObjectHandle,
        method: &str,
        return_type: TypeTag,
        is_constructor: bool,
        args: &[Value],
    ) -> Result<Value, BridgeError> {
        let packaged = package_args(self.identity(), args);
        let result = self.engine().invoke(
            self.id(),
            handle,
            method,
            return_type,
            is_constructor,
            &packaged,
        );

        match result {
            Err(BridgeError::EngineException(error))
                if self.config().discard_uncaught_exceptions =>
            {
                log::warn!(
                    "instance {}: discarding uncaught script exception: {}",
                    self.id(),
                    error
                );
                self.engine().raise_to_script(self.id(), &error, true);
                Ok(Value::Null)
            }
            other => other,
        }
    }
}

fn terminated(instance: crate::instance::InstanceId, what: &str) -> BridgeError {
    BridgeError::EngineException(ScriptError::new(
        format!("engine instance {} terminated; {}", instance, what),
        String::new(),
    ))
}
