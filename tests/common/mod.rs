#![allow(dead_code)]

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use hostbridge::classes::ClassRegistry;
use hostbridge::error::{BridgeError, ScriptError};
use hostbridge::{
    Bridge, BridgeConfig, HostObject, InstanceId, ObjectHandle, PackagedArg, ScriptEngine,
    TypeTag, Value, WorkerId,
};

/// A host object fixture carrying only a class name.
pub struct TestObject {
    class: String,
}

impl TestObject {
    pub fn arc(class: &str) -> Arc<dyn HostObject> {
        Arc::new(TestObject {
            class: class.to_string(),
        })
    }
}

impl HostObject for TestObject {
    fn class_name(&self) -> &str {
        &self.class
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Reusable open/wait latch for stalling engine callbacks mid-test.
pub struct Gate {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn open(&self) {
        *self.open.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cv.wait(open).unwrap();
        }
    }
}

/// Everything the engine observed, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Invoke {
        instance: InstanceId,
        handle: ObjectHandle,
        method: String,
        is_constructor: bool,
        arg_count: usize,
        thread: String,
    },
    Collected {
        instance: InstanceId,
        handles: Vec<ObjectHandle>,
    },
    Shadow {
        instance: InstanceId,
        handle: ObjectHandle,
        class: String,
    },
    Raised {
        instance: InstanceId,
        message: String,
        discarded: bool,
    },
    WorkerModule {
        instance: InstanceId,
        path: String,
    },
    WorkerMessage {
        instance: InstanceId,
        payload: String,
    },
    MainMessage {
        worker: WorkerId,
        payload: String,
    },
    WorkerTerminate {
        instance: InstanceId,
    },
    WorkerError {
        worker: WorkerId,
        message: String,
        thread: String,
    },
    ClearShadow {
        worker: WorkerId,
    },
}

/// Script engine double that records every callback.
pub struct RecordingEngine {
    events: Mutex<Vec<EngineEvent>>,
    invoke_result: Mutex<Result<Value, BridgeError>>,
    /// Blocks `run_worker_module` until opened.
    startup_gate: Mutex<Option<Arc<Gate>>>,
    /// Blocks `on_worker_message` (after recording) until opened.
    message_gate: Mutex<Option<Arc<Gate>>>,
    close_on_message: AtomicBool,
    bubble_on_message: AtomicBool,
    echo_on_message: AtomicBool,
    nested_call_on_message: AtomicBool,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            invoke_result: Mutex::new(Ok(Value::Null)),
            startup_gate: Mutex::new(None),
            message_gate: Mutex::new(None),
            close_on_message: AtomicBool::new(false),
            bubble_on_message: AtomicBool::new(false),
            echo_on_message: AtomicBool::new(false),
            nested_call_on_message: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn set_invoke_result(&self, result: Result<Value, BridgeError>) {
        *self.invoke_result.lock().unwrap() = result;
    }

    pub fn hold_worker_startup(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.startup_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn hold_worker_messages(&self) -> Arc<Gate> {
        let gate = Gate::new();
        *self.message_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Make the next worker message close the worker from inside the
    /// handler, the way a script calling `close()` would.
    pub fn close_worker_on_message(&self) {
        self.close_on_message.store(true, Ordering::SeqCst);
    }

    /// Make the next worker message raise an uncaught error to main.
    pub fn bubble_error_on_message(&self) {
        self.bubble_on_message.store(true, Ordering::SeqCst);
    }

    /// Make the next worker message echo its payload back to main.
    pub fn echo_on_message(&self) {
        self.echo_on_message.store(true, Ordering::SeqCst);
    }

    /// Make the next worker message dispatch a call back into script
    /// from inside the handler, while already on the affinity thread.
    pub fn nested_call_on_message(&self) {
        self.nested_call_on_message.store(true, Ordering::SeqCst);
    }

    /// Poll the recorded events until `pred` matches one or `timeout`
    /// elapses. Returns whether a match was seen.
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&EngineEvent) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.events.lock().unwrap().iter().any(&pred) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl ScriptEngine for RecordingEngine {
    fn invoke(
        &self,
        instance: InstanceId,
        handle: ObjectHandle,
        method: &str,
        _return_type: TypeTag,
        is_constructor: bool,
        args: &[PackagedArg],
    ) -> Result<Value, BridgeError> {
        self.record(EngineEvent::Invoke {
            instance,
            handle,
            method: method.to_string(),
            is_constructor,
            arg_count: args.len(),
            thread: current_thread_name(),
        });
        self.invoke_result.lock().unwrap().clone()
    }

    fn notify_collected(&self, instance: InstanceId, handles: &[ObjectHandle]) {
        self.record(EngineEvent::Collected {
            instance,
            handles: handles.to_vec(),
        });
    }

    fn create_script_shadow(&self, instance: InstanceId, handle: ObjectHandle, class_name: &str) {
        self.record(EngineEvent::Shadow {
            instance,
            handle,
            class: class_name.to_string(),
        });
    }

    fn raise_to_script(&self, instance: InstanceId, error: &ScriptError, discarded: bool) {
        self.record(EngineEvent::Raised {
            instance,
            message: error.message.clone(),
            discarded,
        });
    }

    fn run_worker_module(&self, instance: InstanceId, path: &str) -> Result<(), BridgeError> {
        self.record(EngineEvent::WorkerModule {
            instance,
            path: path.to_string(),
        });
        let gate = self.startup_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
        Ok(())
    }

    fn on_worker_message(&self, instance: InstanceId, payload: &str) {
        self.record(EngineEvent::WorkerMessage {
            instance,
            payload: payload.to_string(),
        });
        if self.close_on_message.swap(false, Ordering::SeqCst) {
            if let Some(current) = hostbridge::current_instance() {
                current.close_worker_scope();
            }
        }
        if self.bubble_on_message.swap(false, Ordering::SeqCst) {
            if let Some(current) = hostbridge::current_instance() {
                current.bubble_error_to_main(ScriptError::new("boom", "at worker"));
            }
        }
        if self.echo_on_message.swap(false, Ordering::SeqCst) {
            if let Some(current) = hostbridge::current_instance() {
                current.post_to_main(payload);
            }
        }
        if self.nested_call_on_message.swap(false, Ordering::SeqCst) {
            if let Some(current) = hostbridge::current_instance() {
                // A posted task here would deadlock the loop we are
                // running inside; the dispatcher must go inline.
                let obj = TestObject::arc("app.WorkerLocal");
                let _ = current
                    .init_instance(&obj)
                    .and_then(|_| current.call_script(&obj, "status", TypeTag::Void, &[]));
            }
        }
        let gate = self.message_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.wait();
        }
    }

    fn on_worker_object_message(&self, _instance: InstanceId, worker: WorkerId, payload: &str) {
        self.record(EngineEvent::MainMessage {
            worker,
            payload: payload.to_string(),
        });
    }

    fn on_worker_terminate(&self, instance: InstanceId) {
        self.record(EngineEvent::WorkerTerminate { instance });
    }

    fn on_worker_error(&self, _instance: InstanceId, worker: WorkerId, error: &ScriptError) {
        self.record(EngineEvent::WorkerError {
            worker,
            message: error.message.clone(),
            thread: error.thread_name.clone(),
        });
    }

    fn clear_worker_shadow(&self, _instance: InstanceId, worker: WorkerId) {
        self.record(EngineEvent::ClearShadow { worker });
    }
}

fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .unwrap_or("<unnamed>")
        .to_string()
}

/// Bridge wired to a fresh recording engine and an empty registry.
pub fn test_bridge(engine: Arc<RecordingEngine>) -> Arc<Bridge> {
    test_bridge_with_config(engine, BridgeConfig::default())
}

pub fn test_bridge_with_config(
    engine: Arc<RecordingEngine>,
    config: BridgeConfig,
) -> Arc<Bridge> {
    let _ = env_logger::builder().is_test(true).try_init();
    Bridge::builder()
        .config(config)
        .engine(engine)
        .classes(Arc::new(ClassRegistry::new()))
        .build()
        .unwrap()
}
