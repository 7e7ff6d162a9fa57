//! The bridge root object.
//!
//! A [`Bridge`] owns the engine seam, the class resolution service, the
//! GC bridge, and the registries of live instances and workers. It is
//! built once per process via [`Bridge::builder`], after which
//! [`Bridge::init_main`] brings up the main script context on its own
//! affinity thread.
//!
//! # Example
//!
//! ```rust,ignore
//! let bridge = Bridge::builder()
//!     .engine(my_engine)
//!     .classes(Arc::new(ClassRegistry::new()))
//!     .build()?;
//! let main = bridge.init_main()?;
//! let worker = bridge.spawn_worker("workers/sync.js")?;
//! bridge.post_to_worker(worker, "{\"cmd\":\"start\"}");
//! bridge.shutdown();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::classes::ClassResolutionService;
use crate::config::BridgeConfig;
use crate::engine::ScriptEngine;
use crate::error::BridgeError;
use crate::gc_bridge::{GcBridge, MemoryProbe};
use crate::instance::{EngineInstance, InstanceId};
use crate::scheduler::{self, SchedulerHandle, Task};
use crate::worker::{Envelope, WorkerContext, WorkerId, MAIN_WORKER_ID};

pub struct Bridge {
    config: BridgeConfig,
    engine: Arc<dyn ScriptEngine>,
    classes: Arc<dyn ClassResolutionService>,
    gc: Arc<GcBridge>,
    instances: Mutex<HashMap<InstanceId, Arc<EngineInstance>>>,
    workers: Mutex<HashMap<WorkerId, WorkerContext>>,
    main: OnceLock<Arc<EngineInstance>>,
    main_join: Mutex<Option<JoinHandle<()>>>,
    next_instance_id: AtomicI32,
    next_worker_id: AtomicI32,
    shut_down: AtomicBool,
}

/// Builder for [`Bridge`]. The engine and the class resolution service
/// are required; everything else has defaults.
#[derive(Default)]
pub struct BridgeBuilder {
    config: Option<BridgeConfig>,
    engine: Option<Arc<dyn ScriptEngine>>,
    classes: Option<Arc<dyn ClassResolutionService>>,
    probe: Option<Arc<dyn MemoryProbe>>,
}

impl BridgeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn classes(mut self, classes: Arc<dyn ClassResolutionService>) -> Self {
        self.classes = Some(classes);
        self
    }

    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn build(self) -> Result<Arc<Bridge>, BridgeError> {
        let engine = self
            .engine
            .ok_or_else(|| BridgeError::InvalidArgument("engine is required".to_string()))?;
        let classes = self
            .classes
            .ok_or_else(|| BridgeError::InvalidArgument("classes is required".to_string()))?;
        let config = self.config.unwrap_or_default();
        let gc = GcBridge::new(&config, self.probe);

        Ok(Arc::new(Bridge {
            config,
            engine,
            classes,
            gc,
            instances: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            main: OnceLock::new(),
            main_join: Mutex::new(None),
            next_instance_id: AtomicI32::new(1),
            next_worker_id: AtomicI32::new(MAIN_WORKER_ID + 1),
            shut_down: AtomicBool::new(false),
        }))
    }
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::default()
    }

    /// Bring up the main script context on a dedicated affinity thread.
    /// Blocks until the context is ready to receive dispatched calls.
    pub fn init_main(self: &Arc<Self>) -> Result<Arc<EngineInstance>, BridgeError> {
        if self.main.get().is_some() {
            return Err(BridgeError::InvalidArgument(
                "main instance is already initialized".to_string(),
            ));
        }

        let handle = SchedulerHandle::new();
        let (tx, rx) = oneshot::channel();
        let bridge = Arc::clone(self);
        let loop_handle = handle.clone();
        let join = std::thread::Builder::new()
            .name("hostbridge-main".to_string())
            .spawn(move || {
                loop_handle.bind_current_thread();
                let instance = match bridge.create_instance(MAIN_WORKER_ID, loop_handle.clone()) {
                    Ok(instance) => instance,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let _ = tx.send(Ok(Arc::clone(&instance)));
                scheduler::run_loop(&loop_handle, |envelope| {
                    bridge.handle_main_envelope(&instance, envelope)
                });
                crate::instance::unbind_current();
                log::debug!("main instance loop exited");
            })
            .map_err(|err| {
                BridgeError::InvalidArgument(format!("failed to spawn main thread: {}", err))
            })?;
        *self.main_join.lock().unwrap() = Some(join);

        let instance = rx.blocking_recv().map_err(|_| {
            BridgeError::InvalidArgument("main thread exited during initialization".to_string())
        })??;

        self.main.set(Arc::clone(&instance)).map_err(|_| {
            BridgeError::InvalidArgument("main instance is already initialized".to_string())
        })?;
        log::info!("main instance {} initialized", instance.id());
        Ok(instance)
    }

    /// The main instance, once [`init_main`](Self::init_main) has
    /// completed.
    pub fn main(&self) -> Option<Arc<EngineInstance>> {
        self.main.get().cloned()
    }

    pub fn instance(&self, id: InstanceId) -> Option<Arc<EngineInstance>> {
        self.instances.lock().unwrap().get(&id).cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Terminate every worker, then the main context. Blocks until all
    /// affinity threads have exited. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("bridge shutting down");

        let worker_ids: Vec<WorkerId> = self.workers.lock().unwrap().keys().copied().collect();
        for worker in worker_ids {
            self.terminate_worker(worker);
        }
        let joins: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap();
            workers.values_mut().filter_map(|ctx| ctx.join.take()).collect()
        };
        for join in joins {
            let _ = join.join();
        }

        if let Some(main) = self.main.get() {
            main.scheduler()
                .post_front(Task::Message(Envelope::TerminateThread {
                    worker: MAIN_WORKER_ID,
                }));
        }
        if let Some(join) = self.main_join.lock().unwrap().take() {
            let _ = join.join();
        }
        log::info!("bridge shut down");
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    pub(crate) fn classes(&self) -> &Arc<dyn ClassResolutionService> {
        &self.classes
    }

    pub(crate) fn gc(&self) -> &Arc<GcBridge> {
        &self.gc
    }

    pub(crate) fn workers(&self) -> &Mutex<HashMap<WorkerId, WorkerContext>> {
        &self.workers
    }

    pub(crate) fn allocate_worker_id(&self) -> WorkerId {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create and register an instance for the calling thread. The
    /// calling thread becomes the instance's affinity thread; a thread
    /// already bound to an instance is rejected.
    pub(crate) fn create_instance(
        self: &Arc<Self>,
        worker: WorkerId,
        handle: SchedulerHandle,
    ) -> Result<Arc<EngineInstance>, BridgeError> {
        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        let instance = EngineInstance::new(id, worker, self, handle);
        crate::instance::bind_current(&instance)?;
        self.instances
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&instance));
        self.gc.subscribe(Arc::clone(&instance));
        log::debug!("created instance {} for worker {}", id, worker);
        Ok(instance)
    }

    pub(crate) fn remove_instance(&self, id: InstanceId) {
        self.instances.lock().unwrap().remove(&id);
    }
}
