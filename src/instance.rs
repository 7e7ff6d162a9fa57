//! Engine instances and their thread binding.
//!
//! One [`EngineInstance`] exists per script context (the main context
//! plus one per live worker). Each instance is pinned to exactly one
//! affinity thread, and each thread hosts at most one instance; binding
//! a second instance to an already-bound thread is a hard error.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::engine::ScriptEngine;
use crate::error::BridgeError;
use crate::identity::IdentityTable;
use crate::resolver::MethodResolver;
use crate::scheduler::SchedulerHandle;
use crate::value::ObjectHandle;
use crate::worker::{WorkerId, MAIN_WORKER_ID};

/// Identifier of one engine instance within its bridge.
pub type InstanceId = i32;

thread_local! {
    static CURRENT: RefCell<Option<Arc<EngineInstance>>> = const { RefCell::new(None) };
}

/// One script context: identity table, resolver, and affinity queue.
pub struct EngineInstance {
    id: InstanceId,
    worker_id: WorkerId,
    bridge: Weak<Bridge>,
    config: BridgeConfig,
    engine: Arc<dyn ScriptEngine>,
    identity: IdentityTable,
    resolver: MethodResolver,
    scheduler: SchedulerHandle,
    terminating: AtomicBool,
}

impl EngineInstance {
    pub(crate) fn new(
        id: InstanceId,
        worker_id: WorkerId,
        bridge: &Arc<Bridge>,
        scheduler: SchedulerHandle,
    ) -> Arc<Self> {
        let config = bridge.config().clone();
        let resolver = MethodResolver::new(
            Arc::clone(bridge.classes()),
            config.signature_cache_size,
        );
        Arc::new(Self {
            id,
            worker_id,
            bridge: Arc::downgrade(bridge),
            engine: Arc::clone(bridge.engine()),
            config,
            identity: IdentityTable::new(),
            resolver,
            scheduler,
            terminating: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn is_main(&self) -> bool {
        self.worker_id == MAIN_WORKER_ID
    }

    pub fn identity(&self) -> &IdentityTable {
        &self.identity
    }

    pub fn resolver(&self) -> &MethodResolver {
        &self.resolver
    }

    pub(crate) fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &Arc<dyn ScriptEngine> {
        &self.engine
    }

    pub(crate) fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub(crate) fn bridge(&self) -> Option<Arc<Bridge>> {
        self.bridge.upgrade()
    }

    /// Forward collected handles to the engine. An empty slice requests
    /// a full sweep.
    pub fn notify_collected(&self, handles: &[ObjectHandle]) {
        if !handles.is_empty() {
            log::debug!(
                "instance {}: notifying engine of {} collected handle(s)",
                self.id,
                handles.len()
            );
        }
        self.engine.notify_collected(self.id, handles);
    }

    /// Drop the host-side registration of a handle once the engine no
    /// longer references it.
    pub fn release_native_counterpart(&self, handle: ObjectHandle) {
        self.identity.release(handle);
    }

    pub(crate) fn set_terminating(&self) {
        self.terminating.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }
}

/// Instance bound to the calling thread, if any.
pub fn current_instance() -> Option<Arc<EngineInstance>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Bind `instance` to the calling thread for the thread's lifetime.
pub(crate) fn bind_current(instance: &Arc<EngineInstance>) -> Result<(), BridgeError> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if let Some(existing) = current.as_ref() {
            return Err(BridgeError::InstanceAlreadyBoundOnThread(existing.id()));
        }
        *current = Some(Arc::clone(instance));
        Ok(())
    })
}

pub(crate) fn unbind_current() {
    CURRENT.with(|current| current.borrow_mut().take());
}
