//! Per-instance identity table mapping host objects to integer handles.
//!
//! The table keeps the handle→object and object→handle directions in
//! lockstep, classifies every live handle as strong (host retains
//! ownership) or weak (host only tracks it), and owns the phantom records
//! that feed collection notifications to the GC bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::BridgeError;
use crate::value::{host_object_key, HostObject, ObjectHandle};

/// Classification of a handle at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Host retains ownership; the object cannot be collected.
    Strong,
    /// Host only tracks the object; it may be collected at any time.
    Weak,
    /// The handle is not (or no longer) valid.
    Absent,
}

/// Collection-trackable sentinel for one weakly-held object.
///
/// Exists exactly as long as its handle is weak; removed exactly once,
/// when the drain observes the target gone, producing one collection
/// notification.
struct PhantomRecord {
    key: usize,
    sentinel: Weak<dyn HostObject>,
}

#[derive(Default)]
struct Tables {
    strong: HashMap<ObjectHandle, Arc<dyn HostObject>>,
    weak: HashMap<ObjectHandle, Weak<dyn HostObject>>,
    strong_ids: HashMap<usize, ObjectHandle>,
    weak_ids: HashMap<usize, ObjectHandle>,
    phantoms: HashMap<ObjectHandle, PhantomRecord>,
}

/// Bidirectional host-object/handle map for one engine instance.
pub struct IdentityTable {
    tables: Mutex<Tables>,
    next_id: AtomicI32,
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityTable {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_id: AtomicI32::new(1),
        }
    }

    fn generate_id(&self) -> ObjectHandle {
        // TODO: handle id wraparound once i32::MAX handles have been
        // allocated by one instance; the counter currently wraps silently.
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an object under a fresh strong handle.
    pub fn allocate(&self, obj: Arc<dyn HostObject>) -> ObjectHandle {
        let handle = self.generate_id();
        let mut tables = self.tables.lock().unwrap();
        insert_strong(&mut tables, handle, obj);
        log::trace!("identity: allocated strong handle id={}", handle);
        handle
    }

    /// Register an object under an engine-chosen handle id.
    pub fn bind_strong(
        &self,
        handle: ObjectHandle,
        obj: Arc<dyn HostObject>,
    ) -> Result<(), BridgeError> {
        let key = host_object_key(&obj);
        let mut tables = self.tables.lock().unwrap();

        if let Some(existing) = tables.strong.get(&handle) {
            if host_object_key(existing) == key {
                return Ok(());
            }
            return Err(BridgeError::InvalidArgument(format!(
                "handle id={} is already bound to a different object",
                handle
            )));
        }
        if tables.weak.contains_key(&handle) {
            return Err(BridgeError::InvalidArgument(format!(
                "handle id={} is already bound weakly",
                handle
            )));
        }

        insert_strong(&mut tables, handle, obj);
        Ok(())
    }

    /// Handle for an object, allocating a strong one on first crossing.
    pub fn get_or_allocate(&self, obj: &Arc<dyn HostObject>) -> ObjectHandle {
        let key = host_object_key(obj);
        let mut tables = self.tables.lock().unwrap();

        if let Some(handle) = tables.strong_ids.get(&key) {
            return *handle;
        }
        if let Some(handle) = tables.weak_ids.get(&key) {
            return *handle;
        }

        let handle = self.generate_id();
        insert_strong(&mut tables, handle, Arc::clone(obj));
        handle
    }

    /// Promote a weak handle back to strong.
    pub fn to_strong(&self, handle: ObjectHandle) -> Result<(), BridgeError> {
        let mut tables = self.tables.lock().unwrap();

        if tables.strong.contains_key(&handle) {
            return Ok(());
        }

        let weak = tables
            .weak
            .remove(&handle)
            .ok_or(BridgeError::ObjectNotFound(handle))?;
        tables.phantoms.remove(&handle);

        match weak.upgrade() {
            Some(obj) => {
                let key = host_object_key(&obj);
                tables.weak_ids.remove(&key);
                insert_strong(&mut tables, handle, obj);
                Ok(())
            }
            None => {
                // Demoted, then collected before the promotion arrived.
                remove_weak_ids_for(&mut tables, handle);
                Err(BridgeError::CollectedHandle(handle))
            }
        }
    }

    /// Demote a strong handle. With `keep_weak` the object stays tracked
    /// weakly (and gets a phantom record); without it the handle is
    /// dropped entirely.
    pub fn to_weak(&self, handle: ObjectHandle, keep_weak: bool) -> Result<(), BridgeError> {
        log::trace!("identity: to_weak id={} keep_weak={}", handle, keep_weak);
        let mut tables = self.tables.lock().unwrap();

        let obj = match tables.strong.remove(&handle) {
            Some(obj) => obj,
            // Already weak: nothing to demote.
            None if tables.weak.contains_key(&handle) => return Ok(()),
            None => return Err(BridgeError::ObjectNotFound(handle)),
        };

        let key = host_object_key(&obj);
        tables.strong_ids.remove(&key);

        if keep_weak {
            let weak = Arc::downgrade(&obj);
            tables.weak.insert(handle, Weak::clone(&weak));
            tables.weak_ids.insert(key, handle);
            tables
                .phantoms
                .insert(handle, PhantomRecord { key, sentinel: weak });
        }

        Ok(())
    }

    /// Demote a strong handle to weak and report whether the target is
    /// still alive. Already-weak handles only report liveness; a dead
    /// weak entry is swept out on the spot.
    pub fn demote_and_check_alive(&self, handle: ObjectHandle) -> bool {
        let mut tables = self.tables.lock().unwrap();

        if let Some(obj) = tables.strong.remove(&handle) {
            let key = host_object_key(&obj);
            tables.strong_ids.remove(&key);

            let weak = Arc::downgrade(&obj);
            tables.weak.insert(handle, Weak::clone(&weak));
            tables.weak_ids.insert(key, handle);
            tables
                .phantoms
                .insert(handle, PhantomRecord { key, sentinel: weak });
            return true;
        }

        match tables.weak.get(&handle) {
            Some(weak) => {
                if weak.upgrade().is_some() {
                    true
                } else {
                    tables.weak.remove(&handle);
                    tables.phantoms.remove(&handle);
                    remove_weak_ids_for(&mut tables, handle);
                    false
                }
            }
            None => false,
        }
    }

    /// Batch liveness probe. Dead weak entries are removed as they are
    /// observed, so a handle reported dead never reports alive again.
    pub fn check_alive(&self, handles: &[ObjectHandle]) -> Vec<bool> {
        let mut tables = self.tables.lock().unwrap();

        handles
            .iter()
            .map(|handle| {
                if tables.strong.contains_key(handle) {
                    return true;
                }
                match tables.weak.get(handle) {
                    Some(weak) if weak.upgrade().is_some() => true,
                    Some(_) => {
                        tables.weak.remove(handle);
                        tables.phantoms.remove(handle);
                        remove_weak_ids_for(&mut tables, *handle);
                        false
                    }
                    None => false,
                }
            })
            .collect()
    }

    /// Resolve a handle to its object.
    ///
    /// Distinguishes "never existed" ([`BridgeError::ObjectNotFound`])
    /// from "existed, then collected" ([`BridgeError::CollectedHandle`]).
    pub fn lookup(&self, handle: ObjectHandle) -> Result<Arc<dyn HostObject>, BridgeError> {
        let tables = self.tables.lock().unwrap();

        if let Some(obj) = tables.strong.get(&handle) {
            return Ok(Arc::clone(obj));
        }

        match tables.weak.get(&handle) {
            Some(weak) => weak.upgrade().ok_or(BridgeError::CollectedHandle(handle)),
            None => Err(BridgeError::ObjectNotFound(handle)),
        }
    }

    /// Handle under which an object is registered, if any.
    pub fn lookup_handle(&self, obj: &Arc<dyn HostObject>) -> Option<ObjectHandle> {
        let key = host_object_key(obj);
        let tables = self.tables.lock().unwrap();
        tables
            .strong_ids
            .get(&key)
            .or_else(|| tables.weak_ids.get(&key))
            .copied()
    }

    /// Current classification of a handle.
    pub fn state(&self, handle: ObjectHandle) -> HandleState {
        let tables = self.tables.lock().unwrap();
        if tables.strong.contains_key(&handle) {
            HandleState::Strong
        } else if tables.weak.contains_key(&handle) {
            HandleState::Weak
        } else {
            HandleState::Absent
        }
    }

    /// Drop a handle from both directions, whatever its state.
    pub fn release(&self, handle: ObjectHandle) {
        let mut tables = self.tables.lock().unwrap();

        if let Some(obj) = tables.strong.remove(&handle) {
            let key = host_object_key(&obj);
            tables.strong_ids.remove(&key);
        }
        if tables.weak.remove(&handle).is_some() {
            remove_weak_ids_for(&mut tables, handle);
        }
        tables.phantoms.remove(&handle);
    }

    /// Remove every phantom record whose target has been collected and
    /// report the handles, each exactly once. Called by the GC bridge.
    pub fn drain_collected(&self) -> Vec<ObjectHandle> {
        let mut tables = self.tables.lock().unwrap();

        let collected: Vec<ObjectHandle> = tables
            .phantoms
            .iter()
            .filter(|(_, record)| record.sentinel.upgrade().is_none())
            .map(|(handle, _)| *handle)
            .collect();

        for handle in &collected {
            if let Some(record) = tables.phantoms.remove(handle) {
                tables.weak_ids.remove(&record.key);
            }
            tables.weak.remove(handle);
        }

        collected
    }

    /// Number of tracked phantom records, for diagnostics.
    pub fn phantom_count(&self) -> usize {
        self.tables.lock().unwrap().phantoms.len()
    }
}

fn insert_strong(tables: &mut Tables, handle: ObjectHandle, obj: Arc<dyn HostObject>) {
    let key = host_object_key(&obj);
    tables.strong.insert(handle, obj);
    tables.strong_ids.insert(key, handle);
}

fn remove_weak_ids_for(tables: &mut Tables, handle: ObjectHandle) {
    // The object is gone, so the reverse entry must be found by value.
    if let Some(key) = tables
        .weak_ids
        .iter()
        .find(|(_, h)| **h == handle)
        .map(|(k, _)| *k)
    {
        tables.weak_ids.remove(&key);
    }
}
