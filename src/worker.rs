//! Worker lifecycle and main/worker messaging.
//!
//! Workers are script contexts on dedicated threads. Message routing is
//! asymmetric: the main context can only reach a worker's queue after
//! the worker announces itself with a handshake envelope carrying its
//! instance id; messages sent before that are buffered and flushed to
//! the queue tail, in order, when the handshake lands. Termination
//! envelopes jump to the queue front so a busy worker shuts down
//! without draining its backlog first.

use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use crate::bridge::Bridge;
use crate::error::{BridgeError, ScriptError};
use crate::instance::{EngineInstance, InstanceId};
use crate::scheduler::{self, SchedulerHandle, Task};

/// Identifier of one worker within its bridge. The main context is
/// worker 0.
pub type WorkerId = i32;

pub const MAIN_WORKER_ID: WorkerId = 0;

/// Lifecycle of a worker as seen from the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Registered, thread not yet running.
    Created,
    /// Thread running, instance not yet initialized.
    Starting,
    /// Instance initialized, handshake not yet processed by main.
    Handshaking,
    /// Handshake processed; messages flow directly to the queue.
    Active,
    /// Termination posted; further sends are dropped.
    Terminating,
    /// Queue drained and thread exited.
    Closed,
}

/// One message of the main/worker protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Envelope {
    /// Payload from main to a worker.
    ToWorker { worker: WorkerId, payload: String },
    /// Payload from a worker to main.
    ToMain { worker: WorkerId, payload: String },
    /// First envelope a worker sends; tells main which instance serves
    /// the worker and unlocks direct delivery.
    Handshake { worker: WorkerId, instance: InstanceId },
    /// Stop the worker's loop without releasing its main-side shadow.
    TerminateThread { worker: WorkerId },
    /// Stop the worker's loop and ask main to release its shadow.
    TerminateAndClose { worker: WorkerId },
    /// Worker finished closing; main releases the shadow object.
    CloseWorker { worker: WorkerId },
    /// Uncaught worker error re-dispatched into main's error handler.
    BubbleUpError { worker: WorkerId, error: ScriptError },
}

impl Envelope {
    pub fn worker(&self) -> WorkerId {
        match self {
            Envelope::ToWorker { worker, .. }
            | Envelope::ToMain { worker, .. }
            | Envelope::Handshake { worker, .. }
            | Envelope::TerminateThread { worker }
            | Envelope::TerminateAndClose { worker }
            | Envelope::CloseWorker { worker }
            | Envelope::BubbleUpError { worker, .. } => *worker,
        }
    }
}

/// Main-side bookkeeping for one worker.
pub(crate) struct WorkerContext {
    pub(crate) instance: Option<InstanceId>,
    pub(crate) state: WorkerState,
    /// Set only by the handshake; `None` while messages are buffered.
    pub(crate) queue: Option<SchedulerHandle>,
    pub(crate) pending: VecDeque<Envelope>,
    pub(crate) join: Option<JoinHandle<()>>,
}

impl WorkerContext {
    fn new() -> Self {
        Self {
            instance: None,
            state: WorkerState::Created,
            queue: None,
            pending: VecDeque::new(),
            join: None,
        }
    }
}

impl Bridge {
    /// Spawn a worker running the module at `script_path`.
    ///
    /// Returns as soon as the thread is up; the worker reaches
    /// [`WorkerState::Active`] only after main processes its handshake.
    pub fn spawn_worker(self: &Arc<Self>, script_path: &str) -> Result<WorkerId, BridgeError> {
        if self.main().is_none() {
            return Err(BridgeError::InvalidArgument(
                "cannot spawn a worker before the main instance is initialized".to_string(),
            ));
        }

        let worker = self.allocate_worker_id();
        self.workers()
            .lock()
            .unwrap()
            .insert(worker, WorkerContext::new());

        let handle = SchedulerHandle::new();
        let bridge = Arc::clone(self);
        let path = script_path.to_string();
        let join = std::thread::Builder::new()
            .name(format!("W{}: {}", worker, script_path))
            .spawn(move || {
                handle.bind_current_thread();
                run_worker(&bridge, worker, handle, &path);
            })
            .map_err(|err| {
                BridgeError::InvalidArgument(format!("failed to spawn worker thread: {}", err))
            })?;

        let mut workers = self.workers().lock().unwrap();
        if let Some(ctx) = workers.get_mut(&worker) {
            // The worker thread may already have advanced the state.
            if ctx.state == WorkerState::Created {
                ctx.state = WorkerState::Starting;
            }
            ctx.join = Some(join);
        }

        log::info!("spawned worker {} for {}", worker, script_path);
        Ok(worker)
    }

    /// Send a payload to a worker. Messages to workers that have not
    /// completed their handshake are buffered; messages to terminated
    /// workers are dropped with a diagnostic.
    pub fn post_to_worker(&self, worker: WorkerId, payload: impl Into<String>) {
        let payload = payload.into();
        let mut workers = self.workers().lock().unwrap();
        let Some(ctx) = workers.get_mut(&worker) else {
            log::warn!("message not sent, worker {} does not exist", worker);
            return;
        };

        match ctx.state {
            WorkerState::Terminating | WorkerState::Closed => {
                let dropped = Envelope::ToWorker { worker, payload };
                log::warn!(
                    "message not sent, worker {} is terminated: {}",
                    worker,
                    serde_json::to_string(&dropped).unwrap_or_default()
                );
            }
            _ => match &ctx.queue {
                Some(queue) => {
                    if !queue.post(Task::Message(Envelope::ToWorker { worker, payload })) {
                        log::warn!("message not sent, worker {} queue is closed", worker);
                    }
                }
                None => {
                    log::debug!("worker {} not ready, buffering message", worker);
                    ctx.pending.push_back(Envelope::ToWorker { worker, payload });
                }
            },
        }
    }

    /// Request worker termination without releasing its main-side
    /// shadow. The request jumps the worker's queue; a terminate sent
    /// before the handshake is buffered and so loses that priority.
    pub fn terminate_worker(&self, worker: WorkerId) {
        let mut workers = self.workers().lock().unwrap();
        let Some(ctx) = workers.get_mut(&worker) else {
            log::warn!("cannot terminate worker {}, it does not exist", worker);
            return;
        };

        match ctx.state {
            WorkerState::Terminating | WorkerState::Closed => {
                log::debug!("worker {} is already terminated", worker);
            }
            _ => match ctx.queue.take() {
                Some(queue) => {
                    queue.post_front(Task::Message(Envelope::TerminateThread { worker }));
                    ctx.state = WorkerState::Terminating;
                    log::debug!("worker {} termination posted", worker);
                }
                None => {
                    ctx.pending.push_back(Envelope::TerminateThread { worker });
                    log::debug!("worker {} not ready, termination buffered", worker);
                }
            },
        }
    }

    /// Current lifecycle state of a worker, if it is known.
    pub fn worker_state(&self, worker: WorkerId) -> Option<WorkerState> {
        self.workers()
            .lock()
            .unwrap()
            .get(&worker)
            .map(|ctx| ctx.state)
    }

    /// Handle one envelope on the main thread.
    pub(crate) fn handle_main_envelope(
        self: &Arc<Self>,
        main: &Arc<EngineInstance>,
        envelope: Envelope,
    ) -> ControlFlow<()> {
        match envelope {
            Envelope::ToMain { worker, payload } => {
                main.engine()
                    .on_worker_object_message(main.id(), worker, &payload);
                ControlFlow::Continue(())
            }
            Envelope::Handshake { worker, instance } => {
                self.complete_handshake(worker, instance);
                ControlFlow::Continue(())
            }
            Envelope::CloseWorker { worker } => {
                let mut workers = self.workers().lock().unwrap();
                if let Some(ctx) = workers.get_mut(&worker) {
                    ctx.state = WorkerState::Closed;
                    ctx.queue = None;
                }
                drop(workers);
                main.engine().clear_worker_shadow(main.id(), worker);
                ControlFlow::Continue(())
            }
            Envelope::BubbleUpError { worker, error } => {
                main.engine().on_worker_error(main.id(), worker, &error);
                ControlFlow::Continue(())
            }
            Envelope::TerminateThread { .. } => {
                main.set_terminating();
                self.gc().unsubscribe(main.id());
                self.remove_instance(main.id());
                ControlFlow::Break(())
            }
            other => {
                log::warn!("main: unexpected envelope {:?}", other);
                ControlFlow::Continue(())
            }
        }
    }

    fn complete_handshake(&self, worker: WorkerId, instance: InstanceId) {
        let Some(queue) = self.instance(instance).map(|i| i.scheduler().clone()) else {
            log::warn!(
                "couldn't shake hands with worker {}, it has terminated",
                worker
            );
            return;
        };

        let mut workers = self.workers().lock().unwrap();
        let Some(ctx) = workers.get_mut(&worker) else {
            log::warn!("couldn't shake hands with unknown worker {}", worker);
            return;
        };
        if matches!(ctx.state, WorkerState::Terminating | WorkerState::Closed) {
            log::warn!(
                "couldn't shake hands with worker {}, it is terminated",
                worker
            );
            return;
        }

        ctx.state = WorkerState::Active;
        ctx.queue = Some(queue.clone());
        ctx.instance = Some(instance);
        let pending: Vec<Envelope> = ctx.pending.drain(..).collect();
        drop(workers);

        // Buffered messages keep their order; a buffered terminate is
        // delivered at the tail like everything else.
        let mut flushed = 0usize;
        for envelope in pending {
            if queue.post(Task::Message(envelope.clone())) {
                flushed += 1;
            } else {
                log::warn!(
                    "worker {} queue closed mid-flush, dropping buffered envelope: {}",
                    worker,
                    serde_json::to_string(&envelope).unwrap_or_default()
                );
            }
        }
        log::debug!(
            "worker {} handshake complete, {} buffered message(s) flushed",
            worker,
            flushed
        );
    }

    /// Mark a worker closed once its loop has drained and exited.
    pub(crate) fn finish_worker(&self, worker: WorkerId) {
        let mut workers = self.workers().lock().unwrap();
        if let Some(ctx) = workers.get_mut(&worker) {
            ctx.state = WorkerState::Closed;
            ctx.queue = None;
        }
    }
}

/// Body of a worker's affinity thread.
fn run_worker(bridge: &Arc<Bridge>, worker: WorkerId, handle: SchedulerHandle, path: &str) {
    let instance = match bridge.create_instance(worker, handle.clone()) {
        Ok(instance) => instance,
        Err(err) => {
            log::error!("worker {}: instance initialization failed: {}", worker, err);
            bridge.finish_worker(worker);
            return;
        }
    };

    {
        let mut workers = bridge.workers().lock().unwrap();
        if let Some(ctx) = workers.get_mut(&worker) {
            ctx.instance = Some(instance.id());
            ctx.state = WorkerState::Handshaking;
        }
    }

    if let Err(err) = instance.engine().run_worker_module(instance.id(), path) {
        log::error!("worker {}: entry module failed: {}", worker, err);
        instance.bubble_error_to_main(ScriptError::new(err.to_string(), String::new()));
    }

    if let Some(main) = bridge.main() {
        main.scheduler().post(Task::Message(Envelope::Handshake {
            worker,
            instance: instance.id(),
        }));
    }

    scheduler::run_loop(&handle, |envelope| {
        handle_worker_envelope(bridge, &instance, envelope)
    });

    crate::instance::unbind_current();
    bridge.finish_worker(worker);
    log::info!("worker {} exited", worker);
}

fn handle_worker_envelope(
    bridge: &Arc<Bridge>,
    instance: &Arc<EngineInstance>,
    envelope: Envelope,
) -> ControlFlow<()> {
    if instance.is_terminating() {
        log::debug!(
            "worker {}: dropping envelope after termination",
            instance.worker_id()
        );
        return ControlFlow::Continue(());
    }

    match envelope {
        Envelope::ToWorker { payload, .. } => {
            instance.engine().on_worker_message(instance.id(), &payload);
            ControlFlow::Continue(())
        }
        Envelope::TerminateThread { .. } => {
            shutdown_worker_instance(bridge, instance);
            ControlFlow::Break(())
        }
        Envelope::TerminateAndClose { worker } => {
            if let Some(main) = bridge.main() {
                main.scheduler()
                    .post(Task::Message(Envelope::CloseWorker { worker }));
            }
            shutdown_worker_instance(bridge, instance);
            ControlFlow::Break(())
        }
        other => {
            log::warn!(
                "worker {}: unexpected envelope {:?}",
                instance.worker_id(),
                other
            );
            ControlFlow::Continue(())
        }
    }
}

fn shutdown_worker_instance(bridge: &Arc<Bridge>, instance: &Arc<EngineInstance>) {
    instance.set_terminating();
    instance.engine().on_worker_terminate(instance.id());
    bridge.gc().unsubscribe(instance.id());
    bridge.remove_instance(instance.id());
}

impl EngineInstance {
    /// Send a payload from this worker to the main context.
    pub fn post_to_main(&self, payload: impl Into<String>) {
        let Some(bridge) = self.bridge() else {
            return;
        };
        let Some(main) = bridge.main() else {
            log::warn!(
                "worker {}: main instance is gone, message dropped",
                self.worker_id()
            );
            return;
        };
        main.scheduler().post(Task::Message(Envelope::ToMain {
            worker: self.worker_id(),
            payload: payload.into(),
        }));
    }

    /// Re-dispatch an uncaught error from this worker into the main
    /// context's worker error handler.
    pub fn bubble_error_to_main(&self, error: ScriptError) {
        let Some(bridge) = self.bridge() else {
            return;
        };
        let Some(main) = bridge.main() else {
            log::warn!(
                "worker {}: main instance is gone, error dropped: {}",
                self.worker_id(),
                error
            );
            return;
        };
        log::debug!(
            "worker {}: bubbling uncaught error to main: {}",
            self.worker_id(),
            error.to_json()
        );
        main.scheduler().post(Task::Message(Envelope::BubbleUpError {
            worker: self.worker_id(),
            error,
        }));
    }

    /// Worker-initiated close: terminate this worker's loop and release
    /// its main-side shadow.
    pub fn close_worker_scope(&self) {
        if self.is_main() {
            log::warn!("close_worker_scope called on the main instance, ignored");
            return;
        }
        self.scheduler()
            .post_front(Task::Message(Envelope::TerminateAndClose {
                worker: self.worker_id(),
            }));
    }
}
