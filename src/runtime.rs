//! Runtime for handling inbound events
//!
//! Events for one identity are handled strictly one after another by that
//! identity's worker task. Different identities run in parallel.

mod engine;
mod notifier;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use engine::{Collaborators, EngineError, Outcome, WorkflowEngine};
pub use notifier::{BroadcastNotifier, OutboundMessage};
pub use traits::*;

use crate::identity::Identity;
use crate::state_machine::InboundEvent;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("worker for {0} stopped before replying")]
    WorkerGone(Identity),
}

struct Job {
    event: InboundEvent,
    reply: oneshot::Sender<Result<Outcome, EngineError>>,
}

/// Handle to a running identity worker
struct WorkerHandle {
    generation: u64,
    tx: mpsc::Sender<Job>,
}

#[derive(Default)]
struct Workers {
    handles: HashMap<Identity, WorkerHandle>,
    /// Unregistered workers still draining their queue. Resolves when they exit.
    retiring: HashMap<Identity, (u64, oneshot::Receiver<()>)>,
    next_generation: u64,
}

/// Routes events to per-identity workers, starting them on demand
pub struct Dispatcher {
    engine: Arc<WorkflowEngine>,
    workers: Arc<Mutex<Workers>>,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(engine: Arc<WorkflowEngine>, idle_timeout: Duration) -> Self {
        Self {
            engine,
            workers: Arc::new(Mutex::new(Workers::default())),
            idle_timeout,
        }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    /// Handle an event in its identity's order and wait for the outcome
    pub async fn dispatch(&self, event: InboundEvent) -> Result<Outcome, DispatchError> {
        let identity = event.identity;
        let (reply, reply_rx) = oneshot::channel();
        let mut job = Job { event, reply };

        loop {
            let (generation, tx) = self.worker(identity);
            match tx.send(job).await {
                Ok(()) => break,
                Err(mpsc::error::SendError(returned)) => {
                    // The worker retired between lookup and send
                    tracing::debug!(%identity, "Worker retired, respawning");
                    self.forget(identity, generation);
                    job = returned;
                }
            }
        }

        reply_rx
            .await
            .map_err(|_| DispatchError::WorkerGone(identity))?
            .map_err(DispatchError::from)
    }

    pub fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handles
            .len()
    }

    fn worker(&self, identity: Identity) -> (u64, mpsc::Sender<Job>) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = workers.handles.get(&identity) {
            return (handle.generation, handle.tx.clone());
        }

        workers.next_generation += 1;
        let generation = workers.next_generation;
        let predecessor = workers.retiring.remove(&identity).map(|(_, done)| done);
        let (tx, rx) = mpsc::channel(32);
        workers.handles.insert(
            identity,
            WorkerHandle {
                generation,
                tx: tx.clone(),
            },
        );

        let worker = IdentityWorker {
            identity,
            generation,
            engine: Arc::clone(&self.engine),
            workers: Arc::clone(&self.workers),
            idle_timeout: self.idle_timeout,
        };
        tokio::spawn(worker.run(rx, predecessor));
        tracing::debug!(%identity, generation, "Started identity worker");
        (generation, tx)
    }

    fn forget(&self, identity: Identity, generation: u64) {
        forget(&self.workers, identity, generation);
    }
}

/// Unregister a worker that is about to drain and exit. The next worker for the
/// identity waits on `done` before taking its first job.
fn retire(
    workers: &Mutex<Workers>,
    identity: Identity,
    generation: u64,
    done: oneshot::Receiver<()>,
) {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    if workers
        .handles
        .get(&identity)
        .is_some_and(|h| h.generation == generation)
    {
        workers.handles.remove(&identity);
    }
    workers.retiring.insert(identity, (generation, done));
}

fn retired(workers: &Mutex<Workers>, identity: Identity, generation: u64) {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    if workers
        .retiring
        .get(&identity)
        .is_some_and(|(g, _)| *g == generation)
    {
        workers.retiring.remove(&identity);
    }
}

fn forget(workers: &Mutex<Workers>, identity: Identity, generation: u64) {
    let mut workers = workers.lock().unwrap_or_else(PoisonError::into_inner);
    if workers
        .handles
        .get(&identity)
        .is_some_and(|h| h.generation == generation)
    {
        workers.handles.remove(&identity);
    }
}

struct IdentityWorker {
    identity: Identity,
    generation: u64,
    engine: Arc<WorkflowEngine>,
    workers: Arc<Mutex<Workers>>,
    idle_timeout: Duration,
}

impl IdentityWorker {
    async fn run(self, mut rx: mpsc::Receiver<Job>, predecessor: Option<oneshot::Receiver<()>>) {
        if let Some(done) = predecessor {
            // Jobs the previous worker still holds go first
            let _ = done.await;
        }

        loop {
            match tokio::time::timeout(self.idle_timeout, rx.recv()).await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => break,
                Err(_) => {
                    // Unregister first so new events start a fresh worker, then
                    // finish whatever was queued before the channel closed
                    let (done_tx, done_rx) = oneshot::channel();
                    retire(&self.workers, self.identity, self.generation, done_rx);
                    rx.close();
                    while let Some(job) = rx.recv().await {
                        self.process(job).await;
                    }
                    retired(&self.workers, self.identity, self.generation);
                    drop(done_tx);
                    break;
                }
            }
        }
        tracing::debug!(identity = %self.identity, generation = self.generation, "Identity worker stopped");
    }

    async fn process(&self, job: Job) {
        let result = self.engine.handle(job.event).await;
        if let Err(e) = &result {
            tracing::warn!(identity = %self.identity, error = %e, "Event failed");
        }
        // The caller may have given up waiting
        let _ = job.reply.send(result);
    }
}
