//! Worker runtime
//!
//! A fixed set of workers, each an OS thread driving a single-threaded
//! cooperative event loop. A session is handed to one worker at accept time
//! and never migrates; no session data is touched by another worker. The
//! only cross-worker traffic is messages through each worker's inbox,
//! processed in loop-turn order.

mod kill;

pub use kill::{KillRequest, KillSignal};

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{debug, error, info, warn};

use crate::metrics::metrics;
use crate::session::{ServiceContext, Session};

/// Message delivered to one worker's inbox
pub enum WorkerMessage {
    NewSession {
        /// Nonblocking stream, re-registered with the worker's own reactor
        stream: std::net::TcpStream,
        peer_host: String,
        session_id: u64,
    },
    Kill(KillRequest),
    Shutdown,
}

/// Fan-out point for KILL requests: every worker's inbox, populated as the
/// workers start
#[derive(Default)]
pub struct KillDispatcher {
    inboxes: RwLock<Vec<mpsc::UnboundedSender<WorkerMessage>>>,
}

impl KillDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, inbox: mpsc::UnboundedSender<WorkerMessage>) {
        self.inboxes.write().push(inbox);
    }

    /// Deliver the request to every worker's inbox
    pub fn broadcast(&self, request: KillRequest) {
        debug!(command = ?request.command, "Dispatching kill to all workers");
        for inbox in self.inboxes.read().iter() {
            let _ = inbox.send(WorkerMessage::Kill(request.clone()));
        }
    }
}

/// Per-session bookkeeping in the owning worker's table
struct SessionControl {
    kill_tx: mpsc::UnboundedSender<KillSignal>,
    username: Rc<RefCell<String>>,
}

/// Handle to a running worker
pub struct WorkerHandle {
    inbox: mpsc::UnboundedSender<WorkerMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// The fixed worker set
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `count` workers, registering each inbox with the kill
    /// dispatcher
    pub fn spawn(count: usize, ctx: Arc<ServiceContext>) -> Self {
        let count = count.max(1);
        let mut workers = Vec::with_capacity(count);

        for id in 0..count {
            let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
            ctx.kill_dispatcher.register(inbox_tx.clone());

            let worker_ctx = ctx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_main(id, worker_ctx, inbox_rx))
                .expect("failed to spawn worker thread");

            workers.push(WorkerHandle {
                inbox: inbox_tx,
                thread: Some(thread),
            });
        }

        info!(workers = count, "Worker pool started");
        Self {
            workers,
            next: AtomicUsize::new(0),
        }
    }

    /// Pin a new session to a worker, round robin
    pub fn assign(&self, stream: std::net::TcpStream, peer_host: String, session_id: u64) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[idx]
            .inbox
            .send(WorkerMessage::NewSession {
                stream,
                peer_host,
                session_id,
            })
            .is_err()
        {
            error!(worker = idx, "Worker inbox closed, dropping connection");
        }
    }

    /// Ask every worker to stop and wait for the threads
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            let _ = worker.inbox.send(WorkerMessage::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
        info!("Worker pool stopped");
    }
}

/// Entry point of one worker thread: a current-thread runtime driving a
/// LocalSet, so every session future is single-threaded and cooperatively
/// scheduled
fn worker_main(
    id: usize,
    ctx: Arc<ServiceContext>,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = id, error = %e, "Failed to build worker runtime");
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, worker_loop(id, ctx, inbox));
}

async fn worker_loop(
    id: usize,
    ctx: Arc<ServiceContext>,
    mut inbox: mpsc::UnboundedReceiver<WorkerMessage>,
) {
    let sessions: Rc<RefCell<HashMap<u64, SessionControl>>> = Rc::new(RefCell::new(HashMap::new()));

    while let Some(message) = inbox.recv().await {
        match message {
            WorkerMessage::NewSession {
                stream,
                peer_host,
                session_id,
            } => {
                start_session(id, &ctx, &sessions, stream, peer_host, session_id);
            }
            WorkerMessage::Kill(request) => {
                deliver_kill(id, &sessions, request);
            }
            WorkerMessage::Shutdown => {
                info!(worker = id, "Worker shutting down");
                break;
            }
        }
    }
}

fn start_session(
    worker_id: usize,
    ctx: &Arc<ServiceContext>,
    sessions: &Rc<RefCell<HashMap<u64, SessionControl>>>,
    stream: std::net::TcpStream,
    peer_host: String,
    session_id: u64,
) {
    // Register with this worker's reactor
    let stream = match tokio::net::TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(worker = worker_id, error = %e, "Failed to adopt client socket");
            return;
        }
    };
    stream.set_nodelay(true).ok();

    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let username = Rc::new(RefCell::new(String::new()));
    sessions.borrow_mut().insert(
        session_id,
        SessionControl {
            kill_tx,
            username: username.clone(),
        },
    );

    debug!(worker = worker_id, session_id, peer = %peer_host, "Session pinned to worker");
    metrics().record_connection_accepted();

    let session = Session::new(session_id, ctx.clone(), kill_rx, peer_host);
    let sessions = sessions.clone();
    tokio::task::spawn_local(async move {
        // The worker table needs the username for KILL USER matching; the
        // session publishes it into the shared cell once authenticated
        let result = session.run_with_username_cell(stream, username).await;
        if let Err(e) = result {
            warn!(session_id, error = %e, "Session ended with error");
        } else {
            debug!(session_id, "Session ended");
        }
        sessions.borrow_mut().remove(&session_id);
        metrics().record_connection_closed();
    });
}

fn deliver_kill(
    worker_id: usize,
    sessions: &Rc<RefCell<HashMap<u64, SessionControl>>>,
    request: KillRequest,
) {
    let table = sessions.borrow();
    for (&session_id, control) in table.iter() {
        if request.matches(session_id, &control.username.borrow()) {
            debug!(
                worker = worker_id,
                session_id,
                command = ?request.command,
                "Kill matched session"
            );
            let _ = control.kill_tx.send(request.signal());
        }
    }
}
