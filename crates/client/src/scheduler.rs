//! Block request scheduler.
//!
//! A priority queue of pending block requests with a bounded number of
//! in-flight slots, per-request timeouts with a retry budget, and
//! SHA-256 verification of responses. Requests deduplicate on
//! `(file id, offset)`; re-adding an already queued block can only raise
//! its priority. User-priority requests always dispatch before
//! background refill traffic.
//!
//! The queue is owned by a mutex; transmission happens through an
//! injected channel so the scheduler never touches a socket directly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bex_catalog::BlockRequest;
use bex_protocol::wire;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Request ids wrap below 2^53 and are never zero.
const MAX_REQUEST_ID: i64 = (1 << 53) - 1;

/// Dispatch priority; higher dispatches first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Opportunistic refill traffic.
    Background = 0,
    /// A caller is waiting on the bytes.
    User = 1,
}

/// Terminal failure of a block request.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The retry budget ran out without a verified response.
    #[error("block request timed out")]
    Timeout,

    /// The request was removed before completion.
    #[error("block request removed")]
    Removed,

    /// The peer answered with a non-zero response code.
    #[error("peer refused block request with code {0}")]
    Refused(i32),
}

/// Scheduler tunables.
#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    /// In-flight slot count.
    pub concurrent: usize,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub retries: u32,
}

type Waiter = oneshot::Sender<Result<Vec<u8>, RequestError>>;

struct Pending {
    request: BlockRequest,
    priority: Priority,
    insertion: u64,
    retries_left: u32,
    active_id: Option<i64>,
    timeout_task: Option<JoinHandle<()>>,
    waiters: Vec<Waiter>,
}

struct State {
    queue: Vec<Pending>,
    active: usize,
    next_id: i64,
    next_insertion: u64,
    transmit: Option<mpsc::UnboundedSender<wire::Request>>,
}

struct Shared {
    state: Mutex<State>,
    config: SchedulerConfig,
}

/// Handle to the shared scheduler; cheap to clone.
#[derive(Clone)]
pub struct RequestScheduler {
    shared: Arc<Shared>,
}

impl RequestScheduler {
    /// Creates an idle scheduler. Nothing dispatches until a transmit
    /// channel is attached.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    queue: Vec::new(),
                    active: 0,
                    next_id: 0,
                    next_insertion: 0,
                    transmit: None,
                }),
                config,
            }),
        }
    }

    /// Attaches the outbound request channel and dispatches anything
    /// already queued.
    pub fn attach(&self, transmit: mpsc::UnboundedSender<wire::Request>) {
        let mut state = self.lock();
        state.transmit = Some(transmit);
        self.process(&mut state);
    }

    /// Detaches the transmit channel and fails every pending request;
    /// called when the connection goes away.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.transmit = None;
        for mut pending in state.queue.drain(..) {
            if let Some(task) = pending.timeout_task.take() {
                task.abort();
            }
            for waiter in pending.waiters.drain(..) {
                let _ = waiter.send(Err(RequestError::Removed));
            }
        }
        state.active = 0;
    }

    /// Enqueues a block request.
    ///
    /// If the same `(file id, offset)` is already queued its priority is
    /// raised to the maximum of old and new; it is never duplicated.
    pub fn add(&self, request: BlockRequest, priority: Priority) {
        let mut state = self.lock();
        self.enqueue(&mut state, request, priority, None);
        self.process(&mut state);
    }

    /// Enqueues a block request and returns a future resolving with the
    /// verified bytes or the terminal error.
    pub fn wait(
        &self,
        request: BlockRequest,
        priority: Priority,
    ) -> impl Future<Output = Result<Vec<u8>, RequestError>> + Send + use<> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            self.enqueue(&mut state, request, priority, Some(tx));
            self.process(&mut state);
        }
        async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(RequestError::Removed),
            }
        }
    }

    /// Delivers response bytes for an in-flight request id.
    ///
    /// On hash match the request completes and its [`BlockRequest`] is
    /// returned so the caller can write the cache through. On mismatch
    /// the response is dropped and the timeout path retries.
    pub fn received(&self, id: i64, data: &[u8]) -> Option<BlockRequest> {
        let mut state = self.lock();
        let position = state
            .queue
            .iter()
            .position(|pending| pending.active_id == Some(id))?;

        if Sha256::digest(data).as_slice() != state.queue[position].request.hash {
            warn!(id, "response failed hash verification; leaving request for retry");
            return None;
        }

        let mut pending = state.queue.remove(position);
        state.active -= 1;
        if let Some(task) = pending.timeout_task.take() {
            task.abort();
        }
        for waiter in pending.waiters.drain(..) {
            let _ = waiter.send(Ok(data.to_vec()));
        }
        self.process(&mut state);
        Some(pending.request)
    }

    /// Fails an in-flight request after a peer refusal.
    pub fn refused(&self, id: i64, code: i32) {
        let mut state = self.lock();
        let Some(position) = state
            .queue
            .iter()
            .position(|pending| pending.active_id == Some(id))
        else {
            return;
        };
        let mut pending = state.queue.remove(position);
        state.active -= 1;
        if let Some(task) = pending.timeout_task.take() {
            task.abort();
        }
        warn!(id, code, name = %pending.request.name, "peer refused block request");
        for waiter in pending.waiters.drain(..) {
            let _ = waiter.send(Err(RequestError::Refused(code)));
        }
        self.process(&mut state);
    }

    /// Removes every pending request for one file, failing its waiters.
    pub fn remove(&self, folder: &str, name: &str) {
        let mut state = self.lock();
        let mut removed = Vec::new();
        state.queue.retain_mut(|pending| {
            if pending.request.folder == folder && pending.request.name == name {
                removed.push((
                    pending.active_id.take(),
                    pending.timeout_task.take(),
                    std::mem::take(&mut pending.waiters),
                ));
                false
            } else {
                true
            }
        });
        for (active, task, waiters) in removed {
            if active.is_some() {
                state.active -= 1;
            }
            if let Some(task) = task {
                task.abort();
            }
            for waiter in waiters {
                let _ = waiter.send(Err(RequestError::Removed));
            }
        }
        self.process(&mut state);
    }

    /// Number of queued (active and waiting) requests.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .expect("scheduler state lock poisoned")
    }

    fn enqueue(
        &self,
        state: &mut State,
        request: BlockRequest,
        priority: Priority,
        waiter: Option<Waiter>,
    ) {
        if let Some(pending) = state.queue.iter_mut().find(|pending| {
            pending.request.file_id == request.file_id
                && pending.request.offset == request.offset
        }) {
            pending.priority = pending.priority.max(priority);
            if let Some(waiter) = waiter {
                pending.waiters.push(waiter);
            }
            return;
        }

        let insertion = state.next_insertion;
        state.next_insertion += 1;
        state.queue.push(Pending {
            request,
            priority,
            insertion,
            retries_left: self.shared.config.retries,
            active_id: None,
            timeout_task: None,
            waiters: waiter.into_iter().collect(),
        });
    }

    /// Fills free slots: highest priority first, insertion order within a
    /// priority.
    fn process(&self, state: &mut State) {
        let Some(transmit) = state.transmit.clone() else {
            return;
        };
        while state.active < self.shared.config.concurrent {
            let Some(position) = state
                .queue
                .iter()
                .enumerate()
                .filter(|(_, pending)| pending.active_id.is_none())
                .max_by_key(|(_, pending)| (pending.priority, std::cmp::Reverse(pending.insertion)))
                .map(|(position, _)| position)
            else {
                return;
            };

            let id = next_request_id(state);
            let pending = &mut state.queue[position];
            pending.active_id = Some(id);
            state.active += 1;

            let request = &state.queue[position].request;
            let message = wire::Request {
                id,
                folder: request.folder.clone(),
                name: request.name.clone(),
                offset: request.offset,
                size: request.size,
                hash: request.hash.clone(),
            };
            debug!(id, name = %request.name, offset = request.offset, "dispatching block request");
            if transmit.send(message).is_err() {
                // Connection writer is gone; leave the request queued for
                // the next attach.
                let pending = &mut state.queue[position];
                pending.active_id = None;
                state.active -= 1;
                state.transmit = None;
                return;
            }

            let scheduler = self.clone();
            let timeout = self.shared.config.timeout;
            state.queue[position].timeout_task = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                scheduler.on_timeout(id);
            }));
        }
    }

    fn on_timeout(&self, id: i64) {
        let mut state = self.lock();
        let Some(position) = state
            .queue
            .iter()
            .position(|pending| pending.active_id == Some(id))
        else {
            return;
        };

        let pending = &mut state.queue[position];
        pending.timeout_task = None;
        if pending.retries_left > 0 {
            pending.retries_left -= 1;
            pending.active_id = None;
            let name = pending.request.name.clone();
            state.active -= 1;
            debug!(id, name = %name, "request timed out; rescheduling");
        } else {
            let mut pending = state.queue.remove(position);
            state.active -= 1;
            warn!(id, name = %pending.request.name, "request timed out; retries exhausted");
            for waiter in pending.waiters.drain(..) {
                let _ = waiter.send(Err(RequestError::Timeout));
            }
        }
        self.process(&mut state);
    }
}

/// Produces the next request id: monotonically increasing, wrapping
/// below 2^53, never zero.
fn next_request_id(state: &mut State) -> i64 {
    state.next_id = if state.next_id >= MAX_REQUEST_ID {
        1
    } else {
        state.next_id + 1
    };
    state.next_id
}
