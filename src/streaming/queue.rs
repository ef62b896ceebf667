// Entity transfer queue
//
// Bounded multi-producer / single-consumer FIFO between simulation threads and
// the streaming thread. Producers never block on the non-blocking path; the
// consumer sleeps on a condition variable until work or shutdown arrives.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::entity::{EntityId, EntityRef};

/// Default number of pending requests before producers are refused
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A queued instruction for the streaming thread
#[derive(Clone)]
pub enum TransferRequest {
    /// Create GPU resources for the entity's current mesh
    Add(EntityRef),
    /// Release GPU resources held for this entity
    Remove(EntityId),
}

impl TransferRequest {
    pub fn entity_id(&self) -> EntityId {
        match self {
            TransferRequest::Add(entity) => entity.id(),
            TransferRequest::Remove(id) => *id,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self, TransferRequest::Remove(_))
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferRequest::Add(entity) => f.debug_tuple("Add").field(&entity.id()).finish(),
            TransferRequest::Remove(id) => f.debug_tuple("Remove").field(id).finish(),
        }
    }
}

/// What the consumer woke up to
#[derive(Debug)]
pub enum WorkBatch {
    /// Every pending request, oldest first
    Requests(Vec<TransferRequest>),
    Shutdown,
}

struct QueueState {
    pending: VecDeque<TransferRequest>,
    shutdown: bool,
}

pub struct TransferQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    // Consumer waits here for work
    work_available: Condvar,
    // Blocking producers wait here for room
    space_available: Condvar,
}

impl TransferQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::with_capacity(capacity),
                shutdown: false,
            }),
            capacity,
            work_available: Condvar::new(),
            space_available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    /// Enqueue without waiting. Returns false if full or shut down.
    pub fn try_push(&self, request: TransferRequest) -> bool {
        let mut state = self.state.lock();
        if state.shutdown || state.pending.len() >= self.capacity {
            return false;
        }
        state.pending.push_back(request);
        drop(state);

        self.work_available.notify_one();
        true
    }

    /// Enqueue, waiting up to `timeout` for room. Returns false on timeout or shutdown.
    ///
    /// A timeout too large to express as a deadline waits without one.
    pub fn push_timeout(&self, request: TransferRequest, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();

        while !state.shutdown && state.pending.len() >= self.capacity {
            match deadline {
                Some(deadline) => {
                    if self
                        .space_available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.space_available.wait(&mut state),
            }
        }

        if state.shutdown || state.pending.len() >= self.capacity {
            return false;
        }
        state.pending.push_back(request);
        drop(state);

        self.work_available.notify_one();
        true
    }

    /// Block until there is work or shutdown was requested.
    ///
    /// Shutdown wins over pending work; otherwise the whole queue is taken.
    pub fn wait_for_work(&self) -> WorkBatch {
        let mut state = self.state.lock();
        while !state.shutdown && state.pending.is_empty() {
            self.work_available.wait(&mut state);
        }

        if state.shutdown {
            return WorkBatch::Shutdown;
        }

        let batch: Vec<_> = state.pending.drain(..).collect();
        drop(state);

        self.space_available.notify_all();
        WorkBatch::Requests(batch)
    }

    /// Take everything currently queued without waiting
    pub fn drain(&self) -> Vec<TransferRequest> {
        let batch: Vec<_> = self.state.lock().pending.drain(..).collect();
        if !batch.is_empty() {
            self.space_available.notify_all();
        }
        batch
    }

    /// Stop accepting requests and wake every waiter
    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.work_available.notify_all();
        self.space_available.notify_all();
    }
}

impl Default for TransferQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}
