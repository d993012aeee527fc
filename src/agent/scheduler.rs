//! Per-actor bounded FIFO request queue.
//!
//! Each actor has at most one request in flight. Further requests wait in a
//! bounded queue; a full queue rejects new requests without changing it. The
//! actor's record exists only while it has work.

use crate::error::{QueueError, Result};
use crate::{ActorId, Request};

use futures::FutureExt as _;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Processes one request to completion.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<()>;
}

/// What happened to an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Processing started right away.
    Started,
    /// Waiting behind the in-flight request; 1-based queue position.
    Queued { position: usize },
}

#[derive(Debug, Default)]
struct ActorQueue {
    pending: VecDeque<Request>,
}

type ActorMap = Arc<Mutex<HashMap<ActorId, ActorQueue>>>;

/// The scheduler. Owns the only per-actor state on the request path.
pub struct RequestQueue {
    handler: Arc<dyn RequestHandler>,
    capacity: usize,
    // An entry exists exactly while the actor has a worker running.
    actors: ActorMap,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl RequestQueue {
    pub fn new(handler: Arc<dyn RequestHandler>, capacity: usize) -> Self {
        Self {
            handler,
            capacity,
            actors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept a request, starting a worker for the actor if none is running.
    pub async fn enqueue(&self, request: Request) -> std::result::Result<Enqueued, QueueError> {
        let actor_id = request.actor_id();
        let mut actors = self.actors.lock().await;

        if let Some(queue) = actors.get_mut(&actor_id) {
            if queue.pending.len() >= self.capacity {
                tracing::info!(actor_id, capacity = self.capacity, "request queue full");
                return Err(QueueError::Full {
                    actor_id,
                    capacity: self.capacity,
                });
            }
            queue.pending.push_back(request);
            let position = queue.pending.len();
            tracing::debug!(actor_id, position, "request queued");
            return Ok(Enqueued::Queued { position });
        }

        actors.insert(actor_id, ActorQueue::default());
        drop(actors);

        tokio::spawn(run_worker(
            self.actors.clone(),
            self.handler.clone(),
            actor_id,
            request,
        ));
        Ok(Enqueued::Started)
    }

    /// Requests waiting behind the in-flight one.
    pub async fn pending_len(&self, actor_id: ActorId) -> usize {
        self.actors
            .lock()
            .await
            .get(&actor_id)
            .map_or(0, |queue| queue.pending.len())
    }

    /// Whether a worker is running for the actor.
    pub async fn is_active(&self, actor_id: ActorId) -> bool {
        self.actors.lock().await.contains_key(&actor_id)
    }

    pub async fn active_actors(&self) -> usize {
        self.actors.lock().await.len()
    }
}

#[tracing::instrument(skip(actors, handler, request))]
async fn run_worker(
    actors: ActorMap,
    handler: Arc<dyn RequestHandler>,
    actor_id: ActorId,
    mut request: Request,
) {
    loop {
        let request_id = request.id;
        let outcome = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => tracing::debug!(%request_id, "request finished"),
            Ok(Err(error)) => tracing::warn!(%error, %request_id, "request failed"),
            Err(_) => tracing::error!(%request_id, "request handler panicked"),
        }

        let mut actors = actors.lock().await;
        let next = actors
            .get_mut(&actor_id)
            .and_then(|queue| queue.pending.pop_front());
        match next {
            Some(next) => request = next,
            None => {
                actors.remove(&actor_id);
                tracing::debug!("actor queue drained");
                return;
            }
        }
    }
}
