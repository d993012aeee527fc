//! Per-request processing: typing indicator, attachment ingestion, then the
//! generation session. Also tracks running sessions so they can be stopped.

use crate::agent::orchestrator::{Orchestrator, SessionOutcome};
use crate::agent::scheduler::RequestHandler;
use crate::agent::typing::TypingIndicator;
use crate::error::Result;
use crate::ingest::AttachmentIngestor;
use crate::messaging::traits::{OutgoingMessage, TransportDyn};
use crate::{ActorId, ContentPart, Request, RequestId};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Only the requester may stop a session.
    NotOwner,
    NotRunning,
}

#[derive(Debug)]
struct ActiveSession {
    actor_id: ActorId,
    cancel: CancellationToken,
}

/// Cancellation handles of sessions currently running.
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions {
    sessions: Arc<Mutex<HashMap<RequestId, ActiveSession>>>,
}

impl ActiveSessions {
    pub async fn register(&self, request_id: RequestId, actor_id: ActorId) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.sessions.lock().await.insert(
            request_id,
            ActiveSession {
                actor_id,
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    pub async fn remove(&self, request_id: RequestId) {
        self.sessions.lock().await.remove(&request_id);
    }

    pub async fn stop(&self, request_id: RequestId, requested_by: ActorId) -> StopOutcome {
        let sessions = self.sessions.lock().await;
        match sessions.get(&request_id) {
            None => StopOutcome::NotRunning,
            Some(session) if session.actor_id != requested_by => StopOutcome::NotOwner,
            Some(session) => {
                session.cancel.cancel();
                tracing::info!(%request_id, actor_id = requested_by, "session stop requested");
                StopOutcome::Stopped
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// The scheduler's request handler.
pub struct RequestPipeline {
    ingestor: Arc<AttachmentIngestor>,
    orchestrator: Arc<Orchestrator>,
    transport: Arc<dyn TransportDyn>,
    sessions: ActiveSessions,
    typing_timeout: Duration,
}

impl std::fmt::Debug for RequestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestPipeline")
            .field("typing_timeout", &self.typing_timeout)
            .finish_non_exhaustive()
    }
}

impl RequestPipeline {
    pub fn new(
        ingestor: Arc<AttachmentIngestor>,
        orchestrator: Arc<Orchestrator>,
        transport: Arc<dyn TransportDyn>,
        sessions: ActiveSessions,
        typing_timeout: Duration,
    ) -> Self {
        Self {
            ingestor,
            orchestrator,
            transport,
            sessions,
            typing_timeout,
        }
    }

    async fn process(&self, request: &Request, cancel: CancellationToken) -> Result<()> {
        let attachment_parts = match self.ingestor.ingest_all(&request.attachments).await {
            Ok(parts) => parts,
            Err(error) => {
                let notice = OutgoingMessage::text(format!(
                    "Sorry, I couldn't process your attachment: {error}"
                ))
                .replying_to(request.origin.reply_target());
                if let Err(send_error) = self
                    .transport
                    .create_message(request.scope.channel_id, notice)
                    .await
                {
                    tracing::warn!(error = %send_error, "failed to report attachment failure");
                }
                return Err(error.into());
            }
        };

        let mut parts = Vec::with_capacity(attachment_parts.len() + 1);
        if !request.text.trim().is_empty() || attachment_parts.is_empty() {
            parts.push(ContentPart::text(request.text.clone()));
        }
        parts.extend(attachment_parts);

        match self.orchestrator.run(request, parts, cancel).await {
            SessionOutcome::Completed { .. } | SessionOutcome::Cancelled => Ok(()),
            SessionOutcome::Failed(error) => Err(error.into()),
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for RequestPipeline {
    #[tracing::instrument(skip_all, fields(request_id = %request.id, actor_id = request.actor_id()))]
    async fn handle(&self, request: Request) -> Result<()> {
        let typing = TypingIndicator::start(
            self.transport.clone(),
            request.scope.channel_id,
            self.typing_timeout,
        );
        let cancel = self.sessions.register(request.id, request.actor_id()).await;

        let result = self.process(&request, cancel).await;

        self.sessions.remove(request.id).await;
        typing.stop();
        result
    }
}
