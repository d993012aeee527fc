//! Generation orchestration.
//!
//! Builds one completion request, runs it through the model fallback chain,
//! streams chunks into the visible reply, and appends the (user, assistant)
//! pair to history only when a generation completes. Cancellation is checked
//! before every chunk; a cancelled or failed session never writes history.

use crate::agent::delivery::{ReplyTarget, StreamedReply};
use crate::config::{Config, DeliveryConfig};
use crate::conversation::HistoryStore;
use crate::error::LlmError;
use crate::llm::{
    FallbackEngine, FallbackPolicy, FallbackState, GenerationApi, GenerationRequest,
    ResponseChunk, SafetySetting, Tool,
};
use crate::messaging::traits::TransportDyn;
use crate::prompts::PromptEngine;
use crate::{ContentPart, HistoryEntry, Request};

use futures::StreamExt as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How long a "switching model" notice stays visible.
const FALLBACK_NOTICE_LIFETIME: Duration = Duration::from_secs(5);

/// Grounding links shown under a response.
const MAX_SOURCES: usize = 5;

const STOPPED_MARKER: &str = "*(stopped)*";

/// Static orchestration settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub models: Vec<String>,
    pub policy: FallbackPolicy,
    pub delivery: DeliveryConfig,
    pub safety: Vec<SafetySetting>,
    pub temp_dir: PathBuf,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            models: config.gemini.models.clone(),
            policy: FallbackPolicy::from(&config.limits),
            delivery: config.delivery,
            safety: SafetySetting::uniform(&config.gemini.safety_threshold),
            temp_dir: config.temp_dir(),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    Completed { model: String, text: String },
    Cancelled,
    Failed(LlmError),
}

/// Accumulated output of one attempt.
#[derive(Debug, Default)]
struct SessionText {
    text: String,
    grounding: Option<serde_json::Value>,
    url_context: Option<serde_json::Value>,
}

impl SessionText {
    fn absorb(&mut self, chunk: ResponseChunk) {
        if let Some(text) = chunk.text {
            self.text.push_str(&text);
        }
        for code in chunk.executable_code {
            self.text.push_str(&format!(
                "\n```{}\n{}\n```\n",
                code.language,
                code.code.trim_end()
            ));
        }
        for result in chunk.code_execution_results {
            if !result.output.trim().is_empty() {
                self.text
                    .push_str(&format!("\n```output\n{}\n```\n", result.output.trim_end()));
            }
        }
        // Newer metadata replaces older, field by field.
        if chunk.grounding_metadata.is_some() {
            self.grounding = chunk.grounding_metadata;
        }
        if chunk.url_context_metadata.is_some() {
            self.url_context = chunk.url_context_metadata;
        }
    }
}

enum Attempt {
    Completed(SessionText),
    Cancelled(SessionText),
    Failed(LlmError),
}

/// Drives one request's generation session.
pub struct Orchestrator {
    api: Arc<dyn GenerationApi>,
    transport: Arc<dyn TransportDyn>,
    history: Arc<HistoryStore>,
    prompts: Arc<PromptEngine>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn GenerationApi>,
        transport: Arc<dyn TransportDyn>,
        history: Arc<HistoryStore>,
        prompts: Arc<PromptEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            api,
            transport,
            history,
            prompts,
            config,
        }
    }

    /// Assemble the completion request. Code execution is only offered when
    /// no binary media is part of the conversation.
    pub fn build_request(
        &self,
        system_instruction: String,
        history: Vec<HistoryEntry>,
        parts: Vec<ContentPart>,
    ) -> GenerationRequest {
        let has_binary = parts
            .iter()
            .chain(history.iter().flat_map(|entry| entry.parts.iter()))
            .any(ContentPart::is_binary);

        let mut tools = vec![Tool::GoogleSearch, Tool::UrlContext];
        if !has_binary {
            tools.push(Tool::CodeExecution);
        }

        GenerationRequest {
            system_instruction,
            tools,
            safety: self.config.safety.clone(),
            history,
            parts,
        }
    }

    /// Run a full session for `request` with already-ingested `parts`.
    #[tracing::instrument(skip_all, fields(request_id = %request.id, actor_id = request.actor_id()))]
    pub async fn run(
        &self,
        request: &Request,
        parts: Vec<ContentPart>,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let conversation_id = request
            .scope
            .conversation_id(request.settings.history_scope);

        let history = match self.history.load(&conversation_id).await {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(%error, %conversation_id, "failed to load history, continuing without it");
                Vec::new()
            }
        };

        let system_instruction = match self
            .prompts
            .render_system_prompt(request, chrono::Utc::now())
        {
            Ok(prompt) => prompt,
            Err(error) => {
                tracing::warn!(%error, "failed to render system prompt");
                String::new()
            }
        };

        let generation = self.build_request(system_instruction, history, parts.clone());
        let mut reply = StreamedReply::new(
            self.transport.clone(),
            ReplyTarget {
                request_id: request.id,
                channel_id: request.scope.channel_id,
                reply_to: request.origin.reply_target(),
            },
            &request.settings,
            self.config.delivery,
            self.config.temp_dir.clone(),
        );
        let mut engine = FallbackEngine::new(self.config.models.clone(), self.config.policy);

        while let Some(model) = engine.begin_attempt() {
            tracing::debug!(%model, retries_left = engine.retries_left(), "generation attempt");

            match self.attempt(&model, &generation, &mut reply, &cancel).await {
                Attempt::Completed(session) => {
                    engine.record_success();
                    let footer =
                        source_footer(session.grounding.as_ref(), session.url_context.as_ref());
                    if let Err(error) = reply.finish(&session.text, footer).await {
                        tracing::warn!(%error, "failed to deliver final response");
                    }

                    // The reply is already out; a lost turn only shortens future context.
                    if let Err(error) = self
                        .history
                        .append_turn(
                            &conversation_id,
                            HistoryEntry::user(parts),
                            HistoryEntry::assistant(session.text.clone()),
                        )
                        .await
                    {
                        tracing::debug!(%error, %conversation_id, "history append failed");
                    }

                    tracing::info!(%model, chars = session.text.len(), "generation completed");
                    return SessionOutcome::Completed {
                        model,
                        text: session.text,
                    };
                }
                Attempt::Cancelled(session) => {
                    finish_cancelled(reply, session).await;
                    return SessionOutcome::Cancelled;
                }
                Attempt::Failed(error) => {
                    let previous_index = engine.index();
                    let state = engine.record_failure(&error);
                    tracing::warn!(%error, %model, ?state, "generation attempt failed");

                    if let FallbackState::Backoff { index, delay, .. } = state {
                        if index > previous_index
                            && let Some(next) = engine.current_model()
                        {
                            reply
                                .transient_notice(
                                    &format!(
                                        "`{model}` is unavailable right now, switching to `{next}`."
                                    ),
                                    FALLBACK_NOTICE_LIFETIME,
                                )
                                .await;
                        }

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                finish_cancelled(reply, SessionText::default()).await;
                                return SessionOutcome::Cancelled;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        let failure = engine.failure();
        tracing::error!(error = %failure, "generation failed on every model");
        if let Err(error) = reply.fail(&failure_notice(&failure)).await {
            tracing::warn!(%error, "failed to deliver failure notice");
        }
        SessionOutcome::Failed(failure)
    }

    async fn attempt(
        &self,
        model: &str,
        generation: &GenerationRequest,
        reply: &mut StreamedReply,
        cancel: &CancellationToken,
    ) -> Attempt {
        let mut session = SessionText::default();

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Attempt::Cancelled(session),
            result = self.api.generate_stream(model, generation) => match result {
                Ok(stream) => stream,
                Err(error) => return Attempt::Failed(error),
            },
        };

        loop {
            let flush_at = reply.next_flush_at();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Attempt::Cancelled(session),
                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    reply.flush(&session.text).await;
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        session.absorb(chunk);
                        reply.update(&session.text).await;
                    }
                    Some(Err(error)) => return Attempt::Failed(error),
                    None if session.text.trim().is_empty() => {
                        return Attempt::Failed(LlmError::InvalidResponse(
                            "model returned an empty response".into(),
                        ));
                    }
                    None => return Attempt::Completed(session),
                },
            }
        }
    }
}

async fn finish_cancelled(reply: StreamedReply, session: SessionText) {
    tracing::info!(chars = session.text.len(), "generation cancelled");
    let text = if session.text.trim().is_empty() {
        STOPPED_MARKER.to_string()
    } else {
        format!("{}\n\n{STOPPED_MARKER}", session.text)
    };
    if let Err(error) = reply.finish(&text, None).await {
        tracing::warn!(%error, "failed to finalize cancelled response");
    }
}

fn failure_notice(failure: &LlmError) -> String {
    match failure {
        LlmError::GenerationFailed { models, last_error } => {
            let tried = models
                .iter()
                .map(|model| format!("`{model}`"))
                .collect::<Vec<_>>()
                .join(", ");
            let reason: String = last_error.chars().take(300).collect();
            format!(
                "Sorry, I couldn't generate a response. Models tried: {tried}.\nLast error: {reason}"
            )
        }
        other => format!("Sorry, I couldn't generate a response: {other}"),
    }
}

/// Markdown footer listing grounding and URL-context sources.
fn source_footer(
    grounding: Option<&serde_json::Value>,
    url_context: Option<&serde_json::Value>,
) -> Option<String> {
    let mut links: Vec<(String, String)> = Vec::new();

    if let Some(chunks) = grounding.and_then(|value| value["groundingChunks"].as_array()) {
        for chunk in chunks {
            let web = &chunk["web"];
            if let Some(uri) = web["uri"].as_str() {
                let title = web["title"].as_str().unwrap_or(uri);
                links.push((uri.to_string(), title.to_string()));
            }
        }
    }

    if let Some(urls) = url_context.and_then(|value| value["urlMetadata"].as_array()) {
        for url in urls {
            let retrieved = url["urlRetrievalStatus"]
                .as_str()
                .is_none_or(|status| status == "URL_RETRIEVAL_STATUS_SUCCESS");
            if let (true, Some(uri)) = (retrieved, url["retrievedUrl"].as_str()) {
                links.push((uri.to_string(), uri.to_string()));
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    links.retain(|(uri, _)| seen.insert(uri.clone()));
    if links.is_empty() {
        return None;
    }

    let rendered = links
        .into_iter()
        .take(MAX_SOURCES)
        .map(|(uri, title)| format!("[{title}](<{uri}>)"))
        .collect::<Vec<_>>()
        .join(" · ");
    Some(format!("-# Sources: {rendered}"))
}
