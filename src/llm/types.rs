//! Provider-facing request/response types and the collaborator trait.

use crate::error::LlmError;
use crate::{ContentPart, HistoryEntry};

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;

/// Lazy, non-restartable sequence of response chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ResponseChunk, LlmError>> + Send>>;

/// Processing state of an uploaded file, as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Processing,
    Active,
    Failed,
}

impl FileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Active | FileState::Failed)
    }

    /// Ordering rank used to reject regressions.
    pub(crate) fn rank(self) -> u8 {
        match self {
            FileState::Pending => 0,
            FileState::Processing => 1,
            FileState::Active | FileState::Failed => 2,
        }
    }
}

/// Handle returned by an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Provider resource name, used for status polling.
    pub name: String,
    pub uri: String,
    pub mime_type: String,
    pub state: FileState,
}

/// Server-side tools the model may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    GoogleSearch,
    UrlContext,
    CodeExecution,
}

/// Harm category threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

impl SafetySetting {
    /// The same threshold applied to every harm category.
    pub fn uniform(threshold: &str) -> Vec<SafetySetting> {
        [
            "HARM_CATEGORY_HARASSMENT",
            "HARM_CATEGORY_HATE_SPEECH",
            "HARM_CATEGORY_SEXUALLY_EXPLICIT",
            "HARM_CATEGORY_DANGEROUS_CONTENT",
        ]
        .into_iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: threshold.to_string(),
        })
        .collect()
    }
}

/// One completion request. Cloned unchanged across retries and fallbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub tools: Vec<Tool>,
    pub safety: Vec<SafetySetting>,
    pub history: Vec<HistoryEntry>,
    pub parts: Vec<ContentPart>,
}

/// Code the model asked to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableCode {
    pub language: String,
    pub code: String,
}

/// Result of a code execution step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeExecutionResult {
    pub outcome: String,
    pub output: String,
}

/// One streamed response chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseChunk {
    pub text: Option<String>,
    pub executable_code: Vec<ExecutableCode>,
    pub code_execution_results: Vec<CodeExecutionResult>,
    pub grounding_metadata: Option<serde_json::Value>,
    pub url_context_metadata: Option<serde_json::Value>,
}

impl ResponseChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Generation provider collaborator.
#[async_trait::async_trait]
pub trait GenerationApi: Send + Sync + 'static {
    /// Upload a local file and return its handle.
    async fn upload(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, LlmError>;

    /// Current processing state of an uploaded file.
    async fn get_status(&self, name: &str) -> Result<FileState, LlmError>;

    /// Start a streamed completion against one model.
    async fn generate_stream(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, LlmError>;
}
