//! Gemini REST client: resumable file upload, file status, and SSE streaming.

use crate::error::LlmError;
use crate::llm::types::{
    ChunkStream, CodeExecutionResult, ExecutableCode, FileState, GenerationApi,
    GenerationRequest, RemoteFile, ResponseChunk, Tool,
};
use crate::{ContentPart, HistoryEntry, Role};

use eventsource_stream::Eventsource as _;
use futures::StreamExt as _;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

/// Public Gemini endpoint.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini API client.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self, LlmError> {
        // No total timeout: streamed generations and media uploads can run long.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LlmError::ProviderRequest(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Shared HTTP client, also used for attachment downloads.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }
}

#[async_trait::async_trait]
impl GenerationApi for GeminiClient {
    async fn upload(
        &self,
        path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, LlmError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            LlmError::ProviderRequest(format!("failed to open {}: {e}", path.display()))
        })?;
        let length = file
            .metadata()
            .await
            .map_err(|e| {
                LlmError::ProviderRequest(format!("failed to stat {}: {e}", path.display()))
            })?
            .len();

        let start = self
            .http
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", length.to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&serde_json::json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = start.status();
        if !status.is_success() {
            let body = start.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse("upload session missing upload url".into()))?;

        let response = self
            .http
            .post(&upload_url)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            LlmError::ProviderRequest(format!("failed to read response body: {e}"))
        })?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidResponse(format!("upload response is not JSON: {e}")))?;
        parse_file(&body["file"], mime_type)
    }

    async fn get_status(&self, name: &str) -> Result<FileState, LlmError> {
        let response = self
            .http
            .get(format!("{}/v1beta/{name}", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            LlmError::ProviderRequest(format!("failed to read response body: {e}"))
        })?;
        if !status.is_success() {
            return Err(api_error(status, &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidResponse(format!("file status is not JSON: {e}")))?;
        Ok(parse_state(body["state"].as_str()))
    }

    async fn generate_stream(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<ChunkStream, LlmError> {
        let body = build_request_body(request);

        let response = self
            .http
            .post(format!(
                "{}/v1beta/models/{model}:streamGenerateContent",
                self.base_url
            ))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::ProviderRequest(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(api_error(status, &text));
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|result| async move {
                match result {
                    Ok(event) if event.data.trim().is_empty() => None,
                    Ok(event) => Some(parse_event_data(&event.data)),
                    Err(error) => Some(Err(LlmError::ProviderRequest(format!(
                        "SSE stream error: {error}"
                    )))),
                }
            });

        Ok(Box::pin(stream))
    }
}

/// Map a non-success HTTP response onto the error taxonomy.
fn api_error(status: StatusCode, body: &str) -> LlmError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| truncate_body(body).to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        LlmError::RateLimitExceeded(format!("Gemini API error ({status}): {message}"))
    } else {
        LlmError::ProviderRequest(format!("Gemini API error ({status}): {message}"))
    }
}

fn truncate_body(body: &str) -> &str {
    let limit = 500;
    if body.len() <= limit {
        return body;
    }
    let mut end = limit;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

fn parse_state(state: Option<&str>) -> FileState {
    match state {
        Some("ACTIVE") => FileState::Active,
        Some("FAILED") => FileState::Failed,
        Some("PROCESSING") => FileState::Processing,
        _ => FileState::Pending,
    }
}

fn parse_file(file: &serde_json::Value, fallback_mime: &str) -> Result<RemoteFile, LlmError> {
    let name = file["name"]
        .as_str()
        .ok_or_else(|| LlmError::InvalidResponse("uploaded file has no name".into()))?;
    let uri = file["uri"]
        .as_str()
        .ok_or_else(|| LlmError::InvalidResponse("uploaded file has no uri".into()))?;

    Ok(RemoteFile {
        name: name.to_string(),
        uri: uri.to_string(),
        mime_type: file["mimeType"]
            .as_str()
            .unwrap_or(fallback_mime)
            .to_string(),
        state: parse_state(file["state"].as_str()),
    })
}

fn content_part_json(part: &ContentPart) -> serde_json::Value {
    match part {
        ContentPart::Text { text } => serde_json::json!({ "text": text }),
        ContentPart::File { uri, mime_type } => serde_json::json!({
            "fileData": { "mimeType": mime_type, "fileUri": uri }
        }),
    }
}

fn history_entry_json(entry: &HistoryEntry) -> serde_json::Value {
    let role = match entry.role {
        Role::User => "user",
        Role::Assistant => "model",
    };
    serde_json::json!({
        "role": role,
        "parts": entry.parts.iter().map(content_part_json).collect::<Vec<_>>(),
    })
}

fn build_request_body(request: &GenerationRequest) -> serde_json::Value {
    let mut contents: Vec<serde_json::Value> =
        request.history.iter().map(history_entry_json).collect();
    contents.push(serde_json::json!({
        "role": "user",
        "parts": request.parts.iter().map(content_part_json).collect::<Vec<_>>(),
    }));

    let tools: Vec<serde_json::Value> = request
        .tools
        .iter()
        .map(|tool| match tool {
            Tool::GoogleSearch => serde_json::json!({ "googleSearch": {} }),
            Tool::UrlContext => serde_json::json!({ "urlContext": {} }),
            Tool::CodeExecution => serde_json::json!({ "codeExecution": {} }),
        })
        .collect();

    let mut body = serde_json::json!({
        "contents": contents,
        "safetySettings": request.safety,
    });
    if !request.system_instruction.is_empty() {
        body["systemInstruction"] =
            serde_json::json!({ "parts": [{ "text": request.system_instruction }] });
    }
    if !tools.is_empty() {
        body["tools"] = serde_json::json!(tools);
    }
    body
}

/// Parse one SSE `data:` payload into a chunk.
fn parse_event_data(data: &str) -> Result<ResponseChunk, LlmError> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| LlmError::InvalidResponse(format!("stream event is not JSON: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error["message"].as_str().unwrap_or("unknown error");
        let code = error["code"].as_u64().unwrap_or_default();
        let status = error["status"].as_str().unwrap_or_default();
        return Err(if code == 429 || status == "RESOURCE_EXHAUSTED" {
            LlmError::RateLimitExceeded(format!("{code} {status}: {message}"))
        } else {
            LlmError::ProviderRequest(format!("{code} {status}: {message}"))
        });
    }

    let candidate = &value["candidates"][0];
    let mut chunk = ResponseChunk::default();
    let mut text = String::new();

    if let Some(parts) = candidate["content"]["parts"].as_array() {
        for part in parts {
            if let Some(fragment) = part["text"].as_str() {
                text.push_str(fragment);
            }
            if let Some(code) = part.get("executableCode") {
                chunk.executable_code.push(ExecutableCode {
                    language: code["language"].as_str().unwrap_or("python").to_lowercase(),
                    code: code["code"].as_str().unwrap_or_default().to_string(),
                });
            }
            if let Some(result) = part.get("codeExecutionResult") {
                chunk.code_execution_results.push(CodeExecutionResult {
                    outcome: result["outcome"].as_str().unwrap_or_default().to_string(),
                    output: result["output"].as_str().unwrap_or_default().to_string(),
                });
            }
        }
    }

    if !text.is_empty() {
        chunk.text = Some(text);
    }
    chunk.grounding_metadata = candidate.get("groundingMetadata").cloned();
    chunk.url_context_metadata = candidate.get("urlContextMetadata").cloned();

    Ok(chunk)
}
