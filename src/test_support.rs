//! Scripted collaborators for unit tests.

use crate::error::{LlmError, Result, TransportError};
use crate::ingest::{Downloader, MediaConverter, MediaTarget, TextExtractor};
use crate::llm::types::{
    ChunkStream, FileState, GenerationApi, GenerationRequest, RemoteFile, ResponseChunk,
};
use crate::messaging::traits::{MessageRef, OutgoingMessage, Transport, TransportResult};
use crate::settings::EffectiveSettings;
use crate::{
    ActorId, Attachment, ChannelId, Request, RequestOrigin, RequestScope,
};

use futures::StreamExt as _;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// A request from `actor_id` in channel 100, guild 200.
pub fn request(actor_id: ActorId, text: &str) -> Request {
    Request {
        id: uuid::Uuid::new_v4(),
        origin: RequestOrigin::Message { message_id: 9000 },
        text: text.into(),
        attachments: Vec::<Attachment>::new(),
        scope: RequestScope {
            actor_id,
            channel_id: 100,
            guild_id: Some(200),
        },
        author_name: format!("user-{actor_id}"),
        guild_name: None,
        settings: EffectiveSettings::default(),
    }
}

/// One scripted `generate_stream` call.
pub enum Script {
    /// The call itself fails.
    Fail(LlmError),
    /// The stream yields these items, then ends.
    Stream(Vec<std::result::Result<ResponseChunk, LlmError>>),
    /// Each chunk arrives after its delay.
    Paced(Vec<(Duration, ResponseChunk)>),
    /// The chunks arrive, then the stream never ends.
    Hang(Vec<ResponseChunk>),
}

impl Script {
    pub fn text(chunks: &[&str]) -> Self {
        Script::Stream(chunks.iter().map(|c| Ok(ResponseChunk::text(*c))).collect())
    }
}

/// Generation API double with scripted streams and file states.
#[derive(Default)]
pub struct ScriptedApi {
    upload_error: Option<String>,
    uploads: Mutex<Vec<(String, String)>>,
    statuses: Mutex<VecDeque<FileState>>,
    status_calls: AtomicU32,
    scripts: Mutex<VecDeque<Script>>,
    generations: Mutex<Vec<(String, GenerationRequest, Instant)>>,
}

impl ScriptedApi {
    pub fn with_upload_error(mut self, message: &str) -> Self {
        self.upload_error = Some(message.into());
        self
    }

    /// States returned by successive status calls; `Active` once exhausted.
    pub fn with_statuses(self, statuses: &[FileState]) -> Self {
        self.statuses.lock().extend(statuses.iter().copied());
        self
    }

    pub fn with_scripts(self, scripts: Vec<Script>) -> Self {
        self.scripts.lock().extend(scripts);
        self
    }

    /// `(display_name, mime_type)` of every upload.
    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().clone()
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    /// `(model, request, started_at)` of every generation call.
    pub fn generations(&self) -> Vec<(String, GenerationRequest, Instant)> {
        self.generations.lock().clone()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.generations
            .lock()
            .iter()
            .map(|(model, _, _)| model.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl GenerationApi for ScriptedApi {
    async fn upload(
        &self,
        _path: &Path,
        mime_type: &str,
        display_name: &str,
    ) -> std::result::Result<RemoteFile, LlmError> {
        if let Some(message) = &self.upload_error {
            return Err(LlmError::ProviderRequest(message.clone()));
        }
        let mut uploads = self.uploads.lock();
        uploads.push((display_name.to_string(), mime_type.to_string()));
        let index = uploads.len();
        Ok(RemoteFile {
            name: format!("files/{index}"),
            uri: format!("https://files.example/{index}"),
            mime_type: mime_type.to_string(),
            state: FileState::Processing,
        })
    }

    async fn get_status(&self, _name: &str) -> std::result::Result<FileState, LlmError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .pop_front()
            .unwrap_or(FileState::Active))
    }

    async fn generate_stream(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> std::result::Result<ChunkStream, LlmError> {
        self.generations
            .lock()
            .push((model.to_string(), request.clone(), Instant::now()));

        let script = self.scripts.lock().pop_front();
        match script {
            None => Err(LlmError::ProviderRequest("no scripted response".into())),
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Stream(items)) => Ok(Box::pin(futures::stream::iter(items))),
            Some(Script::Paced(items)) => Ok(Box::pin(futures::stream::iter(items).then(
                |(delay, chunk)| async move {
                    tokio::time::sleep(delay).await;
                    Ok(chunk)
                },
            ))),
            Some(Script::Hang(chunks)) => Ok(Box::pin(
                futures::stream::iter(chunks.into_iter().map(Ok))
                    .chain(futures::stream::pending()),
            )),
        }
    }
}

/// Writes a few bytes to the destination.
#[derive(Default)]
pub struct StubDownloader;

#[async_trait::async_trait]
impl Downloader for StubDownloader {
    async fn download(&self, _url: &str, destination: &Path) -> Result<u64> {
        tokio::fs::write(destination, b"attachment bytes").await?;
        Ok(16)
    }
}

/// Records conversions; fails for the configured targets.
#[derive(Default)]
pub struct RecordingConverter {
    failing: Vec<MediaTarget>,
    calls: Mutex<Vec<(PathBuf, PathBuf, MediaTarget)>>,
}

impl RecordingConverter {
    pub fn failing(targets: &[MediaTarget]) -> Self {
        Self {
            failing: targets.to_vec(),
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<(PathBuf, PathBuf, MediaTarget)> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl MediaConverter for RecordingConverter {
    async fn convert(&self, input: &Path, output: &Path, target: MediaTarget) -> Result<()> {
        self.calls
            .lock()
            .push((input.to_path_buf(), output.to_path_buf(), target));
        if self.failing.contains(&target) {
            return Err(anyhow::anyhow!("ffmpeg exited with 1: invalid data").into());
        }
        tokio::fs::write(output, b"converted").await?;
        Ok(())
    }
}

/// Returns fixed text, or fails when none is set.
pub struct StubExtractor {
    text: Option<String>,
}

impl StubExtractor {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.into()),
        }
    }
}

#[async_trait::async_trait]
impl TextExtractor for StubExtractor {
    async fn extract(&self, _source: &Path, _declared_type: &str) -> Result<String> {
        self.text
            .clone()
            .ok_or_else(|| anyhow::anyhow!("extraction failed").into())
    }
}

/// Something the transport was asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Created {
        target: MessageRef,
        message: OutgoingMessage,
        at: Instant,
    },
    Edited {
        target: MessageRef,
        message: OutgoingMessage,
        at: Instant,
    },
    Deleted {
        target: MessageRef,
    },
    Direct {
        actor_id: ActorId,
        message: OutgoingMessage,
    },
    Typing {
        channel_id: ChannelId,
        at: Instant,
    },
}

/// Transport double that records every call.
#[derive(Default)]
pub struct RecordingTransport {
    next_id: AtomicU64,
    events: Mutex<Vec<TransportEvent>>,
    fail_typing: Option<TransportError>,
}

impl RecordingTransport {
    pub fn failing_typing(error: TransportError) -> Self {
        Self {
            fail_typing: Some(error),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().clone()
    }

    pub fn created(&self) -> Vec<OutgoingMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Created { message, .. } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<(OutgoingMessage, Instant)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Edited { message, at, .. } => Some((message, at)),
                _ => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Deleted { target } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn typing_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, TransportEvent::Typing { .. }))
            .count()
    }

    /// Message as last created or edited, keyed by id.
    pub fn final_state(&self, target: MessageRef) -> Option<OutgoingMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Created {
                    target: t, message, ..
                }
                | TransportEvent::Edited {
                    target: t, message, ..
                } if t == target => Some(message),
                _ => None,
            })
            .last()
    }

    fn push(&self, event: TransportEvent) {
        self.events.lock().push(event);
    }
}

impl Transport for RecordingTransport {
    async fn create_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> TransportResult<MessageRef> {
        let target = MessageRef {
            channel_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        };
        self.push(TransportEvent::Created {
            target,
            message,
            at: Instant::now(),
        });
        Ok(target)
    }

    async fn edit_message(&self, target: MessageRef, message: OutgoingMessage) -> TransportResult<()> {
        self.push(TransportEvent::Edited {
            target,
            message,
            at: Instant::now(),
        });
        Ok(())
    }

    async fn delete_message(&self, target: MessageRef) -> TransportResult<()> {
        self.push(TransportEvent::Deleted { target });
        Ok(())
    }

    async fn send_direct_message(
        &self,
        actor_id: ActorId,
        message: OutgoingMessage,
    ) -> TransportResult<MessageRef> {
        self.push(TransportEvent::Direct { actor_id, message });
        Ok(MessageRef {
            channel_id: actor_id,
            message_id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn start_typing(&self, channel_id: ChannelId) -> TransportResult<()> {
        if let Some(error) = &self.fail_typing {
            return Err(error.clone());
        }
        self.push(TransportEvent::Typing {
            channel_id,
            at: Instant::now(),
        });
        Ok(())
    }
}
