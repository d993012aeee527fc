//! Attachment ingestion: classify, convert or extract, upload, and wait for
//! provider-side processing.
//!
//! Output is always a flat list of content parts. Conversion and extraction
//! failures degrade to a text marker; only direct uploads propagate errors,
//! since there is nothing meaningful to fall back to.

pub mod classify;
pub mod convert;
pub mod extract;
pub mod upload;

pub use classify::{AttachmentKind, ConversionPlan, MediaTarget, classify};
pub use convert::{FfmpegConverter, MediaConverter};
pub use extract::{DocumentExtractor, TextExtractor};
pub use upload::{PollOutcome, PollPolicy, UploadedFile};

use crate::config::LimitsConfig;
use crate::error::{AttachmentError, Result};
use crate::llm::GenerationApi;
use crate::{Attachment, ContentPart};

use anyhow::Context as _;
use futures::StreamExt as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt as _;

/// Fetches attachment bytes to a local path.
#[async_trait::async_trait]
pub trait Downloader: Send + Sync + 'static {
    /// Download `url` into `destination`, returning the byte count.
    async fn download(&self, url: &str, destination: &Path) -> Result<u64>;
}

/// Plain HTTP GET downloader, streamed to disk.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    http: reqwest::Client,
    max_bytes: u64,
}

impl HttpDownloader {
    /// Downloads abort once the body exceeds `max_bytes`.
    pub fn new(http: reqwest::Client, max_bytes: u64) -> Self {
        Self { http, max_bytes }
    }
}

#[async_trait::async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, destination: &Path) -> Result<u64> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("download of {url} was rejected"))?;

        if let Some(length) = response
            .content_length()
            .filter(|length| *length > self.max_bytes)
        {
            return Err(anyhow::anyhow!(
                "attachment is {length} bytes, the limit is {}",
                self.max_bytes
            )
            .into());
        }

        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("failed to create {}", destination.display()))?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("failed to read attachment body")?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(anyhow::anyhow!(
                    "attachment exceeds the {} byte limit",
                    self.max_bytes
                )
                .into());
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", destination.display()))?;
        }
        file.flush()
            .await
            .with_context(|| format!("failed to write {}", destination.display()))?;

        Ok(written)
    }
}

/// Resolves raw attachments into content parts.
pub struct AttachmentIngestor {
    api: Arc<dyn GenerationApi>,
    downloader: Arc<dyn Downloader>,
    converter: Arc<dyn MediaConverter>,
    extractor: Arc<dyn TextExtractor>,
    temp_dir: PathBuf,
    poll: PollPolicy,
    max_bytes: u64,
}

impl std::fmt::Debug for AttachmentIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentIngestor")
            .field("temp_dir", &self.temp_dir)
            .field("poll", &self.poll)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl AttachmentIngestor {
    pub fn new(
        api: Arc<dyn GenerationApi>,
        downloader: Arc<dyn Downloader>,
        converter: Arc<dyn MediaConverter>,
        extractor: Arc<dyn TextExtractor>,
        temp_dir: PathBuf,
        poll: PollPolicy,
    ) -> Self {
        Self {
            api,
            downloader,
            converter,
            extractor,
            temp_dir,
            poll,
            max_bytes: LimitsConfig::default().max_attachment_bytes,
        }
    }

    /// Attachments declared larger than `max_bytes` are skipped with a marker.
    pub fn with_size_limit(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Ingest every attachment in order.
    ///
    /// Returns an error only when a direct upload fails.
    pub async fn ingest_all(
        &self,
        attachments: &[Attachment],
    ) -> std::result::Result<Vec<ContentPart>, AttachmentError> {
        let mut parts = Vec::new();
        for attachment in attachments {
            parts.extend(self.ingest(attachment).await?);
        }
        Ok(parts)
    }

    /// Ingest one attachment.
    #[tracing::instrument(skip(self, attachment), fields(attachment = %attachment.name))]
    pub async fn ingest(
        &self,
        attachment: &Attachment,
    ) -> std::result::Result<Vec<ContentPart>, AttachmentError> {
        if attachment.size_bytes > self.max_bytes {
            tracing::info!(
                size_bytes = attachment.size_bytes,
                max_bytes = self.max_bytes,
                "skipping oversized attachment"
            );
            return Ok(vec![too_large_marker(attachment, self.max_bytes)]);
        }

        let kind = classify(attachment);
        tracing::debug!(?kind, mime = %attachment.mime_type(), "classified attachment");

        match kind {
            AttachmentKind::Unsupported => {
                tracing::info!("rejecting unsupported attachment");
                Ok(vec![unsupported_marker(attachment)])
            }
            AttachmentKind::DirectUpload => self.upload_direct(attachment).await,
            AttachmentKind::ConvertibleMedia(plan) => {
                match self.convert_and_upload(attachment, plan).await {
                    Ok(parts) => Ok(parts),
                    Err(error) => {
                        tracing::warn!(%error, "media conversion failed, sending marker");
                        Ok(vec![failure_marker(attachment, &error)])
                    }
                }
            }
            AttachmentKind::TextExtractable => match self.extract_and_upload(attachment).await {
                Ok(parts) => Ok(parts),
                Err(error) => {
                    tracing::warn!(%error, "text extraction failed, sending marker");
                    Ok(vec![failure_marker(attachment, &error)])
                }
            },
            AttachmentKind::Unknown => {
                tracing::warn!(mime = %attachment.mime_type(), "unrecognised attachment type");
                Ok(vec![unknown_marker(attachment)])
            }
        }
    }

    async fn upload_direct(
        &self,
        attachment: &Attachment,
    ) -> std::result::Result<Vec<ContentPart>, AttachmentError> {
        let local = self.download(attachment).await?;
        let mime_type = attachment.mime_type();
        let file = self.upload_and_wait(attachment, &local, &mime_type).await?;

        Ok(vec![
            ContentPart::text(format!("[Attachment: {} ({mime_type})]", attachment.name)),
            file,
        ])
    }

    async fn convert_and_upload(
        &self,
        attachment: &Attachment,
        plan: ConversionPlan,
    ) -> std::result::Result<Vec<ContentPart>, AttachmentError> {
        let source = self.download(attachment).await?;

        let (converted, target) = match plan {
            ConversionPlan::Convert(target) => {
                (self.convert(attachment, &source, target).await?, target)
            }
            ConversionPlan::Animated => {
                match self.convert(attachment, &source, MediaTarget::Mp4).await {
                    Ok(converted) => (converted, MediaTarget::Mp4),
                    Err(error) => {
                        tracing::warn!(%error, "animated transcode failed, using still frame");
                        let still = self
                            .convert(attachment, &source, MediaTarget::StillFrame)
                            .await?;
                        (still, MediaTarget::StillFrame)
                    }
                }
            }
        };
        // Source is no longer needed once conversion succeeded.
        drop(source);

        let file = self
            .upload_and_wait(attachment, &converted, target.mime_type())
            .await?;

        Ok(vec![
            ContentPart::text(format!(
                "[Attachment: {} ({}), converted to {}]",
                attachment.name,
                attachment.mime_type(),
                target.mime_type()
            )),
            file,
        ])
    }

    async fn extract_and_upload(
        &self,
        attachment: &Attachment,
    ) -> std::result::Result<Vec<ContentPart>, AttachmentError> {
        let source = self.download(attachment).await?;
        let mime_type = attachment.mime_type();

        let text = self
            .extractor
            .extract(&source, &mime_type)
            .await
            .map_err(|error| processing_failed(attachment, error))?;
        drop(source);

        let extracted = self.temp_path(attachment, "txt")?;
        tokio::fs::write(&extracted, text.as_bytes())
            .await
            .map_err(|error| processing_failed(attachment, error))?;

        let file = self
            .upload_and_wait(attachment, &extracted, "text/plain")
            .await?;

        Ok(vec![
            ContentPart::text(format!(
                "[Attachment: {} ({mime_type}), extracted as text/plain]",
                attachment.name
            )),
            file,
        ])
    }

    /// Download into a temp file that is removed when dropped.
    async fn download(
        &self,
        attachment: &Attachment,
    ) -> std::result::Result<TempPath, AttachmentError> {
        let extension = attachment.extension().unwrap_or_else(|| "bin".into());
        let path = self.temp_path(attachment, &extension)?;

        let bytes = self
            .downloader
            .download(&attachment.url, &path)
            .await
            .map_err(|error| AttachmentError::Download {
                name: attachment.name.clone(),
                reason: error.to_string(),
            })?;

        tracing::debug!(bytes, path = %path.display(), "attachment downloaded");
        Ok(path)
    }

    async fn convert(
        &self,
        attachment: &Attachment,
        source: &Path,
        target: MediaTarget,
    ) -> std::result::Result<TempPath, AttachmentError> {
        let output = self.temp_path(attachment, target.extension())?;
        self.converter
            .convert(source, &output, target)
            .await
            .map_err(|error| processing_failed(attachment, error))?;
        Ok(output)
    }

    /// Upload a local file and wait for it to become usable.
    async fn upload_and_wait(
        &self,
        attachment: &Attachment,
        path: &Path,
        mime_type: &str,
    ) -> std::result::Result<ContentPart, AttachmentError> {
        let remote = self
            .api
            .upload(path, mime_type, &attachment.name)
            .await
            .map_err(|error| AttachmentError::Upload {
                name: attachment.name.clone(),
                reason: error.to_string(),
            })?;

        let mut file = UploadedFile::new(remote);
        let name = file.remote.name.clone();
        let api = &self.api;

        match file.poll_until_ready(self.poll, || api.get_status(&name)).await {
            PollOutcome::Active => {
                tracing::debug!(
                    file = %name,
                    polls = file.poll_attempts(),
                    "uploaded file is active"
                );
                Ok(ContentPart::File {
                    uri: file.remote.uri,
                    mime_type: mime_type.to_string(),
                })
            }
            PollOutcome::Failed => Err(AttachmentError::RemoteProcessingFailed {
                name: attachment.name.clone(),
            }),
            PollOutcome::TimedOut { attempts } => Err(AttachmentError::RemoteProcessingTimeout {
                name: attachment.name.clone(),
                attempts,
            }),
        }
    }

    fn temp_path(
        &self,
        attachment: &Attachment,
        extension: &str,
    ) -> std::result::Result<TempPath, AttachmentError> {
        std::fs::create_dir_all(&self.temp_dir)
            .and_then(|()| {
                tempfile::Builder::new()
                    .prefix("relay-")
                    .suffix(&format!(".{extension}"))
                    .tempfile_in(&self.temp_dir)
            })
            .map(tempfile::NamedTempFile::into_temp_path)
            .map_err(|error| processing_failed(attachment, error))
    }
}

fn processing_failed(attachment: &Attachment, error: impl std::fmt::Display) -> AttachmentError {
    AttachmentError::ProcessingFailed {
        name: attachment.name.clone(),
        reason: error.to_string(),
    }
}

fn unsupported_marker(attachment: &Attachment) -> ContentPart {
    let kind = attachment
        .extension()
        .map(|ext| format!(".{ext} files"))
        .unwrap_or_else(|| "files of this type".into());
    ContentPart::text(format!(
        "[Attachment \"{}\" was not included: {kind} are not supported]",
        attachment.name
    ))
}

fn too_large_marker(attachment: &Attachment, max_bytes: u64) -> ContentPart {
    ContentPart::text(format!(
        "[Attachment \"{}\" was not included: it is larger than {} MB]",
        attachment.name,
        max_bytes / (1024 * 1024)
    ))
}

fn failure_marker(attachment: &Attachment, error: &AttachmentError) -> ContentPart {
    ContentPart::text(format!(
        "[Attachment \"{}\" could not be processed: {error}]",
        attachment.name
    ))
}

fn unknown_marker(attachment: &Attachment) -> ContentPart {
    ContentPart::text(format!(
        "[Attachment \"{}\" has an unrecognised type ({}) and was not included]",
        attachment.name,
        attachment.mime_type()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttachmentSource;
    use crate::llm::FileState;
    use crate::test_support::{RecordingConverter, ScriptedApi, StubDownloader, StubExtractor};
    use std::time::Duration;

    struct Harness {
        ingestor: AttachmentIngestor,
        api: Arc<ScriptedApi>,
        converter: Arc<RecordingConverter>,
        dir: tempfile::TempDir,
    }

    fn harness(api: ScriptedApi, converter: RecordingConverter) -> Harness {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let api = Arc::new(api);
        let converter = Arc::new(converter);
        let ingestor = AttachmentIngestor::new(
            api.clone(),
            Arc::new(StubDownloader::default()),
            converter.clone(),
            Arc::new(StubExtractor::text("extracted body")),
            dir.path().join("tmp"),
            PollPolicy {
                interval: Duration::from_secs(10),
                max_attempts: 60,
            },
        );
        Harness {
            ingestor,
            api,
            converter,
            dir,
        }
    }

    fn attachment(name: &str, content_type: &str) -> Attachment {
        Attachment {
            name: name.into(),
            url: format!("https://cdn.example/{name}"),
            content_type: Some(content_type.into()),
            size_bytes: 2048,
            source: AttachmentSource::File,
        }
    }

    fn temp_files(harness: &Harness) -> Vec<PathBuf> {
        std::fs::read_dir(harness.dir.path().join("tmp"))
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_attachment_is_never_downloaded() {
        let mut harness = harness(ScriptedApi::default(), RecordingConverter::default());
        harness.ingestor = harness.ingestor.with_size_limit(1024);

        let parts = harness
            .ingestor
            .ingest(&attachment("photo.png", "image/png"))
            .await
            .expect("oversized attachments degrade to a marker");

        assert_eq!(parts.len(), 1);
        let ContentPart::Text { text } = &parts[0] else {
            panic!("oversized attachment should become a text marker");
        };
        assert!(text.contains("photo.png") && text.contains("larger than"), "{text}");
        assert!(harness.api.uploads().is_empty());
        assert!(temp_files(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn gif_is_transcoded_to_mp4_and_temp_files_removed() {
        let harness = harness(ScriptedApi::default(), RecordingConverter::default());

        let parts = harness
            .ingestor
            .ingest(&attachment("clip.gif", "image/gif"))
            .await
            .expect("conversion path never propagates");

        assert_eq!(parts.len(), 2);
        let ContentPart::Text { text } = &parts[0] else {
            panic!("first part should be descriptive text");
        };
        assert!(text.contains("video/mp4"), "{text}");
        assert!(matches!(&parts[1], ContentPart::File { mime_type, .. } if mime_type == "video/mp4"));

        let calls = harness.converter.calls();
        assert_eq!(calls.len(), 1);
        let (input, output, target) = &calls[0];
        assert_eq!(*target, MediaTarget::Mp4);
        assert_eq!(input.extension().and_then(|e| e.to_str()), Some("gif"));
        assert_eq!(output.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert!(!input.exists(), "original gif should be deleted");
        assert!(!output.exists(), "intermediate mp4 should be deleted");
        assert!(temp_files(&harness).is_empty());

        assert_eq!(harness.api.uploads()[0].1, "video/mp4");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_animated_transcode_falls_back_to_still_frame() {
        let harness = harness(
            ScriptedApi::default(),
            RecordingConverter::failing(&[MediaTarget::Mp4]),
        );

        let parts = harness
            .ingestor
            .ingest(&attachment("dance.gif", "image/gif"))
            .await
            .expect("conversion path never propagates");

        assert!(matches!(&parts[1], ContentPart::File { mime_type, .. } if mime_type == "image/png"));
        let targets: Vec<_> = harness.converter.calls().into_iter().map(|c| c.2).collect();
        assert_eq!(targets, vec![MediaTarget::Mp4, MediaTarget::StillFrame]);
        assert!(temp_files(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn conversion_failure_degrades_to_marker() {
        let harness = harness(
            ScriptedApi::default(),
            RecordingConverter::failing(&[MediaTarget::Mp3]),
        );

        let parts = harness
            .ingestor
            .ingest(&attachment("old.wma", "audio/x-ms-wma"))
            .await
            .expect("conversion path never propagates");

        assert_eq!(parts.len(), 1);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text.contains("could not be processed")));
        assert!(harness.api.uploads().is_empty());
        assert!(temp_files(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn direct_upload_failure_propagates() {
        let harness = harness(
            ScriptedApi::default().with_upload_error("quota exceeded"),
            RecordingConverter::default(),
        );

        let error = harness
            .ingestor
            .ingest_all(&[attachment("photo.png", "image/png")])
            .await
            .expect_err("direct upload errors must propagate");

        assert!(matches!(error, AttachmentError::Upload { .. }));
        assert!(temp_files(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn video_polls_until_active() {
        let api = ScriptedApi::default().with_statuses(&[
            FileState::Processing,
            FileState::Processing,
            FileState::Active,
        ]);
        let harness = harness(api, RecordingConverter::default());

        let started = tokio::time::Instant::now();
        let parts = harness
            .ingestor
            .ingest(&attachment("clip.mp4", "video/mp4"))
            .await
            .expect("upload should succeed");

        assert_eq!(parts.len(), 2);
        assert_eq!(harness.api.status_calls(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_on_direct_upload_propagates() {
        let api = ScriptedApi::default().with_statuses(&[FileState::Failed]);
        let harness = harness(api, RecordingConverter::default());

        let error = harness
            .ingestor
            .ingest(&attachment("voice.mp3", "audio/mpeg"))
            .await
            .expect_err("failed processing must propagate");

        assert!(matches!(error, AttachmentError::RemoteProcessingFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn documents_are_extracted_and_uploaded_as_text() {
        let harness = harness(ScriptedApi::default(), RecordingConverter::default());

        let parts = harness
            .ingestor
            .ingest(&attachment(
                "report.docx",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ))
            .await
            .expect("extraction should succeed");

        assert!(matches!(&parts[1], ContentPart::File { mime_type, .. } if mime_type == "text/plain"));
        assert_eq!(harness.api.uploads()[0].1, "text/plain");
        assert_eq!(harness.api.status_calls(), 0);
        assert!(temp_files(&harness).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unsupported_and_unknown_become_markers_in_order() {
        let harness = harness(ScriptedApi::default(), RecordingConverter::default());

        let parts = harness
            .ingestor
            .ingest_all(&[
                attachment("backup.zip", "application/zip"),
                attachment("scene.blend", "application/octet-stream"),
            ])
            .await
            .expect("markers never fail");

        assert_eq!(parts.len(), 2);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text.contains(".zip files are not supported")));
        assert!(matches!(&parts[1], ContentPart::Text { text } if text.contains("unrecognised type")));
        assert!(harness.api.uploads().is_empty());
    }
}
