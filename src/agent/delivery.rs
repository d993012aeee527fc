//! Streamed reply delivery: word threshold, throttled edits, and the
//! large-response switch to file delivery.

use crate::config::DeliveryConfig;
use crate::error::TransportError;
use crate::messaging::traits::{
    ActionButton, EmbedContent, MessageRef, OutgoingMessage, TransportDyn, TransportResult,
};
use crate::settings::{EffectiveSettings, ResponseFormat};
use crate::{ChannelId, RequestId};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Hard cap on plain message content.
pub const DISCORD_MESSAGE_LIMIT: usize = 2000;

/// Hard cap on embed footers.
const EMBED_FOOTER_LIMIT: usize = 2048;

const LARGE_NOTICE: &str =
    "This response is getting long. It will be sent as a file once it is finished.";

const FILE_NOTICE: &str = "The response was too long to show inline, so it is attached as a file.";

/// Where and for whom a reply is delivered.
#[derive(Debug, Clone, Copy)]
pub struct ReplyTarget {
    pub request_id: RequestId,
    pub channel_id: ChannelId,
    pub reply_to: Option<u64>,
}

/// Visible state of one session's reply.
pub struct StreamedReply {
    transport: Arc<dyn TransportDyn>,
    target: ReplyTarget,
    format: ResponseFormat,
    embed_color: u32,
    action_buttons: bool,
    config: DeliveryConfig,
    temp_dir: PathBuf,
    message: Option<MessageRef>,
    large: bool,
    dirty: bool,
    last_edit: Option<Instant>,
}

impl StreamedReply {
    pub fn new(
        transport: Arc<dyn TransportDyn>,
        target: ReplyTarget,
        settings: &EffectiveSettings,
        config: DeliveryConfig,
        temp_dir: PathBuf,
    ) -> Self {
        Self {
            transport,
            target,
            format: settings.response_format,
            embed_color: settings.embed_color,
            action_buttons: settings.action_buttons,
            config,
            temp_dir,
            message: None,
            large: false,
            dirty: false,
            last_edit: None,
        }
    }

    pub fn inline_limit(&self) -> usize {
        self.format.inline_limit(&self.config)
    }

    /// Once set, the response is delivered as a file. Never reverts.
    pub fn is_large(&self) -> bool {
        self.large
    }

    pub fn message(&self) -> Option<MessageRef> {
        self.message
    }

    /// When the pending edit is due, if one is pending.
    pub fn next_flush_at(&self) -> Option<Instant> {
        if !self.dirty || self.large || self.message.is_none() {
            return None;
        }
        Some(
            self.last_edit
                .map(|at| at + self.config.edit_throttle)
                .unwrap_or_else(Instant::now),
        )
    }

    /// React to the accumulated text after a chunk arrived.
    pub async fn update(&mut self, text: &str) {
        if self.large {
            return;
        }

        if char_len(text) > self.inline_limit() {
            self.switch_to_large().await;
            return;
        }

        if self.message.is_none() {
            if word_count(text) <= self.config.word_threshold {
                return;
            }
            match self
                .transport
                .create_message(self.target.channel_id, self.streaming_message(text))
                .await
            {
                Ok(message) => {
                    tracing::debug!(message_id = message.message_id, "streaming reply started");
                    self.message = Some(message);
                    self.last_edit = Some(Instant::now());
                    self.dirty = false;
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to create streaming reply");
                }
            }
            return;
        }

        self.dirty = true;
        if self
            .next_flush_at()
            .is_some_and(|due| due <= Instant::now())
        {
            self.flush(text).await;
        }
    }

    /// Apply the pending edit.
    pub async fn flush(&mut self, text: &str) {
        if !self.dirty || self.large {
            return;
        }
        let Some(message) = self.message else {
            return;
        };

        self.dirty = false;
        self.last_edit = Some(Instant::now());
        if let Err(error) = self
            .transport
            .edit_message(message, self.streaming_message(text))
            .await
        {
            self.handle_edit_error(error);
        }
    }

    async fn switch_to_large(&mut self) {
        self.large = true;
        self.dirty = false;
        tracing::info!(
            limit = self.inline_limit(),
            "response exceeds inline limit, switching to file delivery"
        );

        let notice = OutgoingMessage {
            content: Some(LARGE_NOTICE.into()),
            buttons: self.stop_button(),
            reply_to: self.target.reply_to,
            ..Default::default()
        };

        match self.message {
            Some(message) => {
                if let Err(error) = self.transport.edit_message(message, notice).await {
                    self.handle_edit_error(error);
                }
            }
            None => match self
                .transport
                .create_message(self.target.channel_id, notice)
                .await
            {
                Ok(message) => self.message = Some(message),
                Err(error) => tracing::warn!(%error, "failed to show large response notice"),
            },
        }
    }

    /// Deliver the complete response, inline or as a file.
    pub async fn finish(mut self, text: &str, footer: Option<String>) -> TransportResult<MessageRef> {
        // The last chunk may have crossed the limit without an update in between.
        if char_len(text) > self.inline_limit() {
            self.large = true;
        }

        let buttons = if self.action_buttons {
            vec![ActionButton::Save, ActionButton::Delete]
        } else {
            Vec::new()
        };

        if self.large {
            let file = self.write_response_file(text).await?;
            let message = OutgoingMessage {
                content: Some(FILE_NOTICE.into()),
                buttons,
                reply_to: self.target.reply_to,
                attachments: vec![file.to_path_buf()],
                ..Default::default()
            };
            let delivered = self.deliver(message).await;
            drop(file);
            return delivered;
        }

        let mut message = self.final_message(text, footer);
        message.buttons = buttons;
        self.deliver(message).await
    }

    /// Report a terminal failure. The only failure notice a session produces.
    pub async fn fail(mut self, notice: &str) -> TransportResult<MessageRef> {
        self.deliver(OutgoingMessage::text(notice).replying_to(self.target.reply_to))
            .await
    }

    /// Post a notice that deletes itself after `lifetime`.
    pub async fn transient_notice(&self, text: &str, lifetime: Duration) {
        let message = OutgoingMessage::text(text).replying_to(self.target.reply_to);
        match self
            .transport
            .create_message(self.target.channel_id, message)
            .await
        {
            Ok(notice) => {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(lifetime).await;
                    if let Err(error) = transport.delete_message(notice).await {
                        tracing::debug!(%error, "failed to delete transient notice");
                    }
                });
            }
            Err(error) => tracing::debug!(%error, "failed to post transient notice"),
        }
    }

    /// Edit the visible message if there is one, otherwise create it.
    async fn deliver(&mut self, message: OutgoingMessage) -> TransportResult<MessageRef> {
        if let Some(existing) = self.message {
            match self.transport.edit_message(existing, message.clone()).await {
                Ok(()) => return Ok(existing),
                Err(TransportError::NotFound(_)) => {
                    tracing::debug!("streaming reply was deleted, sending a new message");
                    self.message = None;
                }
                Err(error) => return Err(error),
            }
        }

        let created = self
            .transport
            .create_message(self.target.channel_id, message)
            .await?;
        self.message = Some(created);
        Ok(created)
    }

    fn handle_edit_error(&mut self, error: TransportError) {
        match error {
            TransportError::NotFound(_) => {
                tracing::debug!("streaming reply was deleted, will resend on completion");
                self.message = None;
            }
            other => tracing::warn!(error = %other, "failed to edit streaming reply"),
        }
    }

    fn stop_button(&self) -> Vec<ActionButton> {
        if self.action_buttons {
            vec![ActionButton::Stop(self.target.request_id)]
        } else {
            Vec::new()
        }
    }

    fn streaming_message(&self, text: &str) -> OutgoingMessage {
        let mut message = self.render(text, None);
        message.buttons = self.stop_button();
        message
    }

    fn final_message(&self, text: &str, footer: Option<String>) -> OutgoingMessage {
        let text = if text.trim().is_empty() {
            "*(empty response)*"
        } else {
            text
        };
        self.render(text, footer)
    }

    fn render(&self, text: &str, footer: Option<String>) -> OutgoingMessage {
        match self.format {
            ResponseFormat::Normal => {
                let content = match footer {
                    Some(footer) if char_len(text) + char_len(&footer) + 2 <= DISCORD_MESSAGE_LIMIT => {
                        format!("{text}\n\n{footer}")
                    }
                    _ => text.to_string(),
                };
                OutgoingMessage {
                    content: Some(content),
                    reply_to: self.target.reply_to,
                    ..Default::default()
                }
            }
            ResponseFormat::Embedded => OutgoingMessage {
                embed: Some(EmbedContent {
                    description: text.to_string(),
                    color: self.embed_color,
                    footer: footer.map(|footer| truncate_chars(&footer, EMBED_FOOTER_LIMIT)),
                }),
                reply_to: self.target.reply_to,
                ..Default::default()
            },
        }
    }

    async fn write_response_file(&self, text: &str) -> TransportResult<tempfile::TempPath> {
        let io_error = |error: std::io::Error| {
            TransportError::Request(format!("failed to write response file: {error}"))
        };

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(io_error)?;
        let path = tempfile::Builder::new()
            .prefix("response-")
            .suffix(".md")
            .tempfile_in(&self.temp_dir)
            .map_err(io_error)?
            .into_temp_path();
        tokio::fs::write(&path, text.as_bytes())
            .await
            .map_err(io_error)?;
        Ok(path)
    }
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Discord limits count characters, not bytes.
fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;

    fn target() -> ReplyTarget {
        ReplyTarget {
            request_id: uuid::Uuid::new_v4(),
            channel_id: 100,
            reply_to: Some(55),
        }
    }

    fn reply(
        transport: &Arc<RecordingTransport>,
        format: ResponseFormat,
        dir: &tempfile::TempDir,
    ) -> StreamedReply {
        let settings = EffectiveSettings {
            response_format: format,
            ..Default::default()
        };
        StreamedReply::new(
            transport.clone(),
            target(),
            &settings,
            DeliveryConfig::default(),
            dir.path().to_path_buf(),
        )
    }

    fn words(count: usize) -> String {
        vec!["word"; count].join(" ")
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_visible_until_word_threshold() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Normal, &dir);

        reply.update(&words(150)).await;
        assert!(transport.events().is_empty());

        reply.update(&words(151)).await;
        let created = transport.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].reply_to, Some(55));
        assert!(matches!(created[0].buttons[..], [ActionButton::Stop(_)]));
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_throttled() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Normal, &dir);
        let throttle = DeliveryConfig::default().edit_throttle;

        reply.update(&words(160)).await;
        for step in 0..20 {
            tokio::time::advance(Duration::from_millis(100)).await;
            let text = words(161 + step);
            reply.update(&text).await;
            if reply.next_flush_at().is_some_and(|due| due <= Instant::now()) {
                reply.flush(&text).await;
            }
        }

        let edits = transport.edits();
        assert!(!edits.is_empty());
        let created_at = match &transport.events()[0] {
            crate::test_support::TransportEvent::Created { at, .. } => *at,
            other => panic!("unexpected first event: {other:?}"),
        };
        let mut previous = created_at;
        for (_, at) in &edits {
            assert!(*at - previous >= throttle, "edits closer than the throttle");
            previous = *at;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_embed_stream_is_delivered_as_file() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Embedded, &dir);

        let mut text = String::new();
        while text.len() < 4200 {
            text.push_str("lorem ipsum dolor sit amet ");
            reply.update(&text).await;
            tokio::time::advance(Duration::from_millis(700)).await;
            reply.flush(&text).await;
            if text.len() > 3900 {
                assert!(reply.is_large());
            }
        }
        assert!(reply.is_large());
        let edits_at_flip = transport.edits().len();

        text.push_str("tail");
        reply.update(&text).await;
        reply.flush(&text).await;
        assert!(reply.is_large(), "large flag never reverts");
        assert_eq!(transport.edits().len(), edits_at_flip, "no edits after flip");

        let message = reply.finish(&text, None).await.expect("delivery");
        let delivered = transport.final_state(message).expect("final message");
        assert!(delivered.embed.is_none());
        assert_eq!(delivered.attachments.len(), 1);
        assert_eq!(delivered.content.as_deref(), Some(FILE_NOTICE));

        let notices = transport
            .events()
            .into_iter()
            .filter(|event| {
                matches!(event,
                    crate::test_support::TransportEvent::Edited { message, .. }
                        if message.content.as_deref() == Some(LARGE_NOTICE))
            })
            .count();
        assert_eq!(notices, 1, "large notice is shown once");
        assert_eq!(std::fs::read_dir(dir.path()).expect("dir").count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn final_burst_over_limit_is_still_a_file() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Normal, &dir);

        reply.update("short start").await;
        let text = "x".repeat(1901);
        let message = reply.finish(&text, None).await.expect("delivery");

        let delivered = transport.final_state(message).expect("final message");
        assert_eq!(delivered.attachments.len(), 1);
        assert_eq!(delivered.content.as_deref(), Some(FILE_NOTICE));
    }

    #[tokio::test(start_paused = true)]
    async fn multibyte_text_is_measured_in_characters() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Normal, &dir);

        // 720 characters, 2160 bytes.
        let text = "日本語 ".repeat(180);
        reply.update(&text).await;
        assert!(!reply.is_large());
        let message = reply.finish(&text, None).await.expect("delivery");

        let delivered = transport.final_state(message).expect("final message");
        assert!(delivered.attachments.is_empty());
        assert_eq!(delivered.content.as_deref(), Some(text.as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn short_response_is_inline_with_buttons_and_footer() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let reply = reply(&transport, ResponseFormat::Normal, &dir);

        let message = reply
            .finish("All done.", Some("-# Sources: <https://a.example>".into()))
            .await
            .expect("delivery");

        let delivered = transport.final_state(message).expect("final message");
        assert_eq!(
            delivered.content.as_deref(),
            Some("All done.\n\n-# Sources: <https://a.example>")
        );
        assert_eq!(delivered.buttons, vec![ActionButton::Save, ActionButton::Delete]);
        assert!(delivered.attachments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_replaces_visible_message() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let mut reply = reply(&transport, ResponseFormat::Normal, &dir);

        reply.update(&words(200)).await;
        let visible = reply.message().expect("message should exist");
        reply.fail("generation failed").await.expect("notice");

        let state = transport.final_state(visible).expect("final state");
        assert_eq!(state.content.as_deref(), Some("generation failed"));
        assert!(state.buttons.is_empty());
        assert_eq!(transport.created().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_notice_deletes_itself() {
        let transport = Arc::new(RecordingTransport::default());
        let dir = tempfile::tempdir().expect("temp dir");
        let reply = reply(&transport, ResponseFormat::Normal, &dir);

        reply
            .transient_notice("switching model", Duration::from_secs(5))
            .await;
        assert!(transport.deleted().is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.deleted().len(), 1);
    }
}
