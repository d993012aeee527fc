//! Transport trait and dynamic dispatch companion.

use crate::error::TransportError;
use crate::{ActorId, ChannelId, RequestId};

use std::path::PathBuf;
use std::pin::Pin;

/// Result alias for transport primitives.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A message that exists on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: u64,
}

/// Rich (embed) rendering of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedContent {
    pub description: String,
    pub color: u32,
    pub footer: Option<String>,
}

/// Buttons attached under a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionButton {
    /// DM a copy of the response to the requester.
    Save,
    /// Delete the response (requester only).
    Delete,
    /// Cancel the generation that is still streaming.
    Stop(RequestId),
}

impl ActionButton {
    pub fn custom_id(&self) -> String {
        match self {
            ActionButton::Save => "relay:save".into(),
            ActionButton::Delete => "relay:delete".into(),
            ActionButton::Stop(request_id) => format!("relay:stop:{request_id}"),
        }
    }

    pub fn parse(custom_id: &str) -> Option<Self> {
        match custom_id {
            "relay:save" => Some(ActionButton::Save),
            "relay:delete" => Some(ActionButton::Delete),
            other => other
                .strip_prefix("relay:stop:")
                .and_then(|id| id.parse().ok())
                .map(ActionButton::Stop),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActionButton::Save => "Save",
            ActionButton::Delete => "Delete",
            ActionButton::Stop(_) => "Stop",
        }
    }
}

/// Content of a message to create or an edit to apply.
///
/// On edit, `None`/empty fields clear what was there before.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub embed: Option<EmbedContent>,
    pub buttons: Vec<ActionButton>,
    /// Message to reply to; ignored on edit.
    pub reply_to: Option<u64>,
    /// Local files to attach.
    pub attachments: Vec<PathBuf>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn replying_to(mut self, message_id: Option<u64>) -> Self {
        self.reply_to = message_id;
        self
    }
}

/// Static trait for chat transports.
/// Use this for type-safe implementations.
pub trait Transport: Send + Sync + 'static {
    fn create_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> impl std::future::Future<Output = TransportResult<MessageRef>> + Send;

    fn edit_message(
        &self,
        target: MessageRef,
        message: OutgoingMessage,
    ) -> impl std::future::Future<Output = TransportResult<()>> + Send;

    fn delete_message(
        &self,
        target: MessageRef,
    ) -> impl std::future::Future<Output = TransportResult<()>> + Send;

    fn send_direct_message(
        &self,
        actor_id: ActorId,
        message: OutgoingMessage,
    ) -> impl std::future::Future<Output = TransportResult<MessageRef>> + Send;

    /// Show the typing indicator once (transports expire it after a few seconds).
    fn start_typing(
        &self,
        channel_id: ChannelId,
    ) -> impl std::future::Future<Output = TransportResult<()>> + Send {
        let _ = channel_id;
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn TransportDyn>`.
pub trait TransportDyn: Send + Sync + 'static {
    fn create_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<MessageRef>>;

    fn edit_message(
        &self,
        target: MessageRef,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<()>>;

    fn delete_message(&self, target: MessageRef) -> BoxFuture<'_, TransportResult<()>>;

    fn send_direct_message(
        &self,
        actor_id: ActorId,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<MessageRef>>;

    fn start_typing(&self, channel_id: ChannelId) -> BoxFuture<'_, TransportResult<()>>;
}

/// Blanket implementation: any type implementing Transport automatically implements TransportDyn.
impl<T: Transport> TransportDyn for T {
    fn create_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<MessageRef>> {
        Box::pin(Transport::create_message(self, channel_id, message))
    }

    fn edit_message(
        &self,
        target: MessageRef,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(Transport::edit_message(self, target, message))
    }

    fn delete_message(&self, target: MessageRef) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(Transport::delete_message(self, target))
    }

    fn send_direct_message(
        &self,
        actor_id: ActorId,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, TransportResult<MessageRef>> {
        Box::pin(Transport::send_direct_message(self, actor_id, message))
    }

    fn start_typing(&self, channel_id: ChannelId) -> BoxFuture<'_, TransportResult<()>> {
        Box::pin(Transport::start_typing(self, channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_ids_parse_back() {
        let request_id = uuid::Uuid::new_v4();
        for button in [
            ActionButton::Save,
            ActionButton::Delete,
            ActionButton::Stop(request_id),
        ] {
            assert_eq!(ActionButton::parse(&button.custom_id()), Some(button));
        }
        assert_eq!(ActionButton::parse("relay:stop:not-a-uuid"), None);
        assert_eq!(ActionButton::parse("other:save"), None);
    }
}
