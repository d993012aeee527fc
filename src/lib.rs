//! Relaybot: relays chat requests to a streaming completion provider and
//! streams the answer back to the chat transport.

pub mod agent;
pub mod config;
pub mod conversation;
pub mod error;
pub mod ingest;
pub mod llm;
pub mod messaging;
pub mod prompts;
pub mod settings;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Actor identifier type (the originating user).
pub type ActorId = u64;

/// Channel identifier type.
pub type ChannelId = u64;

/// Guild (server) identifier type.
pub type GuildId = u64;

/// Request identifier type.
pub type RequestId = uuid::Uuid;

/// Where a request came from, so replies can reference it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestOrigin {
    /// A plain chat message the bot was mentioned in (or a DM).
    Message { message_id: u64 },
    /// A slash command or context-menu interaction.
    Interaction { interaction_id: u64 },
}

impl RequestOrigin {
    /// Message to reply to, if the origin is a message.
    pub fn reply_target(&self) -> Option<u64> {
        match self {
            RequestOrigin::Message { message_id } => Some(*message_id),
            RequestOrigin::Interaction { .. } => None,
        }
    }
}

/// Actor/channel/guild ids a request was made in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestScope {
    pub actor_id: ActorId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
}

impl RequestScope {
    /// Conversation key for the configured history scope.
    ///
    /// Guild scope degrades to channel scope in DMs, which have no guild.
    pub fn conversation_id(&self, scope: settings::HistoryScope) -> String {
        match (scope, self.guild_id) {
            (settings::HistoryScope::User, _) => format!("user:{}", self.actor_id),
            (settings::HistoryScope::Guild, Some(guild_id)) => format!("guild:{guild_id}"),
            (settings::HistoryScope::Channel, _) | (settings::HistoryScope::Guild, None) => {
                format!("channel:{}", self.channel_id)
            }
        }
    }
}

/// How an attachment reached the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    File,
    Sticker,
    Emoji,
}

/// Raw inbound attachment metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    /// Content type declared by the transport, if any.
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub source: AttachmentSource,
}

impl Attachment {
    /// Lowercased file extension, derived from the name.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
    }

    /// Declared MIME type, falling back to a guess from the extension.
    pub fn mime_type(&self) -> String {
        match self.content_type.as_deref() {
            Some(declared) if !declared.trim().is_empty() => declared
                .split(';')
                .next()
                .unwrap_or(declared)
                .trim()
                .to_lowercase(),
            _ => mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
        }
    }
}

/// A user request, immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub origin: RequestOrigin,
    pub text: String,
    pub attachments: Vec<Attachment>,
    pub scope: RequestScope,
    /// Display name of the requester, used for contextual prompt info.
    pub author_name: String,
    /// Guild name, if the request came from a guild.
    pub guild_name: Option<String>,
    pub settings: settings::EffectiveSettings,
}

impl Request {
    pub fn actor_id(&self) -> ActorId {
        self.scope.actor_id
    }
}

/// One unit of generation input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    /// Binary media that was uploaded to the provider.
    File { uri: String, mime_type: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, ContentPart::File { .. })
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// One persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl HistoryEntry {
    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            parts,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            parts: vec![ContentPart::text(text)],
        }
    }
}
