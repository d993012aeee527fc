//! Discord adapter: the serenity-backed transport and the gateway event handler.

use crate::agent::{ActiveSessions, Enqueued, RequestQueue, StopOutcome};
use crate::error::{QueueError, TransportError};
use crate::messaging::traits::{
    ActionButton, EmbedContent, MessageRef, OutgoingMessage, Transport, TransportDyn,
    TransportResult,
};
use crate::settings::SettingsResolver;
use crate::{ActorId, Attachment, AttachmentSource, ChannelId, Request, RequestOrigin, RequestScope};

use regex::Regex;
use serenity::all::{
    ButtonStyle, ChannelId as DiscordChannelId, ComponentInteraction, Context,
    CreateActionRow, CreateAllowedMentions, CreateAttachment, CreateButton, CreateEmbed,
    CreateEmbedFooter, CreateInteractionResponse, CreateInteractionResponseMessage,
    CreateMessage, EditMessage, EventHandler, Interaction, Message, MessageId, Ready, UserId,
};
use serenity::http::{Http, HttpError};
use serenity::prelude::TypeMapKey;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

static CUSTOM_EMOJI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(a?):(\w+):(\d+)>").expect("hardcoded custom emoji regex")
});

/// Transport over Discord's REST API.
#[derive(Clone)]
pub struct DiscordTransport {
    http: Arc<Http>,
}

impl std::fmt::Debug for DiscordTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordTransport").finish_non_exhaustive()
    }
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }

    async fn files(paths: &[PathBuf]) -> TransportResult<Vec<CreateAttachment>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file = CreateAttachment::path(path).await.map_err(|error| {
                TransportError::Request(format!("failed to attach {}: {error}", path.display()))
            })?;
            files.push(file);
        }
        Ok(files)
    }
}

impl Transport for DiscordTransport {
    async fn create_message(
        &self,
        channel_id: ChannelId,
        message: OutgoingMessage,
    ) -> TransportResult<MessageRef> {
        let channel = DiscordChannelId::new(channel_id);
        let mut builder = CreateMessage::new()
            .allowed_mentions(CreateAllowedMentions::new().replied_user(true))
            .components(action_rows(&message.buttons));

        if let Some(content) = &message.content {
            builder = builder.content(content);
        }
        if let Some(embed) = &message.embed {
            builder = builder.embed(build_embed(embed));
        }
        if let Some(reply_to) = message.reply_to {
            builder = builder.reference_message((channel, MessageId::new(reply_to)));
        }
        for file in Self::files(&message.attachments).await? {
            builder = builder.add_file(file);
        }

        let sent = channel
            .send_message(&*self.http, builder)
            .await
            .map_err(transport_error)?;

        Ok(MessageRef {
            channel_id,
            message_id: sent.id.get(),
        })
    }

    async fn edit_message(&self, target: MessageRef, message: OutgoingMessage) -> TransportResult<()> {
        let mut builder = EditMessage::new()
            .content(message.content.clone().unwrap_or_default())
            .embeds(message.embed.iter().map(build_embed).collect())
            .components(action_rows(&message.buttons));
        for file in Self::files(&message.attachments).await? {
            builder = builder.new_attachment(file);
        }

        DiscordChannelId::new(target.channel_id)
            .edit_message(&*self.http, MessageId::new(target.message_id), builder)
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn delete_message(&self, target: MessageRef) -> TransportResult<()> {
        DiscordChannelId::new(target.channel_id)
            .delete_message(&*self.http, MessageId::new(target.message_id))
            .await
            .map_err(transport_error)
    }

    async fn send_direct_message(
        &self,
        actor_id: ActorId,
        message: OutgoingMessage,
    ) -> TransportResult<MessageRef> {
        let channel = UserId::new(actor_id)
            .create_dm_channel(&*self.http)
            .await
            .map_err(transport_error)?;
        Transport::create_message(self, channel.id.get(), message.replying_to(None)).await
    }

    async fn start_typing(&self, channel_id: ChannelId) -> TransportResult<()> {
        self.http
            .broadcast_typing(DiscordChannelId::new(channel_id))
            .await
            .map_err(transport_error)
    }
}

fn transport_error(error: serenity::Error) -> TransportError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(response)) = &error {
        match response.status_code.as_u16() {
            403 => return TransportError::PermissionDenied(response.error.message.clone()),
            404 => return TransportError::NotFound(response.error.message.clone()),
            _ => {}
        }
    }
    TransportError::Request(error.to_string())
}

fn build_embed(embed: &EmbedContent) -> CreateEmbed {
    let mut builder = CreateEmbed::new()
        .description(&embed.description)
        .color(embed.color);
    if let Some(footer) = &embed.footer {
        builder = builder.footer(CreateEmbedFooter::new(footer));
    }
    builder
}

fn action_rows(buttons: &[ActionButton]) -> Vec<CreateActionRow> {
    if buttons.is_empty() {
        return Vec::new();
    }
    let buttons = buttons
        .iter()
        .map(|button| {
            let style = match button {
                ActionButton::Stop(_) => ButtonStyle::Danger,
                ActionButton::Save => ButtonStyle::Primary,
                ActionButton::Delete => ButtonStyle::Secondary,
            };
            CreateButton::new(button.custom_id())
                .label(button.label())
                .style(style)
        })
        .collect();
    vec![CreateActionRow::Buttons(buttons)]
}

/// Shared state the gateway handler reads from the client's data map.
pub struct RelayState {
    pub queue: Arc<RequestQueue>,
    pub sessions: ActiveSessions,
    pub settings: Arc<SettingsResolver>,
    pub transport: Arc<dyn TransportDyn>,
}

impl TypeMapKey for RelayState {
    type Value = Arc<RelayState>;
}

async fn relay_state(ctx: &Context) -> Option<Arc<RelayState>> {
    let data = ctx.data.read().await;
    data.get::<RelayState>().cloned()
}

/// Gateway event handler.
pub struct Handler;

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(
            user = %ready.user.name,
            guilds = ready.guilds.len(),
            "connected to Discord"
        );
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let Some(state) = relay_state(&ctx).await else {
            tracing::error!("relay state not found in client data");
            return;
        };

        let bot_id = ctx.cache.current_user().id.get();
        let mentioned = msg.mentions.iter().any(|user| user.id.get() == bot_id);
        if msg.guild_id.is_some() && !mentioned {
            return;
        }

        let text = strip_bot_mention(&msg.content, bot_id);
        let mut attachments: Vec<Attachment> = msg
            .attachments
            .iter()
            .map(|attachment| Attachment {
                name: attachment.filename.clone(),
                url: attachment.url.clone(),
                content_type: attachment.content_type.clone(),
                size_bytes: u64::from(attachment.size),
                source: AttachmentSource::File,
            })
            .collect();
        attachments.extend(
            msg.sticker_items
                .iter()
                .filter_map(|sticker| sticker_attachment(&sticker.name, sticker.image_url())),
        );
        attachments.extend(custom_emoji_attachments(&text));

        if text.is_empty() && attachments.is_empty() {
            tracing::debug!(message_id = msg.id.get(), "ignoring empty mention");
            return;
        }

        let actor_id = msg.author.id.get();
        let guild_id = msg.guild_id.map(|id| id.get());
        let request = Request {
            id: uuid::Uuid::new_v4(),
            origin: RequestOrigin::Message {
                message_id: msg.id.get(),
            },
            text,
            attachments,
            scope: RequestScope {
                actor_id,
                channel_id: msg.channel_id.get(),
                guild_id,
            },
            author_name: msg
                .author
                .global_name
                .clone()
                .unwrap_or_else(|| msg.author.name.clone()),
            guild_name: msg
                .guild_id
                .and_then(|id| ctx.cache.guild(id).map(|guild| guild.name.clone())),
            settings: state.settings.resolve(actor_id, guild_id),
        };

        tracing::debug!(
            request_id = %request.id,
            actor_id,
            attachments = request.attachments.len(),
            "request received"
        );

        let outcome = state.queue.enqueue(request).await;
        if let Some(notice) = queue_notice(&outcome) {
            let reply = OutgoingMessage::text(notice).replying_to(Some(msg.id.get()));
            if let Err(error) = state
                .transport
                .create_message(msg.channel_id.get(), reply)
                .await
            {
                tracing::warn!(%error, "failed to send queue notice");
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Component(component) = interaction else {
            return;
        };
        let Some(button) = ActionButton::parse(&component.data.custom_id) else {
            return;
        };
        let Some(state) = relay_state(&ctx).await else {
            tracing::error!("relay state not found in client data");
            return;
        };

        let clicked_by = component.user.id.get();
        let notice = match button {
            ActionButton::Save => save_response(&state, &component).await,
            ActionButton::Delete => delete_response(&state, &component).await,
            ActionButton::Stop(request_id) => {
                stop_notice(state.sessions.stop(request_id, clicked_by).await)
            }
        };

        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(notice)
                .ephemeral(true),
        );
        if let Err(error) = component.create_response(&ctx.http, response).await {
            tracing::warn!(%error, "failed to respond to button press");
        }
    }
}

async fn save_response(state: &RelayState, component: &ComponentInteraction) -> &'static str {
    let source = &component.message;
    let mut copy = match source.embeds.first() {
        Some(embed) => OutgoingMessage {
            embed: Some(EmbedContent {
                description: embed.description.clone().unwrap_or_default(),
                color: embed.colour.map_or(0, |colour| colour.0),
                footer: embed.footer.as_ref().map(|footer| footer.text.clone()),
            }),
            ..Default::default()
        },
        None => OutgoingMessage::text(source.content.clone()),
    };
    if !source.attachments.is_empty() {
        let links = source
            .attachments
            .iter()
            .map(|attachment| attachment.url.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        copy.content = Some(match copy.content.take() {
            Some(content) if !content.is_empty() => format!("{content}\n{links}"),
            _ => links,
        });
    }

    match state
        .transport
        .send_direct_message(component.user.id.get(), copy)
        .await
    {
        Ok(_) => "Saved to your direct messages.",
        Err(error) => {
            tracing::info!(%error, "failed to DM saved response");
            "I couldn't send you a direct message. Check your privacy settings."
        }
    }
}

async fn delete_response(state: &RelayState, component: &ComponentInteraction) -> &'static str {
    let owner = component
        .message
        .referenced_message
        .as_ref()
        .map(|original| original.author.id.get());
    if !may_delete(owner, component.user.id.get(), component.guild_id.is_some()) {
        return "Only the person who asked can delete this response.";
    }

    let target = MessageRef {
        channel_id: component.channel_id.get(),
        message_id: component.message.id.get(),
    };
    match state.transport.delete_message(target).await {
        Ok(()) => "Response deleted.",
        Err(error) => {
            tracing::warn!(%error, "failed to delete response");
            "I couldn't delete that response."
        }
    }
}

/// Outside guilds the only other participant is the requester.
fn may_delete(owner: Option<ActorId>, clicked_by: ActorId, in_guild: bool) -> bool {
    match owner {
        Some(owner) => owner == clicked_by,
        None => !in_guild,
    }
}

fn stop_notice(outcome: StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::Stopped => "Stopping.",
        StopOutcome::NotOwner => "Only the person who asked can stop this response.",
        StopOutcome::NotRunning => "That response has already finished.",
    }
}

fn queue_notice(outcome: &Result<Enqueued, QueueError>) -> Option<String> {
    match outcome {
        Ok(Enqueued::Started) => None,
        Ok(Enqueued::Queued { position }) => Some(format!(
            "Your request is queued (position {position})."
        )),
        Err(QueueError::Full { capacity, .. }) => Some(format!(
            "Your queue is full ({capacity} requests waiting). Try again once one finishes."
        )),
    }
}

fn strip_bot_mention(content: &str, bot_id: u64) -> String {
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

fn sticker_attachment(name: &str, url: Option<String>) -> Option<Attachment> {
    let url = url?;
    let extension = url
        .rsplit('.')
        .next()
        .filter(|extension| !extension.contains('/'))
        .unwrap_or("png")
        .to_string();
    Some(Attachment {
        name: format!("{name}.{extension}"),
        url,
        content_type: None,
        size_bytes: 0,
        source: AttachmentSource::Sticker,
    })
}

fn custom_emoji_attachments(content: &str) -> Vec<Attachment> {
    let mut seen = HashSet::new();
    CUSTOM_EMOJI
        .captures_iter(content)
        .filter(|captures| seen.insert(captures[3].to_string()))
        .map(|captures| {
            let extension = if &captures[1] == "a" { "gif" } else { "png" };
            Attachment {
                name: format!("{}.{extension}", &captures[2]),
                url: format!(
                    "https://cdn.discordapp.com/emojis/{}.{extension}",
                    &captures[3]
                ),
                content_type: None,
                size_bytes: 0,
                source: AttachmentSource::Emoji,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_both_mention_forms() {
        assert_eq!(strip_bot_mention("<@42> hello", 42), "hello");
        assert_eq!(strip_bot_mention("hey <@!42>  ", 42), "hey");
        assert_eq!(strip_bot_mention("<@7> hi", 42), "<@7> hi");
    }

    #[test]
    fn custom_emoji_become_attachments_once() {
        let emoji = custom_emoji_attachments("look <:blob:123> and <a:dance:456> <:blob:123>");

        assert_eq!(emoji.len(), 2);
        assert_eq!(emoji[0].name, "blob.png");
        assert_eq!(emoji[0].url, "https://cdn.discordapp.com/emojis/123.png");
        assert_eq!(emoji[1].name, "dance.gif");
        assert_eq!(emoji[1].source, AttachmentSource::Emoji);
    }

    #[test]
    fn sticker_name_takes_url_extension() {
        let sticker = sticker_attachment(
            "wave",
            Some("https://media.discordapp.net/stickers/99.gif".into()),
        )
        .expect("should build sticker");
        assert_eq!(sticker.name, "wave.gif");
        assert_eq!(sticker.source, AttachmentSource::Sticker);

        assert!(sticker_attachment("lottie", None).is_none());
    }

    #[test]
    fn queue_notices() {
        assert_eq!(queue_notice(&Ok(Enqueued::Started)), None);
        assert_eq!(
            queue_notice(&Ok(Enqueued::Queued { position: 2 })).as_deref(),
            Some("Your request is queued (position 2).")
        );
        let full = queue_notice(&Err(QueueError::Full {
            actor_id: 1,
            capacity: 5,
        }))
        .expect("should notify");
        assert!(full.contains("queue is full"));
    }

    #[test]
    fn only_requester_may_delete() {
        assert!(may_delete(Some(1), 1, true));
        assert!(!may_delete(Some(1), 2, true));
        assert!(!may_delete(None, 2, true));
        assert!(may_delete(None, 2, false));
    }

    #[test]
    fn rows_only_when_buttons_exist() {
        assert!(action_rows(&[]).is_empty());
        assert_eq!(
            action_rows(&[ActionButton::Save, ActionButton::Delete]).len(),
            1
        );
    }
}
