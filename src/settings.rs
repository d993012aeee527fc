//! Effective per-request settings.
//!
//! Settings are edited elsewhere (slash commands, settings UI). The pipeline
//! only needs an immutable snapshot per request, resolved from the configured
//! defaults plus guild and user overrides.

use crate::{ActorId, GuildId};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How responses are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Normal,
    Embedded,
}

impl ResponseFormat {
    /// Inline length limit before a response is delivered as a file.
    pub fn inline_limit(self, delivery: &crate::config::DeliveryConfig) -> usize {
        match self {
            ResponseFormat::Normal => delivery.plain_limit,
            ResponseFormat::Embedded => delivery.embed_limit,
        }
    }
}

/// Grouping of conversation history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryScope {
    #[default]
    User,
    Channel,
    Guild,
}

/// Settings snapshot attached to a request when it is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectiveSettings {
    pub response_format: ResponseFormat,
    pub history_scope: HistoryScope,
    /// Extra personality instructions appended to the system prompt.
    pub personality: Option<String>,
    /// Attach Save/Delete buttons to finished responses.
    pub action_buttons: bool,
    pub embed_color: u32,
}

impl Default for EffectiveSettings {
    fn default() -> Self {
        Self {
            response_format: ResponseFormat::Normal,
            history_scope: HistoryScope::User,
            personality: None,
            action_buttons: true,
            embed_color: 0x5865F2,
        }
    }
}

/// Partial settings; unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverride {
    pub response_format: Option<ResponseFormat>,
    pub history_scope: Option<HistoryScope>,
    pub personality: Option<String>,
    pub action_buttons: Option<bool>,
    pub embed_color: Option<u32>,
    /// Guild only: guild values win over the member's own settings.
    pub override_user: bool,
}

impl SettingsOverride {
    fn apply(&self, settings: &mut EffectiveSettings) {
        if let Some(format) = self.response_format {
            settings.response_format = format;
        }
        if let Some(scope) = self.history_scope {
            settings.history_scope = scope;
        }
        if let Some(personality) = &self.personality {
            settings.personality = Some(personality.clone());
        }
        if let Some(buttons) = self.action_buttons {
            settings.action_buttons = buttons;
        }
        if let Some(color) = self.embed_color {
            settings.embed_color = color;
        }
    }
}

/// Override tables, swapped atomically when settings change.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub users: HashMap<ActorId, SettingsOverride>,
    pub guilds: HashMap<GuildId, SettingsOverride>,
}

/// Resolves the effective settings for a request.
#[derive(Debug)]
pub struct SettingsResolver {
    defaults: EffectiveSettings,
    overrides: ArcSwap<SettingsOverrides>,
}

impl SettingsResolver {
    pub fn new(defaults: EffectiveSettings, overrides: SettingsOverrides) -> Self {
        Self {
            defaults,
            overrides: ArcSwap::from_pointee(overrides),
        }
    }

    /// Replace the override tables. Requests already enqueued keep their snapshot.
    pub fn replace(&self, overrides: SettingsOverrides) {
        self.overrides.store(Arc::new(overrides));
    }

    pub fn resolve(&self, actor_id: ActorId, guild_id: Option<GuildId>) -> EffectiveSettings {
        let overrides = self.overrides.load();
        let mut settings = self.defaults.clone();

        let user = overrides.users.get(&actor_id);
        let guild = guild_id.and_then(|id| overrides.guilds.get(&id));

        match guild {
            Some(guild) if guild.override_user => {
                if let Some(user) = user {
                    user.apply(&mut settings);
                }
                guild.apply(&mut settings);
            }
            Some(guild) => {
                guild.apply(&mut settings);
                if let Some(user) = user {
                    user.apply(&mut settings);
                }
            }
            None => {
                if let Some(user) = user {
                    user.apply(&mut settings);
                }
            }
        }

        settings
    }
}
