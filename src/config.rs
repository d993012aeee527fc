//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::settings::{EffectiveSettings, SettingsOverride, SettingsOverrides};

use anyhow::Context as _;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on the number of models in the fallback chain.
pub const MAX_FALLBACK_CHAIN: usize = 4;

/// Default fallback chain, strongest model first.
pub const DEFAULT_MODEL_CHAIN: &[&str] = &[
    "gemini-2.5-pro",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
    "gemini-2.0-flash",
];

/// Relaybot configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory path (history database, temp files).
    pub data_dir: PathBuf,

    /// Optional directory for rotated log files.
    pub log_dir: Option<PathBuf>,

    pub discord: DiscordConfig,
    pub gemini: GeminiConfig,
    pub limits: LimitsConfig,
    pub delivery: DeliveryConfig,

    /// Settings applied when no override exists.
    pub defaults: EffectiveSettings,

    /// Per-user and per-guild overrides.
    pub overrides: SettingsOverrides,
}

/// Discord connection settings.
#[derive(Debug, Clone, Default)]
pub struct DiscordConfig {
    pub token: String,
}

/// Generation provider settings.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Ordered fallback chain.
    pub models: Vec<String>,
    /// Threshold applied to every harm category.
    pub safety_threshold: String,
}

/// Hard resource bounds of the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsConfig {
    pub queue_depth: usize,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub retries_per_model: u32,
    pub rate_limit_backoff: Duration,
    pub retry_delay: Duration,
    pub typing_timeout: Duration,
    /// Attachments larger than this are never downloaded.
    pub max_attachment_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            poll_interval: Duration::from_secs(10),
            max_poll_attempts: 60,
            retries_per_model: 3,
            rate_limit_backoff: Duration::from_secs(3),
            retry_delay: Duration::from_secs(1),
            typing_timeout: Duration::from_secs(120),
            max_attachment_bytes: 100 * 1024 * 1024,
        }
    }
}

/// Streaming delivery tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Words required before the first visible message is created.
    pub word_threshold: usize,
    /// Minimum spacing between message edits.
    pub edit_throttle: Duration,
    pub plain_limit: usize,
    pub embed_limit: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            word_threshold: 150,
            edit_throttle: Duration::from_millis(650),
            plain_limit: 1900,
            embed_limit: 3900,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlConfig {
    data_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    discord: TomlDiscord,
    gemini: TomlGemini,
    limits: TomlLimits,
    delivery: TomlDelivery,
    defaults: EffectiveSettings,
    users: HashMap<String, SettingsOverride>,
    guilds: HashMap<String, SettingsOverride>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlDiscord {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlGemini {
    api_key: Option<String>,
    base_url: Option<String>,
    models: Option<Vec<String>>,
    safety_threshold: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlLimits {
    queue_depth: Option<usize>,
    poll_interval_secs: Option<u64>,
    max_poll_attempts: Option<u32>,
    retries_per_model: Option<u32>,
    rate_limit_backoff_ms: Option<u64>,
    retry_delay_ms: Option<u64>,
    typing_timeout_secs: Option<u64>,
    max_attachment_mb: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct TomlDelivery {
    word_threshold: Option<usize>,
    edit_throttle_ms: Option<u64>,
    plain_limit: Option<usize>,
    embed_limit: Option<usize>,
}

impl Config {
    /// Load configuration from an optional TOML file plus environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let raw = match path {
            Some(path) => std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
                path: path.display().to_string(),
                source: Arc::new(error),
            })?,
            None => String::new(),
        };

        let mut config = Self::from_toml(&raw)?;

        if let Ok(token) = std::env::var("DISCORD_TOKEN") {
            config.discord.token = token;
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            config.gemini.api_key = key;
        }

        config.validate()?;

        std::fs::create_dir_all(&config.data_dir).with_context(|| {
            format!(
                "failed to create data directory: {}",
                config.data_dir.display()
            )
        })?;

        Ok(config)
    }

    /// Parse a TOML document without touching the environment or filesystem.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let parsed: TomlConfig =
            toml::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;

        let data_dir = parsed.data_dir.unwrap_or_else(|| {
            dirs::data_dir()
                .map(|dir| dir.join("relaybot"))
                .unwrap_or_else(|| PathBuf::from("./data"))
        });

        let mut models = parsed
            .gemini
            .models
            .unwrap_or_else(|| DEFAULT_MODEL_CHAIN.iter().map(|m| m.to_string()).collect());
        if models.len() > MAX_FALLBACK_CHAIN {
            tracing::warn!(
                configured = models.len(),
                max = MAX_FALLBACK_CHAIN,
                "model chain too long, truncating"
            );
            models.truncate(MAX_FALLBACK_CHAIN);
        }

        let limit_defaults = LimitsConfig::default();
        let limits = LimitsConfig {
            queue_depth: parsed.limits.queue_depth.unwrap_or(limit_defaults.queue_depth),
            poll_interval: parsed
                .limits
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(limit_defaults.poll_interval),
            max_poll_attempts: parsed
                .limits
                .max_poll_attempts
                .unwrap_or(limit_defaults.max_poll_attempts),
            retries_per_model: parsed
                .limits
                .retries_per_model
                .unwrap_or(limit_defaults.retries_per_model),
            rate_limit_backoff: parsed
                .limits
                .rate_limit_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(limit_defaults.rate_limit_backoff),
            retry_delay: parsed
                .limits
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(limit_defaults.retry_delay),
            typing_timeout: parsed
                .limits
                .typing_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(limit_defaults.typing_timeout),
            max_attachment_bytes: parsed
                .limits
                .max_attachment_mb
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(limit_defaults.max_attachment_bytes),
        };

        let delivery_defaults = DeliveryConfig::default();
        let delivery = DeliveryConfig {
            word_threshold: parsed
                .delivery
                .word_threshold
                .unwrap_or(delivery_defaults.word_threshold),
            // Discord edit rate limits: keep edits inside the 500-800ms band.
            edit_throttle: Duration::from_millis(
                parsed
                    .delivery
                    .edit_throttle_ms
                    .unwrap_or(delivery_defaults.edit_throttle.as_millis() as u64)
                    .clamp(500, 800),
            ),
            plain_limit: parsed
                .delivery
                .plain_limit
                .unwrap_or(delivery_defaults.plain_limit),
            embed_limit: parsed
                .delivery
                .embed_limit
                .unwrap_or(delivery_defaults.embed_limit),
        };

        let overrides = SettingsOverrides {
            users: parse_id_map(parsed.users, "users")?,
            guilds: parse_id_map(parsed.guilds, "guilds")?,
        };

        Ok(Self {
            data_dir,
            log_dir: parsed.log_dir,
            discord: DiscordConfig {
                token: parsed.discord.token.unwrap_or_default(),
            },
            gemini: GeminiConfig {
                api_key: parsed.gemini.api_key.unwrap_or_default(),
                base_url: parsed
                    .gemini
                    .base_url
                    .unwrap_or_else(|| crate::llm::gemini::DEFAULT_BASE_URL.into()),
                models,
                safety_threshold: parsed
                    .gemini
                    .safety_threshold
                    .unwrap_or_else(|| "BLOCK_NONE".into()),
            },
            limits,
            delivery,
            defaults: parsed.defaults,
            overrides,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.discord.token.trim().is_empty() {
            return Err(ConfigError::MissingKey("discord.token (or DISCORD_TOKEN)".into()).into());
        }
        if self.gemini.api_key.trim().is_empty() {
            return Err(
                ConfigError::MissingKey("gemini.api_key (or GEMINI_API_KEY)".into()).into(),
            );
        }
        if self.gemini.models.is_empty() {
            return Err(ConfigError::Invalid("gemini.models must not be empty".into()).into());
        }
        if self.limits.queue_depth == 0 {
            return Err(ConfigError::Invalid("limits.queue_depth must be at least 1".into()).into());
        }
        if self.limits.retries_per_model == 0 {
            return Err(
                ConfigError::Invalid("limits.retries_per_model must be at least 1".into()).into(),
            );
        }
        Ok(())
    }

    /// Get the history database path.
    pub fn history_db_path(&self) -> PathBuf {
        self.data_dir.join("history.redb")
    }

    /// Get the scratch directory for attachment processing.
    pub fn temp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }
}

fn parse_id_map(
    raw: HashMap<String, SettingsOverride>,
    section: &str,
) -> Result<HashMap<u64, SettingsOverride>> {
    raw.into_iter()
        .map(|(id, value)| {
            id.parse::<u64>()
                .map(|id| (id, value))
                .map_err(|_| {
                    crate::Error::from(ConfigError::Invalid(format!(
                        "{section}.{id} is not a numeric id"
                    )))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{HistoryScope, ResponseFormat};

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_toml("").expect("empty config should parse");

        assert_eq!(config.limits, LimitsConfig::default());
        assert_eq!(config.delivery, DeliveryConfig::default());
        assert_eq!(config.gemini.models.len(), DEFAULT_MODEL_CHAIN.len());
        assert_eq!(config.gemini.safety_threshold, "BLOCK_NONE");
    }

    #[test]
    fn parses_sections_and_overrides() {
        let raw = r#"
            data_dir = "/tmp/relaybot-test"

            [gemini]
            models = ["a", "b"]

            [limits]
            queue_depth = 3
            poll_interval_secs = 2
            max_attachment_mb = 8

            [delivery]
            edit_throttle_ms = 5000

            [defaults]
            response_format = "embedded"

            [guilds.123]
            history_scope = "guild"
            override_user = true
        "#;
        let config = Config::from_toml(raw).expect("config should parse");

        assert_eq!(config.data_dir, PathBuf::from("/tmp/relaybot-test"));
        assert_eq!(config.gemini.models, vec!["a", "b"]);
        assert_eq!(config.limits.queue_depth, 3);
        assert_eq!(config.limits.poll_interval, Duration::from_secs(2));
        assert_eq!(config.limits.max_attachment_bytes, 8 * 1024 * 1024);
        assert_eq!(config.delivery.edit_throttle, Duration::from_millis(800));
        assert_eq!(config.defaults.response_format, ResponseFormat::Embedded);
        let guild = config.overrides.guilds.get(&123).expect("guild override");
        assert_eq!(guild.history_scope, Some(HistoryScope::Guild));
        assert!(guild.override_user);
    }

    #[test]
    fn truncates_long_model_chain() {
        let config = Config::from_toml(r#"
            [gemini]
            models = ["a", "b", "c", "d", "e", "f"]
        "#)
        .expect("config should parse");
        assert_eq!(config.gemini.models.len(), MAX_FALLBACK_CHAIN);
    }

    #[test]
    fn rejects_non_numeric_override_ids() {
        let error = Config::from_toml("[users.alice]\npersonality = \"x\"")
            .expect_err("non-numeric id must fail");
        assert!(error.to_string().contains("users.alice"));
    }

    #[test]
    fn validate_requires_tokens() {
        let config = Config::from_toml("").expect("config should parse");
        let error = config.validate().expect_err("missing token must fail");
        assert!(error.to_string().contains("discord.token"));
    }
}
