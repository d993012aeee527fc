//! System instruction templates.

use crate::Request;
use crate::error::Result;

use anyhow::Context as _;
use minijinja::{Environment, context};

const SYSTEM_TEMPLATE: &str = r#"You are a helpful assistant answering in a Discord chat.

Rules:
- Use Discord-flavoured markdown. Headings, lists, bold and code blocks render; tables do not.
- Be direct. Do not restate the question before answering.
- When files are attached, their descriptions appear as bracketed notes before the file itself.
- If an attachment note says a file could not be processed, tell the user instead of guessing its content.
{%- if personality %}

Personality:
{{ personality }}
{%- endif %}

Context:
- You are talking to {{ author_name }}.
{%- if guild_name %}
- This conversation is in the server "{{ guild_name }}".
{%- else %}
- This is a direct message conversation.
{%- endif %}
- The current time is {{ now }}."#;

/// Renders system instructions from templates.
#[derive(Debug)]
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("failed to compile system prompt template")?;
        Ok(Self { env })
    }

    /// Base rules, personality and contextual info for one request.
    pub fn render_system_prompt(
        &self,
        request: &Request,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        let template = self
            .env
            .get_template("system")
            .context("system prompt template missing")?;

        let personality = request
            .settings
            .personality
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty());

        let rendered = template
            .render(context! {
                personality => personality,
                author_name => request.author_name,
                guild_name => request.guild_name,
                now => now.format("%A, %Y-%m-%d %H:%M UTC").to_string(),
            })
            .context("failed to render system prompt")?;

        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::request;
    use chrono::TimeZone as _;

    fn now() -> chrono::DateTime<chrono::Utc> {
        chrono::Utc
            .with_ymd_and_hms(2025, 3, 14, 9, 26, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn renders_guild_context_and_personality() {
        let engine = PromptEngine::new().expect("template should compile");
        let mut request = request(1, "hi");
        request.guild_name = Some("Rustaceans".into());
        request.settings.personality = Some("  Speak like a pirate.  ".into());

        let prompt = engine
            .render_system_prompt(&request, now())
            .expect("prompt should render");

        assert!(prompt.contains("Personality:\nSpeak like a pirate."));
        assert!(prompt.contains("in the server \"Rustaceans\""));
        assert!(prompt.contains("Friday, 2025-03-14 09:26 UTC"));
    }

    #[test]
    fn direct_messages_omit_personality_block() {
        let engine = PromptEngine::new().expect("template should compile");
        let request = request(1, "hi");

        let prompt = engine
            .render_system_prompt(&request, now())
            .expect("prompt should render");

        assert!(!prompt.contains("Personality:"));
        assert!(prompt.contains("direct message conversation"));
    }
}
