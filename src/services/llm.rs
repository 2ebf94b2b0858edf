//! LLM client for OpenAI-compatible chat and completion endpoints.
//!
//! Models come in two shapes. Chat models take the message list as-is;
//! completion models get a flat prompt assembled from numbered
//! INSTRUCTIONS (the system messages) followed by a CONVERSATION block
//! of `role: content` lines, and their output is post-cleaned down to
//! the first well-formed reply.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Completer, CompletionOptions};
use crate::types::{Message, Role};

/// Endpoint class a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Chat,
    Completion,
}

/// The conversational models this server knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Gpt35Turbo,
    Gpt35Turbo0301,
    TextDavinci003,
    TextDavinci002,
    TextCurie001,
    TextBabbage001,
    TextAda001,
}

impl Model {
    pub fn id(&self) -> &'static str {
        match self {
            Model::Gpt35Turbo => "gpt-3.5-turbo",
            Model::Gpt35Turbo0301 => "gpt-3.5-turbo-0301",
            Model::TextDavinci003 => "text-davinci-003",
            Model::TextDavinci002 => "text-davinci-002",
            Model::TextCurie001 => "text-curie-001",
            Model::TextBabbage001 => "text-babbage-001",
            Model::TextAda001 => "text-ada-001",
        }
    }

    pub fn parse(id: &str) -> Result<Self> {
        let model = match id {
            "gpt-3.5-turbo" => Model::Gpt35Turbo,
            "gpt-3.5-turbo-0301" => Model::Gpt35Turbo0301,
            "text-davinci-003" => Model::TextDavinci003,
            "text-davinci-002" => Model::TextDavinci002,
            "text-curie-001" => Model::TextCurie001,
            "text-babbage-001" => Model::TextBabbage001,
            "text-ada-001" => Model::TextAda001,
            other => bail!("model not supported: {other}"),
        };
        Ok(model)
    }

    pub fn class(&self) -> ModelClass {
        match self {
            Model::Gpt35Turbo | Model::Gpt35Turbo0301 => ModelClass::Chat,
            _ => ModelClass::Completion,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatPayloadMessage<'a>>,
    n: u32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
struct ChatPayloadMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: String,
    n: u32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
    finish_reason: Option<String>,
}

pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: Model,
}

impl LlmClient {
    pub fn new(base_url: String, api_key: String, model: Model) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            model,
        }
    }

    async fn chat_completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String> {
        let request = ChatRequest {
            model: self.model.id(),
            messages: chat_payload(messages),
            n: options.n,
            max_tokens: options.max_tokens,
            stop: options.stop.iter().map(String::as_str).collect(),
        };
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("chat completion error ({status}): {body}");
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .context("chat completion returned no choices")?;
        log_finish_reason(choice.finish_reason.as_deref());
        if options.n > 1 {
            warn!(n = options.n, "using only the first completion");
        }
        Ok(choice.message.content.unwrap_or_default())
    }

    async fn text_completion(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String> {
        let request = CompletionRequest {
            model: self.model.id(),
            prompt: completion_prompt(messages),
            n: options.n,
            max_tokens: options.max_tokens,
            stop: options.stop.iter().map(String::as_str).collect(),
        };
        let response = self
            .client
            .post(format!("{}/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("completion error ({status}): {body}");
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse completion response")?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .context("completion returned no choices")?;
        log_finish_reason(choice.finish_reason.as_deref());
        if options.n > 1 {
            warn!(n = options.n, "using only the first completion");
        }
        Ok(clean_completion(choice.text.trim()))
    }
}

#[async_trait]
impl Completer for LlmClient {
    async fn complete(&self, messages: &[Message], options: &CompletionOptions) -> Result<String> {
        debug!(
            model = self.model.id(),
            messages = messages.len(),
            "requesting completion"
        );
        match self.model.class() {
            ModelClass::Chat => self.chat_completion(messages, options).await,
            ModelClass::Completion => self.text_completion(messages, options).await,
        }
    }
}

fn log_finish_reason(reason: Option<&str>) {
    match reason {
        Some("stop") | None => {}
        Some(other) => warn!(finish_reason = other, "completion did not finish cleanly"),
    }
}

/// Chat payload: the message list as `{role, content}` pairs.
fn chat_payload(messages: &[Message]) -> Vec<ChatPayloadMessage<'_>> {
    messages
        .iter()
        .map(|m| ChatPayloadMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

/// Completion prompt: numbered INSTRUCTIONS from the system prefix,
/// then a CONVERSATION block of `role: content` lines. System messages
/// after the first non-system message are out of place and skipped.
fn completion_prompt(messages: &[Message]) -> String {
    let mut lines = vec!["INSTRUCTIONS".to_string()];
    let mut instruction = 1;
    lines.push(format!(
        "{instruction}. You are the 'assistant', the human participant is the 'user'."
    ));
    let mut sys_done = false;
    for message in messages {
        if message.role == Role::System {
            if sys_done {
                warn!("system message out of place, skipping");
                continue;
            }
            instruction += 1;
            lines.push(format!("{instruction}. {}", message.content));
        } else {
            if !sys_done {
                lines.push("CONVERSATION".to_string());
            }
            sys_done = true;
            lines.push(format!("{}: {}", message.role, message.content));
        }
    }
    lines.join("\n")
}

static REPLY_RE: Lazy<Regex> = Lazy::new(|| {
    // First well-formed `Name: content` reply; everything else the
    // completion model dreamt up is discarded.
    Regex::new(r"(?:\n|^)([A-Za-z]+:)[ \n\t]*([^\n\t]+)").expect("reply regex")
});

/// Strip the role-prefix formatting a completion model thinks it
/// should produce.
fn clean_completion(text: &str) -> String {
    match REPLY_RE.captures(text) {
        Some(caps) => {
            let reply = caps.get(2).map(|m| m.as_str()).unwrap_or(text);
            debug!(reply, "cleaned completion");
            reply.to_string()
        }
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;

    fn history() -> Vec<Message> {
        let mut messages = ActivityKind::Unstructured.prompt();
        messages.push(Message::user("bonjour"));
        messages.push(Message::assistant("salut !"));
        messages.push(Message::user("comment ça va ?"));
        messages
    }

    #[test]
    fn model_classes() {
        assert_eq!(Model::Gpt35Turbo.class(), ModelClass::Chat);
        assert_eq!(Model::TextDavinci002.class(), ModelClass::Completion);
        assert_eq!(Model::parse("gpt-3.5-turbo").unwrap(), Model::Gpt35Turbo);
        assert!(Model::parse("gpt-nonexistent").is_err());
    }

    #[test]
    fn chat_payload_preserves_roles_in_order() {
        let history = history();
        let payload = chat_payload(&history);
        assert_eq!(payload[0].role, "system");
        assert_eq!(payload[3].role, "user");
        assert_eq!(payload[3].content, "bonjour");
        assert_eq!(payload.last().unwrap().content, "comment ça va ?");
    }

    #[test]
    fn completion_prompt_shape() {
        let prompt = completion_prompt(&history());
        let lines: Vec<&str> = prompt.lines().collect();
        assert_eq!(lines[0], "INSTRUCTIONS");
        assert!(lines[1].starts_with("1. You are the 'assistant'"));
        assert!(lines[2].starts_with("2. "));
        let conv = lines.iter().position(|l| *l == "CONVERSATION").unwrap();
        assert_eq!(lines[conv + 1], "user: bonjour");
        assert_eq!(lines[conv + 2], "assistant: salut !");
    }

    #[test]
    fn late_system_messages_are_skipped() {
        let mut messages = history();
        messages.push(Message::system("out of place"));
        let prompt = completion_prompt(&messages);
        assert!(!prompt.contains("out of place"));
    }

    #[test]
    fn clean_completion_takes_first_reply() {
        assert_eq!(
            clean_completion("assistant: Ça va bien !\nuser: et toi ?"),
            "Ça va bien !"
        );
        assert_eq!(clean_completion("Bob: hi there"), "hi there");
    }

    #[test]
    fn clean_completion_passes_plain_text_through() {
        assert_eq!(clean_completion("no role prefix here"), "no role prefix here");
    }
}
