//! Server-side proxy to the generative-language endpoint.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::auth::Role;
use crate::config::ChatConfig;

#[derive(Debug, Error)]
pub enum ChatError {
    /// No API key is configured for the daemon.
    #[error("chat assistant is not configured")]
    Unavailable,

    #[error("upstream error (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected response: {0}")]
    BadResponse(String),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Unavailable => "chat_unavailable",
            ChatError::Upstream { .. } => "chat_upstream",
            ChatError::Timeout(_) => "chat_timeout",
            ChatError::Network(_) => "chat_network",
            ChatError::BadResponse(_) => "chat_bad_response",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

impl Speaker {
    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Speaker::User),
            "assistant" => Some(Speaker::Assistant),
            _ => None,
        }
    }

    // The upstream API names the assistant side "model".
    fn wire_role(self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Assistant => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub speaker: Speaker,
    pub content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: SystemInstruction<'a>,
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamError {
    error: UpstreamErrorBody,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    message: String,
}

pub fn preamble(role: Role, full_name: &str) -> String {
    let audience = match role {
        Role::Admin => "a school administrator managing staff, students and reports",
        Role::Teacher => "a teacher handling attendance, marks and student progress",
        Role::Student => "a student asking about their studies, marks and attendance",
    };
    format!(
        "You are the assistant inside a school management dashboard. \
         You are talking to {} ({}). Answer concisely and do not invent records.",
        full_name, audience
    )
}

/// The preamble travels as the system instruction; `history` must already
/// end with the new user message.
fn build_request<'a>(preamble: &'a str, history: &'a [ChatTurn]) -> GenerateRequest<'a> {
    let contents = history
        .iter()
        .map(|turn| Content {
            role: turn.speaker.wire_role(),
            parts: vec![Part {
                text: &turn.content,
            }],
        })
        .collect();
    GenerateRequest {
        system_instruction: SystemInstruction {
            parts: vec![Part { text: preamble }],
        },
        contents,
    }
}

fn extract_text(body: &str) -> Result<String, ChatError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ChatError::BadResponse(format!("invalid JSON: {e}")))?;
    let text: String = parsed
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ChatError::BadResponse("no candidate text".to_string()));
    }
    Ok(text)
}

pub struct ChatClient {
    endpoint: String,
    model: String,
    api_key: String,
    timeout_secs: u64,
    client: reqwest::blocking::Client,
}

impl ChatClient {
    pub fn from_config(config: &ChatConfig) -> Result<Self, ChatError> {
        let Some(api_key) = config.api_key.clone() else {
            return Err(ChatError::Unavailable);
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout_secs: config.timeout_secs,
            client,
        })
    }

    #[instrument(skip_all, fields(model = %self.model, turns = history.len()))]
    pub fn generate(&self, preamble: &str, history: &[ChatTurn]) -> Result<String, ChatError> {
        let body = build_request(preamble, history);
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ChatError::Timeout(self.timeout_secs)
                } else {
                    ChatError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let text = response.text().map_err(|e| {
            if e.is_timeout() {
                ChatError::Timeout(self.timeout_secs)
            } else {
                ChatError::Network(e.to_string())
            }
        })?;
        if status >= 400 {
            let message = serde_json::from_str::<UpstreamError>(&text)
                .map(|e| e.error.message)
                .unwrap_or(text);
            return Err(ChatError::Upstream { status, message });
        }
        extract_text(&text)
    }
}
