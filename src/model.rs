//! Canonical data model: model descriptors, conversation context, the
//! aggregated assistant message, and the incremental event sequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::json::AnyValue;

/// Enumerated adapter tag. New vendors extend this set; the registry keys on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Api {
    Google,
    GoogleVertex,
    Openai,
    OpenaiCodex,
}

impl Api {
    pub fn as_str(&self) -> &'static str {
        match self {
            Api::Google => "google",
            Api::GoogleVertex => "google-vertex",
            Api::Openai => "openai",
            Api::OpenaiCodex => "openai-codex",
        }
    }
}

/// Which input modalities a model accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

/// Per-million-token pricing, in USD.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pricing {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

/// Immutable description of one callable model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub api: Api,
    pub provider: String,
    pub base_url: String,
    pub reasoning: bool,
    pub modalities: Vec<Modality>,
    pub pricing: Pricing,
    pub context_window: u32,
    pub max_output_tokens: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub default_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One turn supplied by the caller as part of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: AnyValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: AnyValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
    Tool(String),
}

/// Caller-owned, read-only conversation the adapter extends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolSchema>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default)]
pub struct ThinkingOptions {
    pub enabled: bool,
    pub level: Option<ThinkingLevel>,
    pub budget_tokens: Option<u32>,
}

/// Canonical, full option set accepted by [`crate::dispatch::stream`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub signal: Option<CancellationToken>,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub session_id: Option<String>,
    pub tool_choice: Option<ToolChoice>,
    pub thinking: Option<ThinkingOptions>,
}

/// The reduced option set exposed to callers who don't need vendor-specific
/// knobs. Each adapter maps this to the full [`Options`].
#[derive(Debug, Clone, Default)]
pub struct SimpleOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub signal: Option<CancellationToken>,
    pub api_key: Option<String>,
}

impl From<SimpleOptions> for Options {
    fn from(simple: SimpleOptions) -> Self {
        Options {
            temperature: simple.temperature,
            max_tokens: simple.max_tokens,
            signal: simple.signal,
            api_key: simple.api_key,
            ..Default::default()
        }
    }
}

/// One unit of an assistant message, position-stable within `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "thinking")]
    Thinking {
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "tool_call")]
    ToolCall {
        id: String,
        name: String,
        arguments: AnyValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

impl ContentBlock {
    pub fn is_tool_call(&self) -> bool {
        matches!(self, ContentBlock::ToolCall { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Aborted,
    Error,
}

/// The aggregated assistant output produced by one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: Api,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl AssistantMessage {
    pub fn empty(api: Api, provider: impl Into<String>, model: impl Into<String>) -> Self {
        AssistantMessage {
            content: Vec::new(),
            api,
            provider: provider.into(),
            model: model.into(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
        }
    }

    /// Applies the tool-use override: if any block is a tool call and the
    /// current stop reason isn't already an error/abort, force `ToolUse`.
    pub fn apply_tool_use_override(&mut self) {
        if self.content.iter().any(ContentBlock::is_tool_call)
            && !matches!(self.stop_reason, StopReason::Aborted | StopReason::Error)
        {
            self.stop_reason = StopReason::ToolUse;
        }
    }
}

/// Incrementally emitted description of the assistant's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AssistantEvent {
    #[serde(rename = "start")]
    Start { partial: AssistantMessage },
    #[serde(rename = "textStart")]
    TextStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    #[serde(rename = "textDelta")]
    TextDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    #[serde(rename = "textEnd")]
    TextEnd {
        content_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    #[serde(rename = "thinkingStart")]
    ThinkingStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    #[serde(rename = "thinkingDelta")]
    ThinkingDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    #[serde(rename = "thinkingEnd")]
    ThinkingEnd {
        content_index: usize,
        content: String,
        partial: AssistantMessage,
    },
    #[serde(rename = "toolCallStart")]
    ToolCallStart {
        content_index: usize,
        partial: AssistantMessage,
    },
    #[serde(rename = "toolCallDelta")]
    ToolCallDelta {
        content_index: usize,
        delta: String,
        partial: AssistantMessage,
    },
    #[serde(rename = "toolCallEnd")]
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
        partial: AssistantMessage,
    },
    #[serde(rename = "done")]
    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    #[serde(rename = "error")]
    Error {
        reason: StopReason,
        message: AssistantMessage,
    },
}

impl AssistantEvent {
    /// Identifies terminal events (`done`/`error`) for the event-stream primitive.
    pub fn is_complete(&self) -> bool {
        matches!(self, AssistantEvent::Done { .. } | AssistantEvent::Error { .. })
    }

    /// Projects the result message from a terminal event. Any non-terminal
    /// event is a programmer error and yields a synthesized error message.
    pub fn extract_result(&self, api: Api, provider: &str, model: &str) -> AssistantMessage {
        match self {
            AssistantEvent::Done { message, .. } | AssistantEvent::Error { message, .. } => {
                message.clone()
            }
            _ => {
                let mut msg = AssistantMessage::empty(api, provider, model);
                msg.stop_reason = StopReason::Error;
                msg.error_message =
                    Some("extract_result called on a non-terminal event".to_string());
                msg
            }
        }
    }
}
