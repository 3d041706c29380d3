//! Google Gemini streaming adapter — the fully specified vendor state machine
//! (SPEC_FULL.md §4.G).
//!
//! Wire types are adapted from this crate's own `GenerateContentRequest`/
//! `GenerateContentResponse` family; the SSE-consumption loop follows the
//! same shape as the teacher's `GeminiProvider::chat()`.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};

use crate::blocks::BlockTracker;
use crate::error::ProviderError;
use crate::event_stream::channel;
use crate::json::AnyValue;
use crate::model::{
    Api, AssistantEvent, Context, Model, Options, Role, SimpleOptions, ToolChoice, Usage,
};
use crate::registry::BoxedEventStream;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

static CALL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "toolConfig")]
    tool_config: Option<GeminiToolConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiToolConfig {
    #[serde(rename = "functionCallingConfig")]
    function_calling_config: GeminiFunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionCallingConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none", rename = "allowedFunctionNames")]
    allowed_function_names: Option<Vec<String>>,
}

/// Maps the canonical tool-choice directive onto Gemini's `toolConfig`.
/// `Options.toolChoice` takes precedence over a conversation-level default
/// carried on `Context.toolChoice`.
fn build_tool_config(context: &Context, options: &Options) -> Option<GeminiToolConfig> {
    let choice = options.tool_choice.as_ref().or(context.tool_choice.as_ref())?;
    let function_calling_config = match choice {
        ToolChoice::Auto => GeminiFunctionCallingConfig {
            mode: "AUTO",
            allowed_function_names: None,
        },
        ToolChoice::None => GeminiFunctionCallingConfig {
            mode: "NONE",
            allowed_function_names: None,
        },
        ToolChoice::Required => GeminiFunctionCallingConfig {
            mode: "ANY",
            allowed_function_names: None,
        },
        ToolChoice::Tool(name) => GeminiFunctionCallingConfig {
            mode: "ANY",
            allowed_function_names: Some(vec![name.clone()]),
        },
    };
    Some(GeminiToolConfig {
        function_calling_config,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "thought")]
    thought: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "thoughtSignature")]
    thought_signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "functionCall")]
    function_call: Option<GeminiFunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "functionResponse")]
    function_response: Option<GeminiFunctionResponse>,
}

impl GeminiPart {
    fn text(text: impl Into<String>) -> Self {
        GeminiPart {
            text: Some(text.into()),
            thought: None,
            thought_signature: None,
            function_call: None,
            function_response: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxOutputTokens")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "thinkingConfig")]
    thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Debug, Serialize)]
struct GeminiThinkingConfig {
    #[serde(skip_serializing_if = "Option::is_none", rename = "thinkingBudget")]
    thinking_budget: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: u64,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: u64,
    #[serde(default, rename = "thoughtsTokenCount")]
    thoughts_token_count: u64,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: u64,
}

fn build_request_body(context: &Context, options: &Options) -> GenerateContentRequest {
    // Build id -> name lookup for tool responses, sourced from assistant
    // tool_calls already present in the conversation.
    let mut tool_call_names: HashMap<String, String> = HashMap::new();
    for turn in &context.turns {
        if let Some(calls) = &turn.tool_calls {
            for call in calls {
                tool_call_names.insert(call.id.clone(), call.name.clone());
            }
        }
    }

    let mut contents = Vec::new();
    for turn in &context.turns {
        match turn.role {
            Role::System => continue,
            Role::User => contents.push(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart::text(turn.content.clone())],
            }),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !turn.content.is_empty() {
                    parts.push(GeminiPart::text(turn.content.clone()));
                }
                if let Some(calls) = &turn.tool_calls {
                    for call in calls {
                        parts.push(GeminiPart {
                            text: None,
                            thought: None,
                            thought_signature: None,
                            function_call: Some(GeminiFunctionCall {
                                name: call.name.clone(),
                                args: call.arguments.to_raw().unwrap_or(serde_json::Value::Null),
                            }),
                            function_response: None,
                        });
                    }
                }
                contents.push(GeminiContent {
                    role: "model".to_string(),
                    parts,
                });
            }
            Role::Tool => {
                let name = turn
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| tool_call_names.get(id))
                    .cloned()
                    .unwrap_or_else(|| "tool".to_string());
                contents.push(GeminiContent {
                    role: "user".to_string(),
                    parts: vec![GeminiPart {
                        text: None,
                        thought: None,
                        thought_signature: None,
                        function_call: None,
                        function_response: Some(GeminiFunctionResponse {
                            name,
                            response: serde_json::json!({ "result": turn.content }),
                        }),
                    }],
                });
            }
        }
    }

    let system_instruction = context.system_prompt.as_ref().map(|prompt| GeminiContent {
        role: "user".to_string(),
        parts: vec![GeminiPart::text(prompt.clone())],
    });

    let tools = context.tools.as_ref().map(|schemas| {
        vec![GeminiTool {
            function_declarations: schemas
                .iter()
                .map(|t| GeminiFunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.to_raw().unwrap_or(serde_json::Value::Null),
                })
                .collect(),
        }]
    });

    let thinking_config = options.thinking.as_ref().and_then(|t| {
        if t.enabled {
            Some(GeminiThinkingConfig {
                thinking_budget: t.budget_tokens,
            })
        } else {
            None
        }
    });

    let tool_config = build_tool_config(context, options);

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config: Some(GeminiGenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
            thinking_config,
        }),
    }
}

fn build_url(model: &Model, api_key: &str) -> String {
    let base = model.base_url.trim_end_matches('/');
    let base = if base.ends_with("/models") {
        base.to_string()
    } else {
        format!("{base}/models")
    };
    format!(
        "{base}/{}:streamGenerateContent?alt=sse&key={}",
        model.id, api_key
    )
}

/// Redacts the `key=` query parameter so request URLs can be logged safely.
fn redact_key(url: &str) -> String {
    match url.find("key=") {
        Some(idx) => format!("{}key=***", &url[..idx]),
        None => url.to_string(),
    }
}

pub fn stream(model: Model, context: Context, options: Options) -> BoxedEventStream {
    let (mut sink, out) = channel(AssistantEvent::is_complete, {
        let api = model.api;
        let provider = model.provider.clone();
        let model_id = model.id.clone();
        move |e: &AssistantEvent| e.extract_result(api, &provider, &model_id)
    });

    tokio::spawn(async move {
        run(model, context, options, &mut sink).await;
    });

    out
}

pub fn stream_simple(model: Model, context: Context, options: SimpleOptions) -> BoxedEventStream {
    stream(model, context, options.into())
}

async fn run(model: Model, context: Context, options: Options, sink: &mut crate::blocks::Sink) {
    let mut tracker = BlockTracker::new(model.api, &model.provider, &model.id, &CALL_SEQ);

    if let Some(signal) = &options.signal {
        if signal.is_cancelled() {
            tracker.finish_error(sink, true, "aborted before send".to_string());
            return;
        }
    }

    let api_key = options.api_key.clone().unwrap_or_default();
    if api_key.is_empty() {
        let err = ProviderError::MissingApiKey(model.provider.clone());
        tracker.finish_error(sink, false, err.to_string());
        return;
    }

    let mut headers = model.default_headers.clone();
    for (k, v) in &options.headers {
        headers.insert(k.clone(), v.clone());
    }

    let body = build_request_body(&context, &options);
    let url = build_url(&model, &api_key);

    let client = reqwest::Client::new();
    let mut request = client.post(&url);
    for (k, v) in &headers {
        request = request.header(k, v);
    }
    request = request
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream");

    log::debug!("gemini request: POST {}", redact_key(&url));

    let response = match request.json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("gemini request failed: {e}");
            tracker.finish_error(sink, false, e.to_string());
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body_text = crate::sse::drain_error_body(response).await;
        log::warn!("gemini vendor error ({status}): {body_text}");
        tracker.finish_error(sink, false, body_text);
        return;
    }

    tracker.emit_start(sink);

    let mut payloads = Box::pin(crate::sse::sse_payloads(response, options.signal.clone()));
    use futures::StreamExt;

    let mut saw_error = false;
    while let Some(payload) = payloads.next().await {
        let payload = match payload {
            Ok(p) => p,
            Err(ProviderError::Aborted) => {
                tracker.finish_error(sink, true, "cancelled".to_string());
                return;
            }
            Err(e) => {
                tracker.finish_error(sink, false, e.to_string());
                saw_error = true;
                break;
            }
        };

        let parsed: GenerateContentResponse = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("skipping undecodable gemini SSE payload: {e}");
                continue;
            }
        };

        for candidate in &parsed.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        let is_thinking = part.thought.unwrap_or(false);
                        tracker.text_delta(sink, text, is_thinking, part.thought_signature.clone());
                    }
                    if let Some(call) = &part.function_call {
                        let args = AnyValue::from_raw(call.args.clone());
                        tracker.function_call(sink, None, &call.name, args, part.thought_signature.clone());
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                tracker.apply_finish_reason(reason);
            }
        }

        if let Some(usage) = &parsed.usage_metadata {
            tracker.set_usage(Usage {
                input: usage.prompt_token_count,
                output: usage.candidates_token_count + usage.thoughts_token_count,
                cache_read: 0,
                cache_write: 0,
                total_tokens: usage.total_token_count,
                cost: None,
            });
        }
    }

    if saw_error {
        return;
    }

    if let Some(signal) = &options.signal {
        if signal.is_cancelled() {
            tracker.finish_error(sink, true, "cancelled".to_string());
            return;
        }
    }

    tracker.finish_success(sink);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Modality, Pricing, Turn};
    use futures::StreamExt;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_model(base_url: String) -> Model {
        Model {
            id: "gemini-test".into(),
            name: "Gemini Test".into(),
            api: Api::Google,
            provider: "google".into(),
            base_url,
            reasoning: true,
            modalities: vec![Modality::Text],
            pricing: Pricing::default(),
            context_window: 100_000,
            max_output_tokens: 8192,
            default_headers: Default::default(),
        }
    }

    fn ctx(prompt: &str) -> Context {
        Context {
            system_prompt: None,
            turns: vec![Turn {
                role: Role::User,
                content: prompt.to_string(),
                tool_call_id: None,
                tool_calls: None,
            }],
            tools: None,
            tool_choice: None,
        }
    }

    #[tokio::test]
    async fn text_round_trip_scenario() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]},",
            "\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":3,",
            "\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path_regex(r"/models/.*:streamGenerateContent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let model = test_model(server.uri());
        let mut options = Options::default();
        options.api_key = Some("key123".to_string());
        let mut out = stream(model, ctx("hi"), options);

        let mut events = Vec::new();
        while let Some(e) = out.next().await {
            events.push(e);
        }
        assert!(matches!(events[0], AssistantEvent::Start { .. }));
        match events.last().unwrap() {
            AssistantEvent::Done { message, .. } => {
                assert_eq!(message.usage.total_tokens, 5);
                assert_eq!(message.usage.input, 3);
                assert_eq!(message.usage.output, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_401_surfaces_body_as_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path_regex(r"/models/.*:streamGenerateContent"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let model = test_model(server.uri());
        let mut options = Options::default();
        options.api_key = Some("key123".to_string());
        let mut out = stream(model, ctx("hi"), options);

        let event = out.next().await.expect("one event");
        match event {
            AssistantEvent::Error { message, .. } => {
                assert_eq!(message.error_message.as_deref(), Some("bad key"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn missing_api_key_terminates_with_missing_api_key_error() {
        let model = test_model("https://example.invalid".to_string());
        let mut out = stream(model, ctx("hi"), Options::default());
        let event = out.next().await.expect("one event");
        match event {
            AssistantEvent::Error { message, .. } => {
                assert!(message.error_message.as_deref().unwrap().contains("google"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn tool_choice_on_options_overrides_context_default() {
        let mut context = ctx("hi");
        context.tool_choice = Some(crate::model::ToolChoice::Auto);
        let mut options = Options::default();
        options.tool_choice = Some(crate::model::ToolChoice::Tool("search".to_string()));

        let body = build_request_body(&context, &options);
        let config = body.tool_config.expect("tool config present");
        assert_eq!(config.function_calling_config.mode, "ANY");
        assert_eq!(
            config.function_calling_config.allowed_function_names,
            Some(vec!["search".to_string()])
        );
    }

    #[test]
    fn tool_choice_falls_back_to_context_default() {
        let mut context = ctx("hi");
        context.tool_choice = Some(crate::model::ToolChoice::None);
        let options = Options::default();

        let body = build_request_body(&context, &options);
        let config = body.tool_config.expect("tool config present");
        assert_eq!(config.function_calling_config.mode, "NONE");
    }

    #[test]
    fn url_normalizes_trailing_models_suffix() {
        let mut model = test_model("https://generativelanguage.googleapis.com/v1beta".to_string());
        let url = build_url(&model, "k");
        assert!(url.starts_with(
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-test:streamGenerateContent"
        ));
        model.base_url = "https://generativelanguage.googleapis.com/v1beta/models".to_string();
        let url2 = build_url(&model, "k");
        assert_eq!(url, url2);
    }
}
