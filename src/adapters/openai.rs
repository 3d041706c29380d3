//! OpenAI streaming adapter (Chat Completions shape, ambient expansion) plus
//! the Codex request-transform pass (Responses API body rewrite, contractually
//! required by SPEC_FULL.md §4.G/§6).
//!
//! Wire types for the streaming half are adapted near-verbatim from this
//! crate's own `ChatCompletionChunk`/`Choice`/`Delta`/`ToolCallDelta` family.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use serde::{Deserialize, Serialize};

use crate::blocks::BlockTracker;
use crate::error::ProviderError;
use crate::event_stream::channel;
use crate::json::AnyValue;
use crate::model::{Api, AssistantEvent, Context, Model, Options, Role, SimpleOptions, ToolChoice, Usage};
use crate::registry::BoxedEventStream;

static CALL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

/// Maps the canonical tool-choice directive onto OpenAI's `tool_choice`.
/// `Options.toolChoice` takes precedence over a conversation-level default
/// carried on `Context.toolChoice`.
fn build_tool_choice(context: &Context, options: &Options) -> Option<serde_json::Value> {
    let choice = options.tool_choice.as_ref().or(context.tool_choice.as_ref())?;
    Some(match choice {
        ToolChoice::Auto => serde_json::Value::String("auto".to_string()),
        ToolChoice::None => serde_json::Value::String("none".to_string()),
        ToolChoice::Required => serde_json::Value::String("required".to_string()),
        ToolChoice::Tool(name) => serde_json::json!({
            "type": "function",
            "function": { "name": name },
        }),
    })
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Accumulates tool-call deltas keyed by their `index` until a call is known
/// complete (a `finish_reason` arrives, or a later delta touches another
/// index), matching this crate's existing `ToolCallAssembler` shape.
#[derive(Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    emitted: bool,
}

fn build_request_body(model: &Model, context: &Context, options: &Options) -> ChatCompletionRequest {
    let mut messages = Vec::new();
    if let Some(system) = &context.system_prompt {
        messages.push(ChatMessage::System {
            content: system.clone(),
        });
    }
    for turn in &context.turns {
        match turn.role {
            Role::System => messages.push(ChatMessage::System {
                content: turn.content.clone(),
            }),
            Role::User => messages.push(ChatMessage::User {
                content: turn.content.clone(),
            }),
            Role::Assistant => {
                let tool_calls = turn.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|c| OpenAiToolCall {
                            id: c.id.clone(),
                            tool_type: "function".to_string(),
                            function: OpenAiFunctionCall {
                                name: c.name.clone(),
                                arguments: c.arguments.encode().unwrap_or_else(|_| "{}".to_string()),
                            },
                        })
                        .collect()
                });
                messages.push(ChatMessage::Assistant {
                    content: Some(turn.content.clone()),
                    tool_calls,
                });
            }
            Role::Tool => messages.push(ChatMessage::Tool {
                content: turn.content.clone(),
                tool_call_id: turn.tool_call_id.clone().unwrap_or_default(),
            }),
        }
    }

    let tools = context.tools.as_ref().map(|schemas| {
        schemas
            .iter()
            .map(|t| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.to_raw().unwrap_or(serde_json::Value::Null),
                },
            })
            .collect()
    });

    let tool_choice = build_tool_choice(context, options);

    ChatCompletionRequest {
        model: model.id.clone(),
        messages,
        temperature: options.temperature,
        max_completion_tokens: options.max_tokens,
        stream: true,
        stream_options: StreamOptions { include_usage: true },
        tools,
        tool_choice,
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

    let body = build_request_body(&model, &context, &options);
    let url = format!("{}/chat/completions", model.base_url.trim_end_matches('/'));

    let client = reqwest::Client::new();
    let mut request = client.post(&url).bearer_auth(&api_key);
    for (k, v) in &headers {
        request = request.header(k, v);
    }
    request = request
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream");

    log::debug!("openai request: POST {url}");

    let response = match request.json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("openai request failed: {e}");
            tracker.finish_error(sink, false, e.to_string());
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body_text = crate::sse::drain_error_body(response).await;
        log::warn!("openai vendor error ({status}): {body_text}");
        tracker.finish_error(sink, false, body_text);
        return;
    }

    tracker.emit_start(sink);

    let mut payloads = Box::pin(crate::sse::sse_payloads(response, options.signal.clone()));
    use futures::StreamExt;

    let mut pending_calls: HashMap<usize, PartialToolCall> = HashMap::new();
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

        if payload == "[DONE]" {
            continue;
        }

        let parsed: ChatCompletionChunk = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("skipping undecodable openai SSE payload: {e}");
                continue;
            }
        };

        for choice in &parsed.choices {
            if let Some(content) = &choice.delta.content {
                tracker.text_delta(sink, content, false, None);
            }

            if let Some(deltas) = &choice.delta.tool_calls {
                for delta in deltas {
                    let entry = pending_calls.entry(delta.index).or_default();
                    if let Some(id) = &delta.id {
                        entry.id = Some(id.clone());
                    }
                    if let Some(func) = &delta.function {
                        if let Some(name) = &func.name {
                            entry.name = Some(name.clone());
                        }
                        if let Some(args) = &func.arguments {
                            entry.arguments.push_str(args);
                        }
                    }
                }
            }

            if let Some(reason) = &choice.finish_reason {
                flush_tool_calls(&mut tracker, sink, &mut pending_calls);
                tracker.apply_openai_finish_reason(reason);
            }
        }

        if let Some(usage) = &parsed.usage {
            tracker.set_usage(Usage {
                input: usage.prompt_tokens,
                output: usage.completion_tokens,
                cache_read: 0,
                cache_write: 0,
                total_tokens: usage.total_tokens,
                cost: None,
            });
        }
    }

    // Flush any tool calls that completed without an explicit finish_reason
    // (defensive; normal streams always carry one).
    flush_tool_calls(&mut tracker, sink, &mut pending_calls);

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

fn flush_tool_calls(
    tracker: &mut BlockTracker<'_>,
    sink: &mut crate::blocks::Sink,
    pending: &mut HashMap<usize, PartialToolCall>,
) {
    let mut indices: Vec<usize> = pending.keys().copied().collect();
    indices.sort_unstable();
    for index in indices {
        let call = pending.get_mut(&index).unwrap();
        if call.emitted {
            continue;
        }
        let name = call.name.clone().unwrap_or_else(|| "tool".to_string());
        let args = if call.arguments.is_empty() {
            AnyValue::Object(Default::default())
        } else {
            AnyValue::parse(&call.arguments).unwrap_or(AnyValue::Object(Default::default()))
        };
        tracker.function_call(sink, call.id.clone(), &name, args, None);
        call.emitted = true;
    }
}

/// The OpenAI "Codex" request-transform pass. Operates on a Responses-API
/// request body (`input` array of items) and rewrites it in place per
/// SPEC_FULL.md §4.G before POSTing.
pub fn codex_transform(mut body: serde_json::Value, model_id: &str) -> serde_json::Value {
    let obj = body.as_object_mut().expect("codex body must be a JSON object");

    obj.insert("store".to_string(), serde_json::Value::Bool(false));
    obj.insert("stream".to_string(), serde_json::Value::Bool(true));
    obj.remove("max_output_tokens");
    obj.remove("max_completion_tokens");

    let input = obj
        .get_mut("input")
        .and_then(|v| v.as_array_mut())
        .cloned()
        .unwrap_or_default();

    let known_call_ids: std::collections::HashSet<String> = input
        .iter()
        .filter_map(|item| {
            if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                item.get("call_id").and_then(|c| c.as_str()).map(str::to_string)
            } else {
                None
            }
        })
        .collect();

    let mut rewritten = Vec::with_capacity(input.len());
    for mut item in input {
        if let Some(map) = item.as_object_mut() {
            map.remove("id");
            if map.get("type").and_then(|t| t.as_str()) == Some("item_reference") {
                continue;
            }
            if map.get("type").and_then(|t| t.as_str()) == Some("function_call_output") {
                let call_id = map
                    .get("call_id")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !known_call_ids.contains(&call_id) {
                    let tool_name = map
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("tool")
                        .to_string();
                    let output_text = map
                        .get("output")
                        .and_then(|o| o.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let truncated = truncate_output(&output_text);
                    let text = format!("[Previous {tool_name} result; call_id={call_id}]: {truncated}");
                    rewritten.push(serde_json::json!({
                        "type": "message",
                        "role": "assistant",
                        "content": text,
                    }));
                    continue;
                }
            }
        }
        rewritten.push(item);
    }

    obj.insert("input".to_string(), serde_json::Value::Array(rewritten));

    normalize_reasoning_effort(obj, model_id);

    obj.entry("text")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
        .unwrap()
        .entry("verbosity")
        .or_insert_with(|| serde_json::Value::String("medium".to_string()));

    let include = obj
        .entry("include")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()))
        .as_array_mut()
        .unwrap();
    let wants = serde_json::Value::String("reasoning.encrypted_content".to_string());
    if !include.contains(&wants) {
        include.push(wants);
    }

    body
}

const TRUNCATE_LIMIT: usize = 16_000;

fn truncate_output(text: &str) -> String {
    if text.chars().count() <= TRUNCATE_LIMIT {
        return text.to_string();
    }
    let truncated: String = text.chars().take(TRUNCATE_LIMIT).collect();
    format!("{truncated}\n...[truncated]")
}

fn normalize_reasoning_effort(obj: &mut serde_json::Map<String, serde_json::Value>, model_id: &str) {
    let reasoning = obj
        .entry("reasoning")
        .or_insert_with(|| serde_json::json!({}))
        .as_object_mut()
        .unwrap();
    let current = reasoning
        .get("effort")
        .and_then(|e| e.as_str())
        .unwrap_or("medium")
        .to_string();

    let normalized = if model_id.starts_with("gpt-5.2") || model_id.starts_with("gpt-5.3") {
        if current == "minimal" {
            "low"
        } else {
            current.as_str()
        }
    } else if model_id == "gpt-5.1-codex-mini" {
        match current.as_str() {
            "high" | "xhigh" => "high",
            _ => "medium",
        }
    } else if model_id.starts_with("gpt-5.1") {
        if current == "xhigh" {
            "high"
        } else {
            current.as_str()
        }
    } else {
        current.as_str()
    };

    reasoning.insert(
        "effort".to_string(),
        serde_json::Value::String(normalized.to_string()),
    );
}
