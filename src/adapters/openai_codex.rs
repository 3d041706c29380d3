//! OpenAI "Codex" adapter: drives the Responses API streaming state machine
//! against a request body rewritten by [`super::openai::codex_transform`]
//! (SPEC_FULL.md §4.G/§6). Registered under `Api::OpenaiCodex`.
//!
//! Request/response shapes follow the Responses API's public streaming
//! event contract; this crate has no prior Codex-shaped streaming code to
//! mirror, so the wire types below are kept minimal — just enough to drive
//! the shared content-block state machine in `crate::blocks`.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;

use serde::Deserialize;
use serde_json::json;

use crate::adapters::openai::codex_transform;
use crate::blocks::BlockTracker;
use crate::error::ProviderError;
use crate::event_stream::channel;
use crate::json::AnyValue;
use crate::model::{Api, AssistantEvent, Context, Model, Options, Role, SimpleOptions, Usage};
use crate::registry::BoxedEventStream;

static CALL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseStreamEvent {
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { delta: String },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningDelta { delta: String },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        item_id: String,
        delta: String,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ResponseOutputItem },
    #[serde(rename = "response.completed")]
    Completed { response: ResponseCompleted },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ResponseCompleted },
    #[serde(rename = "response.failed")]
    Failed { response: ResponseCompleted },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseOutputItem {
    #[serde(rename = "function_call")]
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseCompleted {
    #[serde(default)]
    usage: Option<ResponseUsage>,
    #[serde(default)]
    error: Option<ResponseError>,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ResponseError {
    message: String,
}

/// Accumulates function-call argument deltas keyed by `item_id` until the
/// item's `response.output_item.done` event supplies the finished call.
#[derive(Default)]
struct PendingCall {
    arguments: String,
}

fn build_request_body(model: &Model, context: &Context, options: &Options) -> serde_json::Value {
    let mut input = Vec::new();
    for turn in &context.turns {
        match turn.role {
            Role::System => input.push(json!({"type": "message", "role": "system", "content": turn.content})),
            Role::User => input.push(json!({"type": "message", "role": "user", "content": turn.content})),
            Role::Assistant => {
                if !turn.content.is_empty() {
                    input.push(json!({"type": "message", "role": "assistant", "content": turn.content}));
                }
                if let Some(calls) = &turn.tool_calls {
                    for call in calls {
                        input.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.name,
                            "arguments": call.arguments.encode().unwrap_or_else(|_| "{}".to_string()),
                        }));
                    }
                }
            }
            Role::Tool => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": turn.tool_call_id.clone().unwrap_or_default(),
                    "output": turn.content,
                }));
            }
        }
    }

    let mut body = json!({
        "model": model.id,
        "input": input,
        "stream": true,
    });

    if let Some(system) = &context.system_prompt {
        body["instructions"] = json!(system);
    }
    if let Some(tools) = &context.tools {
        let tools: Vec<_> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters.to_raw().unwrap_or(serde_json::Value::Null),
                })
            })
            .collect();
        body["tools"] = serde_json::Value::Array(tools);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = options.temperature {
        body["temperature"] = json!(temperature);
    }

    codex_transform(body, &model.id)
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
    let url = format!("{}/responses", model.base_url.trim_end_matches('/'));

    let client = reqwest::Client::new();
    let mut request = client.post(&url).bearer_auth(&api_key);
    for (k, v) in &headers {
        request = request.header(k, v);
    }
    request = request
        .header("Content-Type", "application/json")
        .header("Accept", "text/event-stream");

    log::debug!("openai-codex request: POST {url}");

    let response = match request.json(&body).send().await {
        Ok(r) => r,
        Err(e) => {
            log::error!("openai-codex request failed: {e}");
            tracker.finish_error(sink, false, e.to_string());
            return;
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let body_text = crate::sse::drain_error_body(response).await;
        log::warn!("openai-codex vendor error ({status}): {body_text}");
        tracker.finish_error(sink, false, body_text);
        return;
    }

    tracker.emit_start(sink);

    let mut payloads = Box::pin(crate::sse::sse_payloads(response, options.signal.clone()));
    use futures::StreamExt;

    let mut pending: HashMap<String, PendingCall> = HashMap::new();
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

        let event: ResponseStreamEvent = match serde_json::from_str(&payload) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("skipping undecodable openai-codex SSE payload: {e}");
                continue;
            }
        };

        match event {
            ResponseStreamEvent::OutputTextDelta { delta } => {
                tracker.text_delta(sink, &delta, false, None);
            }
            ResponseStreamEvent::ReasoningDelta { delta } => {
                tracker.text_delta(sink, &delta, true, None);
            }
            ResponseStreamEvent::FunctionCallArgumentsDelta { item_id, delta } => {
                let entry = pending.entry(item_id).or_default();
                entry.arguments.push_str(&delta);
            }
            ResponseStreamEvent::OutputItemDone {
                item: ResponseOutputItem::FunctionCall { call_id, name, arguments },
            } => {
                let accumulated = pending.remove(&call_id).map(|p| p.arguments).unwrap_or_default();
                let raw_args = if arguments.is_empty() { accumulated } else { arguments };
                let args = if raw_args.is_empty() {
                    AnyValue::Object(Default::default())
                } else {
                    AnyValue::parse(&raw_args).unwrap_or(AnyValue::Object(Default::default()))
                };
                tracker.function_call(sink, Some(call_id), &name, args, None);
            }
            ResponseStreamEvent::OutputItemDone { item: ResponseOutputItem::Other } => {}
            ResponseStreamEvent::Completed { response } => {
                if let Some(usage) = response.usage {
                    tracker.set_usage(Usage {
                        input: usage.input_tokens,
                        output: usage.output_tokens,
                        cache_read: 0,
                        cache_write: 0,
                        total_tokens: usage.total_tokens,
                        cost: None,
                    });
                }
                tracker.apply_openai_finish_reason("stop");
            }
            ResponseStreamEvent::Incomplete { response } | ResponseStreamEvent::Failed { response } => {
                let message = response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "response did not complete".to_string());
                log::warn!("openai-codex vendor error: {message}");
                tracker.finish_error(sink, false, message);
                saw_error = true;
                break;
            }
            ResponseStreamEvent::Error { message } => {
                log::warn!("openai-codex vendor error: {message}");
                tracker.finish_error(sink, false, message);
                saw_error = true;
                break;
            }
            ResponseStreamEvent::Other => {}
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_model(base_url: String) -> Model {
        Model {
            id: "gpt-5.1-codex-mini".into(),
            name: "Codex Mini".into(),
            api: Api::OpenaiCodex,
            provider: "openai".into(),
            base_url,
            reasoning: true,
            modalities: vec![Modality::Text],
            pricing: Pricing::default(),
            context_window: 200_000,
            max_output_tokens: 16_000,
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
    async fn text_delta_and_completion_yields_done() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"Hi\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"usage\":",
            "{\"input_tokens\":3,\"output_tokens\":2,\"total_tokens\":5}}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let model = test_model(server.uri());
        let mut options = Options::default();
        options.api_key = Some("sk-test".to_string());
        let mut out = stream(model, ctx("hi"), options);

        let mut events = Vec::new();
        while let Some(e) = out.next().await {
            events.push(e);
        }
        match events.last().unwrap() {
            AssistantEvent::Done { message, .. } => {
                assert_eq!(message.stop_reason, crate::model::StopReason::Stop);
                assert_eq!(message.usage.total_tokens, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn function_call_assembled_from_argument_deltas() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"type\":\"response.function_call_arguments.delta\",",
            "\"item_id\":\"call_1\",\"delta\":\"{\\\"q\\\":\"}\n\n",
            "data: {\"type\":\"response.function_call_arguments.delta\",",
            "\"item_id\":\"call_1\",\"delta\":\"\\\"cats\\\"}\"}\n\n",
            "data: {\"type\":\"response.output_item.done\",\"item\":",
            "{\"type\":\"function_call\",\"call_id\":\"call_1\",\"name\":\"search\",\"arguments\":\"\"}}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/responses"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let model = test_model(server.uri());
        let mut options = Options::default();
        options.api_key = Some("sk-test".to_string());
        let mut out = stream(model, ctx("hi"), options);

        let mut events = Vec::new();
        while let Some(e) = out.next().await {
            events.push(e);
        }
        match events.last().unwrap() {
            AssistantEvent::Done { message, .. } => {
                assert_eq!(message.stop_reason, crate::model::StopReason::ToolUse);
                match &message.content[0] {
                    crate::model::ContentBlock::ToolCall { id, name, arguments, .. } => {
                        assert_eq!(id, "call_1");
                        assert_eq!(name, "search");
                        assert_eq!(arguments.encode().unwrap(), "{\"q\":\"cats\"}");
                    }
                    other => panic!("unexpected block {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn build_request_body_applies_codex_transform() {
        let model = test_model("https://api.openai.com/v1".to_string());
        let body = build_request_body(&model, &ctx("hi"), &Options::default());
        assert_eq!(body["store"], false);
        assert_eq!(body["stream"], true);
        assert!(body.get("max_output_tokens").is_none());
    }
}
