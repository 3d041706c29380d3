//! End-to-end integration test driving the public `stream` entry point
//! through the real registry bootstrap and the Google adapter against a
//! mock HTTP server.

use futures::StreamExt;
use llmstream::model::{Context, Modality, Model, Pricing, Role, Turn};
use llmstream::{stream, AssistantEvent, Options};
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn model(base_url: String) -> Model {
    Model {
        id: "gemini-2.5-flash".to_string(),
        name: "Gemini 2.5 Flash".to_string(),
        api: llmstream::Api::Google,
        provider: "google".to_string(),
        base_url,
        reasoning: true,
        modalities: vec![Modality::Text],
        pricing: Pricing::default(),
        context_window: 1_000_000,
        max_output_tokens: 8192,
        default_headers: Default::default(),
    }
}

#[tokio::test]
async fn dispatch_resolves_registry_entry_and_streams_to_done() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]},",
        "\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,",
        "\"candidatesTokenCount\":1,\"totalTokenCount\":2}}\n\n",
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

    let context = Context {
        system_prompt: None,
        turns: vec![Turn {
            role: Role::User,
            content: "hello".to_string(),
            tool_call_id: None,
            tool_calls: None,
        }],
        tools: None,
        tool_choice: None,
    };

    let mut options = Options::default();
    options.api_key = Some("test-key".to_string());

    let out = stream(model(server.uri()), context, options);
    let message = out.result().await;
    assert_eq!(message.stop_reason, llmstream::StopReason::Stop);
    assert_eq!(message.usage.total_tokens, 2);
}

#[tokio::test]
async fn result_and_iterator_agree_on_terminal_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"/models/.*:streamGenerateContent"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let context = Context::default();
    let mut options = Options::default();
    options.api_key = Some("wrong-key".to_string());

    let mut out = stream(model(server.uri()), context, options);
    let mut last_event_message = None;
    while let Some(event) = out.next().await {
        if let AssistantEvent::Error { message, .. } = event {
            last_event_message = Some(message);
        }
    }
    let result_message = out.result().await;
    assert_eq!(last_event_message.unwrap().error_message, result_message.error_message);
    assert_eq!(result_message.error_message.as_deref(), Some("bad key"));
}
