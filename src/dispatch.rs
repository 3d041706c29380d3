//! Single entry point callers use to invoke a vendor adapter.

use crate::model::{Api, AssistantEvent, Context, Model, Options, SimpleOptions, StopReason, Usage};
use crate::registry::{self, BoxedEventStream};

fn single_event_stream(event: AssistantEvent, api: Api, provider: String, model_id: String) -> BoxedEventStream {
    let (mut sink, stream) = crate::event_stream::channel(AssistantEvent::is_complete, move |e: &AssistantEvent| {
        e.extract_result(api, &provider, &model_id)
    });
    sink.push(event);
    sink.end(None);
    stream
}

fn env_key_for(provider: &str) -> Option<String> {
    let var = format!("{}_API_KEY", provider.to_uppercase().replace('-', "_"));
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn resolve_api_key(model: &Model, options_key: Option<&str>) -> String {
    if let Some(key) = options_key {
        if !key.is_empty() {
            return key.to_string();
        }
    }
    env_key_for(&model.provider).unwrap_or_default()
}

fn unknown_api_stream(model: &Model, message: String) -> BoxedEventStream {
    let mut msg = crate::model::AssistantMessage::empty(model.api, &model.provider, &model.id);
    msg.stop_reason = StopReason::Error;
    msg.usage = Usage::default();
    msg.error_message = Some(message);
    let event = AssistantEvent::Error {
        reason: StopReason::Error,
        message: msg,
    };
    single_event_stream(event, model.api, model.provider.clone(), model.id.clone())
}

/// Resolves the adapter for `model.api`, resolves the API key, and invokes
/// the adapter's full-options stream constructor.
pub fn stream(model: Model, context: Context, mut options: Options) -> BoxedEventStream {
    let entry = match registry::get(model.api) {
        Ok(entry) => entry,
        Err(e) => return unknown_api_stream(&model, e.to_string()),
    };
    let resolved_key = resolve_api_key(&model, options.api_key.as_deref());
    options.api_key = Some(resolved_key);
    (entry.stream)(model, context, options)
}

/// As [`stream`], but accepting the reduced [`SimpleOptions`].
pub fn stream_simple(model: Model, context: Context, options: SimpleOptions) -> BoxedEventStream {
    let entry = match registry::get(model.api) {
        Ok(entry) => entry,
        Err(e) => return unknown_api_stream(&model, e.to_string()),
    };
    let mut options = options;
    let resolved_key = resolve_api_key(&model, options.api_key.as_deref());
    options.api_key = Some(resolved_key);
    (entry.stream_simple)(model, context, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Modality, Pricing};
    use futures::StreamExt;

    fn fake_model(api: Api) -> Model {
        Model {
            id: "fake-model".into(),
            name: "Fake".into(),
            api,
            provider: "nonexistent-vendor".into(),
            base_url: "https://example.invalid".into(),
            reasoning: false,
            modalities: vec![Modality::Text],
            pricing: Pricing::default(),
            context_window: 1000,
            max_output_tokens: 100,
            default_headers: Default::default(),
        }
    }

    #[test]
    fn env_key_resolution_prefers_options_key() {
        let model = fake_model(Api::Openai);
        assert_eq!(resolve_api_key(&model, Some("explicit")), "explicit");
    }

    #[test]
    fn env_key_resolution_falls_back_to_empty() {
        let model = fake_model(Api::Openai);
        assert_eq!(resolve_api_key(&model, None), "");
    }

    #[tokio::test]
    async fn unknown_api_surfaces_as_error_event() {
        // `Api::GoogleVertex` has no built-in registration in this crate's
        // bootstrap, so dispatch must surface an error terminal rather than panic.
        let model = fake_model(Api::GoogleVertex);
        let mut s = stream(model, Context::default(), Options::default());
        let event = s.next().await.expect("one event");
        match event {
            AssistantEvent::Error { reason, message } => {
                assert_eq!(reason, StopReason::Error);
                assert!(message.error_message.is_some());
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert!(s.next().await.is_none());
    }
}
