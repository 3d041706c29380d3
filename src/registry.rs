//! Process-wide mapping from API tag to vendor adapter entry points.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use crate::error::ProviderError;
use crate::event_stream::EventStream as CoreEventStream;
use crate::model::{Api, AssistantEvent, AssistantMessage, Context, Model, Options, SimpleOptions};

/// The concrete stream type every adapter returns: iterable as an async
/// `Stream<Item = AssistantEvent>` and separately awaitable via `result()`.
pub type BoxedEventStream = CoreEventStream<AssistantEvent, AssistantMessage>;

/// A "full-options" stream constructor: every vendor adapter exposes one.
pub type StreamFn = fn(Model, Context, Options) -> BoxedEventStream;

/// A "simple-options" stream constructor, mapped to the full form internally.
pub type StreamSimpleFn = fn(Model, Context, SimpleOptions) -> BoxedEventStream;

#[derive(Clone, Copy)]
pub struct ProviderEntry {
    pub stream: StreamFn,
    pub stream_simple: StreamSimpleFn,
}

struct RegisteredEntry {
    entry: ProviderEntry,
    source_id: Option<String>,
}

/// An independently-constructible registry. Tests build their own instance
/// instead of sharing the process singleton.
#[derive(Default)]
pub struct Registry {
    entries: HashMap<Api, RegisteredEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, api: Api, entry: ProviderEntry, source_id: Option<&str>) {
        self.entries.insert(
            api,
            RegisteredEntry {
                entry,
                source_id: source_id.map(str::to_string),
            },
        );
    }

    pub fn get(&self, api: Api) -> Option<ProviderEntry> {
        self.entries.get(&api).map(|r| r.entry)
    }

    pub fn all(&self) -> Vec<(Api, ProviderEntry)> {
        self.entries.iter().map(|(api, r)| (*api, r.entry)).collect()
    }

    /// Removes every entry registered with the given `source_id`.
    pub fn unregister(&mut self, source_id: &str) {
        self.entries
            .retain(|_, r| r.source_id.as_deref() != Some(source_id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn has(&self, api: Api) -> bool {
        self.entries.contains_key(&api)
    }
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
static BOOTSTRAP: OnceLock<()> = OnceLock::new();

const BUILT_IN_SOURCE: &str = "built-in";

fn global() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| Mutex::new(Registry::new()))
}

/// Installs the built-in vendor adapters under `sourceId="built-in"`.
/// Idempotent regardless of how many callers race to trigger it.
fn bootstrap() {
    BOOTSTRAP.get_or_init(|| {
        let mut reg = global().lock().unwrap_or_else(|p| p.into_inner());
        #[cfg(feature = "gemini")]
        reg.register(
            Api::Google,
            ProviderEntry {
                stream: crate::adapters::gemini::stream,
                stream_simple: crate::adapters::gemini::stream_simple,
            },
            Some(BUILT_IN_SOURCE),
        );
        #[cfg(feature = "openai")]
        reg.register(
            Api::Openai,
            ProviderEntry {
                stream: crate::adapters::openai::stream,
                stream_simple: crate::adapters::openai::stream_simple,
            },
            Some(BUILT_IN_SOURCE),
        );
        #[cfg(feature = "openai")]
        reg.register(
            Api::OpenaiCodex,
            ProviderEntry {
                stream: crate::adapters::openai_codex::stream,
                stream_simple: crate::adapters::openai_codex::stream_simple,
            },
            Some(BUILT_IN_SOURCE),
        );
        log::debug!("provider registry bootstrap complete");
    });
}

pub fn register(api: Api, entry: ProviderEntry, source_id: Option<&str>) {
    bootstrap();
    log::debug!("registering provider {} (source={:?})", api.as_str(), source_id);
    global()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .register(api, entry, source_id);
}

pub fn get(api: Api) -> Result<ProviderEntry, ProviderError> {
    bootstrap();
    global()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .get(api)
        .ok_or_else(|| ProviderError::Unknown(format!("unknown API: {}", api.as_str())))
}

pub fn all() -> Vec<(Api, ProviderEntry)> {
    bootstrap();
    global().lock().unwrap_or_else(|p| p.into_inner()).all()
}

pub fn unregister(source_id: &str) {
    bootstrap();
    log::debug!("unregistering providers with source={source_id:?}");
    global()
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .unregister(source_id);
}

pub fn clear() {
    log::debug!("clearing provider registry");
    global().lock().unwrap_or_else(|p| p.into_inner()).clear();
}

pub fn has(api: Api) -> bool {
    bootstrap();
    global().lock().unwrap_or_else(|p| p.into_inner()).has(api)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_channel() -> BoxedEventStream {
        let (mut sink, stream) = crate::event_stream::channel(
            AssistantEvent::is_complete,
            |e: &AssistantEvent| e.extract_result(Api::Openai, "test", "test"),
        );
        sink.end(None);
        stream
    }

    fn noop_stream(_: Model, _: Context, _: Options) -> BoxedEventStream {
        noop_channel()
    }

    fn noop_stream_simple(_: Model, _: Context, _: SimpleOptions) -> BoxedEventStream {
        noop_channel()
    }

    fn entry() -> ProviderEntry {
        ProviderEntry {
            stream: noop_stream,
            stream_simple: noop_stream_simple,
        }
    }

    #[test]
    fn register_then_get_returns_same_entry() {
        let mut reg = Registry::new();
        reg.register(Api::Openai, entry(), Some("test"));
        assert!(reg.get(Api::Openai).is_some());
    }

    #[test]
    fn unregister_removes_only_matching_source() {
        let mut reg = Registry::new();
        reg.register(Api::Openai, entry(), Some("a"));
        reg.register(Api::Google, entry(), Some("b"));
        reg.unregister("a");
        assert!(!reg.has(Api::Openai));
        assert!(reg.has(Api::Google));
    }

    #[test]
    fn has_agrees_with_get() {
        let mut reg = Registry::new();
        assert!(!reg.has(Api::Openai));
        assert!(reg.get(Api::Openai).is_none());
        reg.register(Api::Openai, entry(), None);
        assert!(reg.has(Api::Openai));
        assert!(reg.get(Api::Openai).is_some());
    }

    #[test]
    fn global_bootstrap_registers_built_ins_idempotently() {
        bootstrap();
        bootstrap();
        #[cfg(feature = "gemini")]
        assert!(has(Api::Google));
        #[cfg(feature = "openai")]
        assert!(has(Api::Openai));
        #[cfg(feature = "openai")]
        assert!(has(Api::OpenaiCodex));
    }
}
