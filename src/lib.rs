//! Provider-agnostic streaming client library for LLM chat APIs.
//!
//! See `stream`/`stream_simple` in [`dispatch`] for the entry point.

pub mod adapters;
pub mod blocks;
pub mod dispatch;
pub mod error;
pub mod event_stream;
pub mod json;
pub mod model;
pub mod model_table;
pub mod registry;
pub mod sanitize;
pub mod sse;

pub use dispatch::{stream, stream_simple};
pub use error::ProviderError;
pub use json::AnyValue;
pub use model::{
    Api, AssistantEvent, AssistantMessage, ContentBlock, Context, Model, Options, Role,
    SimpleOptions, StopReason, Turn, Usage,
};
pub use sanitize::sanitize_surrogates;
