//! Shared content-block state machine driving the canonical `AssistantEvent`
//! sequence. Used by every vendor adapter so the Start/Delta/End lifecycle,
//! tool-call ID synthesis, and finish-reason/usage bookkeeping stay identical
//! across vendors.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::event_stream::EventSink;
use crate::json::AnyValue;
use crate::model::{
    Api, AssistantEvent, AssistantMessage, ContentBlock, StopReason, ToolCall, Usage,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

pub type Sink = EventSink<AssistantEvent, AssistantMessage>;

/// Drives one request's content-block lifecycle and emits events on `sink`.
pub struct BlockTracker<'a> {
    message: AssistantMessage,
    current: Option<(usize, BlockKind)>,
    known_tool_call_ids: HashSet<String>,
    call_seq: &'a AtomicU64,
}

impl<'a> BlockTracker<'a> {
    pub fn new(api: Api, provider: &str, model: &str, call_seq: &'a AtomicU64) -> Self {
        BlockTracker {
            message: AssistantMessage::empty(api, provider, model),
            current: None,
            known_tool_call_ids: HashSet::new(),
            call_seq,
        }
    }

    pub fn emit_start(&self, sink: &mut Sink) {
        sink.push(AssistantEvent::Start {
            partial: self.message.clone(),
        });
    }

    /// Appends a delta of plain or thinking text, opening/closing blocks as
    /// needed when the kind changes.
    pub fn text_delta(&mut self, sink: &mut Sink, text: &str, is_thinking: bool, signature: Option<String>) {
        if text.is_empty() && signature.is_none() {
            return;
        }
        let kind = if is_thinking {
            BlockKind::Thinking
        } else {
            BlockKind::Text
        };

        let needs_new_block = match self.current {
            Some((_, current_kind)) => current_kind != kind,
            None => true,
        };
        if needs_new_block {
            self.finish_current(sink);
            let index = self.message.content.len();
            self.message.content.push(match kind {
                BlockKind::Text => ContentBlock::Text {
                    body: String::new(),
                    signature: None,
                },
                BlockKind::Thinking => ContentBlock::Thinking {
                    body: String::new(),
                    signature: None,
                },
            });
            self.current = Some((index, kind));
            self.emit_block_start(sink, index, kind);
        }

        let (index, _) = self.current.expect("just opened above");
        match &mut self.message.content[index] {
            ContentBlock::Text { body, signature: sig } | ContentBlock::Thinking { body, signature: sig } => {
                body.push_str(text);
                if let Some(new_sig) = signature {
                    if !new_sig.is_empty() {
                        *sig = Some(new_sig);
                    }
                }
            }
            _ => unreachable!("current block is always text/thinking"),
        }

        self.emit_block_delta(sink, index, kind, text.to_string());
    }

    /// Handles one vendor function-call part: finishes any open block,
    /// resolves/synthesizes the tool-call ID, and emits the full tool-call
    /// lifecycle (start, one delta, end).
    pub fn function_call(
        &mut self,
        sink: &mut Sink,
        vendor_id: Option<String>,
        name: &str,
        arguments: AnyValue,
        signature: Option<String>,
    ) {
        self.finish_current(sink);

        let id = match vendor_id {
            Some(id) if !id.is_empty() && !self.known_tool_call_ids.contains(&id) => id,
            _ => self.synthesize_tool_call_id(name),
        };
        self.known_tool_call_ids.insert(id.clone());

        let index = self.message.content.len();
        self.message.content.push(ContentBlock::ToolCall {
            id: id.clone(),
            name: name.to_string(),
            arguments: arguments.clone(),
            signature: signature.clone(),
        });

        sink.push(AssistantEvent::ToolCallStart {
            content_index: index,
            partial: self.message.clone(),
        });

        let args_json = arguments.encode().unwrap_or_else(|_| "{}".to_string());
        sink.push(AssistantEvent::ToolCallDelta {
            content_index: index,
            delta: args_json,
            partial: self.message.clone(),
        });

        let tool_call = ToolCall {
            id,
            name: name.to_string(),
            arguments,
            signature,
        };
        sink.push(AssistantEvent::ToolCallEnd {
            content_index: index,
            tool_call,
            partial: self.message.clone(),
        });
    }

    fn synthesize_tool_call_id(&self, name: &str) -> String {
        let name = if name.is_empty() { "tool" } else { name };
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let seq = self.call_seq.fetch_add(1, Ordering::Relaxed);
        format!("{name}_{millis}_{seq}")
    }

    /// Maps a vendor finish-reason string onto the canonical [`StopReason`]
    /// and applies the tool-use override.
    pub fn apply_finish_reason(&mut self, reason: &str) {
        self.message.stop_reason = match reason {
            "STOP" => StopReason::Stop,
            "MAX_TOKENS" => StopReason::Length,
            "SAFETY" => StopReason::ContentFilter,
            _ => StopReason::Stop,
        };
        self.message.apply_tool_use_override();
    }

    /// OpenAI-shaped finish reasons (`stop`/`length`/`tool_calls`/`content_filter`).
    pub fn apply_openai_finish_reason(&mut self, reason: &str) {
        self.message.stop_reason = match reason {
            "stop" => StopReason::Stop,
            "length" => StopReason::Length,
            "tool_calls" => StopReason::ToolUse,
            "content_filter" => StopReason::ContentFilter,
            _ => StopReason::Stop,
        };
        self.message.apply_tool_use_override();
    }

    pub fn set_usage(&mut self, usage: Usage) {
        self.message.usage = usage;
    }

    fn finish_current(&mut self, sink: &mut Sink) {
        if let Some((index, kind)) = self.current.take() {
            let content = match &self.message.content[index] {
                ContentBlock::Text { body, .. } | ContentBlock::Thinking { body, .. } => body.clone(),
                _ => unreachable!(),
            };
            self.emit_block_end(sink, index, kind, content);
        }
    }

    fn emit_block_start(&self, sink: &mut Sink, index: usize, kind: BlockKind) {
        let partial = self.message.clone();
        sink.push(match kind {
            BlockKind::Text => AssistantEvent::TextStart {
                content_index: index,
                partial,
            },
            BlockKind::Thinking => AssistantEvent::ThinkingStart {
                content_index: index,
                partial,
            },
        });
    }

    fn emit_block_delta(&self, sink: &mut Sink, index: usize, kind: BlockKind, delta: String) {
        let partial = self.message.clone();
        sink.push(match kind {
            BlockKind::Text => AssistantEvent::TextDelta {
                content_index: index,
                delta,
                partial,
            },
            BlockKind::Thinking => AssistantEvent::ThinkingDelta {
                content_index: index,
                delta,
                partial,
            },
        });
    }

    fn emit_block_end(&self, sink: &mut Sink, index: usize, kind: BlockKind, content: String) {
        let partial = self.message.clone();
        sink.push(match kind {
            BlockKind::Text => AssistantEvent::TextEnd {
                content_index: index,
                content,
                partial,
            },
            BlockKind::Thinking => AssistantEvent::ThinkingEnd {
                content_index: index,
                content,
                partial,
            },
        });
    }

    /// Finishes any open block, then emits the terminal `done` event and
    /// closes the sink. Call when the stream ends without error.
    pub fn finish_success(mut self, sink: &mut Sink) {
        self.finish_current(sink);
        let message = self.message.clone();
        sink.push(AssistantEvent::Done {
            reason: message.stop_reason,
            message: message.clone(),
        });
        sink.end(Some(message));
    }

    /// Finishes any open block, sets the error state, then emits the
    /// terminal `error` event and closes the sink.
    pub fn finish_error(mut self, sink: &mut Sink, aborted: bool, description: String) {
        self.finish_current(sink);
        self.message.stop_reason = if aborted {
            StopReason::Aborted
        } else {
            StopReason::Error
        };
        self.message.error_message = Some(description);
        let message = self.message.clone();
        sink.push(AssistantEvent::Error {
            reason: message.stop_reason,
            message: message.clone(),
        });
        sink.end(Some(message));
    }
}
