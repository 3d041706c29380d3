//! Single-producer event stream: iterable as an async `Stream` and separately
//! awaitable as a one-shot `result()`.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use tokio::sync::{mpsc, Notify};

/// Shared state backing both the iterator and the `result()` awaitable.
struct Shared<R> {
    result: Mutex<Option<R>>,
    notify: Notify,
}

/// The producer handle: the adapter task owns this and calls [`push`]/[`end`].
///
/// [`push`]: EventSink::push
/// [`end`]: EventSink::end
pub struct EventSink<E, R> {
    tx: mpsc::UnboundedSender<E>,
    shared: Arc<Shared<R>>,
    is_complete: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    extract_result: Arc<dyn Fn(&E) -> R + Send + Sync>,
    closed: bool,
}

/// The consumer handle: an async [`Stream`] of elements plus an awaitable
/// [`EventStream::result`].
pub struct EventStream<E, R> {
    rx: mpsc::UnboundedReceiver<E>,
    shared: Arc<Shared<R>>,
}

/// Builds a linked producer/consumer pair.
///
/// `is_complete` identifies terminal elements; `extract_result` projects the
/// aggregated result from one. Both run on the producer side only, never
/// under the result mutex.
pub fn channel<E, R>(
    is_complete: impl Fn(&E) -> bool + Send + Sync + 'static,
    extract_result: impl Fn(&E) -> R + Send + Sync + 'static,
) -> (EventSink<E, R>, EventStream<E, R>)
where
    E: Send + 'static,
    R: Clone + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        result: Mutex::new(None),
        notify: Notify::new(),
    });
    let sink = EventSink {
        tx,
        shared: shared.clone(),
        is_complete: Arc::new(is_complete),
        extract_result: Arc::new(extract_result),
        closed: false,
    };
    let stream = EventStream { rx, shared };
    (sink, stream)
}

impl<E, R> EventSink<E, R>
where
    R: Clone,
{
    /// Pushes an element. No-op once closed. If the element is terminal and no
    /// result has yet been recorded, records one and wakes any `result()`
    /// awaiter *after* releasing the lock.
    pub fn push(&mut self, element: E) {
        if self.closed {
            return;
        }
        if (self.is_complete)(&element) {
            let result = (self.extract_result)(&element);
            let newly_set = {
                let mut slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
                if slot.is_none() {
                    *slot = Some(result);
                    true
                } else {
                    false
                }
            };
            if newly_set {
                self.shared.notify.notify_waiters();
            }
        }
        // A send error means the consumer was dropped; that's fine, we still
        // recorded the result above if this was the terminal element.
        let _ = self.tx.send(element);
    }

    /// Closes the stream. If `result` is supplied and none was recorded yet,
    /// records it and wakes any awaiter. Idempotent in effect, though callers
    /// should call it at most once.
    pub fn end(&mut self, result: Option<R>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(result) = result {
            let newly_set = {
                let mut slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
                if slot.is_none() {
                    *slot = Some(result);
                    true
                } else {
                    false
                }
            };
            if newly_set {
                self.shared.notify.notify_waiters();
            }
        }
        // Dropping `tx` happens naturally when the sink is dropped; there's no
        // explicit "close" on an unbounded sender beyond that.
    }
}

impl<E, R> EventStream<E, R>
where
    R: Clone,
{
    /// Returns the recorded result, suspending until one is produced by
    /// `push` or `end` if none exists yet. Safe to call repeatedly and
    /// concurrently; every caller observes the same value.
    pub async fn result(&self) -> R {
        loop {
            {
                let slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(result) = slot.as_ref() {
                    return result.clone();
                }
            }
            // Subscribe before re-checking to avoid missing a notification
            // that fires between the check above and this await.
            let notified = self.shared.notify.notified();
            {
                let slot = self.shared.result.lock().unwrap_or_else(|p| p.into_inner());
                if let Some(result) = slot.as_ref() {
                    return result.clone();
                }
            }
            notified.await;
        }
    }
}

impl<E, R> Stream for EventStream<E, R> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
