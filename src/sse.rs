//! Turns a chunked byte stream into a lazy sequence of SSE `data:` payloads.
//!
//! A thin wrapper over `eventsource-stream`'s `.eventsource()` extension
//! trait (already used by this crate's vendor adapters) that adds
//! cooperative cancellation and a drain-to-bytes helper for non-2xx bodies.

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Response;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// Wraps `response.bytes_stream()` into a stream of SSE `data:` payload
/// strings, checking `signal` between events.
///
/// Comment lines (`:` prefix) and non-`data:` fields are already dropped by
/// `eventsource-stream`; this only adds the cancellation check and maps
/// transport errors into [`ProviderError`].
pub fn sse_payloads(
    response: Response,
    signal: Option<CancellationToken>,
) -> impl Stream<Item = Result<String, ProviderError>> {
    let mut source = response.bytes_stream().eventsource();

    async_stream::stream! {
        loop {
            if let Some(signal) = &signal {
                if signal.is_cancelled() {
                    yield Err(ProviderError::Aborted);
                    return;
                }
            }

            let next = if let Some(signal) = &signal {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => {
                        yield Err(ProviderError::Aborted);
                        return;
                    }
                    item = source.next() => item,
                }
            } else {
                source.next().await
            };

            match next {
                None => return,
                Some(Ok(event)) => yield Ok(event.data),
                Some(Err(e)) => {
                    yield Err(ProviderError::Unknown(e.to_string()));
                    return;
                }
            }
        }
    }
}

/// Drains a non-2xx response body into a string, used to build an
/// `apiError`/`invalidResponse` message.
pub async fn drain_error_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => decode_lossy(&bytes),
        Err(e) => format!("<failed to read error body: {e}>"),
    }
}

fn decode_lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn parses_data_aggregations_and_ignores_comments() {
        let server = MockServer::start().await;
        let body = "event: message\ndata: {\"a\":1}\n\n: a comment\ndata: {\"b\":2}\n\n";
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let response = reqwest::get(format!("{}/sse", server.uri())).await.unwrap();
        let mut stream = Box::pin(sse_payloads(response, None));
        let mut payloads = Vec::new();
        while let Some(item) = stream.next().await {
            payloads.push(item.unwrap());
        }
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[tokio::test]
    async fn cancellation_aborts_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sse"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string("data: {\"a\":1}\n\n"),
            )
            .mount(&server)
            .await;

        let response = reqwest::get(format!("{}/sse", server.uri())).await.unwrap();
        let signal = CancellationToken::new();
        signal.cancel();
        let mut stream = Box::pin(sse_payloads(response, Some(signal)));
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(ProviderError::Aborted)));
    }
}
