//! Chat relay: session resolution, prompt priming, and fragment re-framing.
//!
//! Each request runs as one spawned task that owns the session lock for the
//! length of the turn and pushes [`RelayEvent`]s into a bounded channel. The
//! HTTP layer drains the channel as an SSE body. When the client goes away the
//! channel closes, the task notices, and the upstream stream is dropped.

use crate::provider::{Provider, ProviderError, Turn};
use crate::session::{SessionRegistry, DEFAULT_SESSION_ID};
use advisor_common::util::truncate_with_ellipsis;
use futures_util::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Events buffered between the upstream reader and the client.
const EVENT_BUFFER: usize = 32;

/// Characters of the outbound prompt included in logs.
const LOG_PREVIEW_CHARS: usize = 100;

/// Body of `POST /api/chat`.
///
/// Every field is optional; absent or `null` values fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Calculator snapshot sent by the frontend. Accepted but not read; the
    /// frontend already folds it into `systemPrompt`.
    #[serde(default)]
    pub dti_data: Option<serde_json::Value>,
    #[serde(default)]
    pub reset: Option<bool>,
}

impl ChatRequest {
    pub fn session_id(&self) -> &str {
        self.session_id.as_deref().unwrap_or(DEFAULT_SESSION_ID)
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or_default()
    }

    pub fn reset(&self) -> bool {
        self.reset.unwrap_or(false)
    }
}

/// One frame of the outgoing event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// A non-empty fragment of generated text
    Chunk(String),
    /// The upstream stream finished normally
    End,
    /// The turn failed; no further events follow
    Error(String),
}

impl RelayEvent {
    /// SSE `event:` name; `None` for plain data frames.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            Self::Chunk(_) => None,
            Self::End => Some("end"),
            Self::Error(_) => Some("error"),
        }
    }

    /// JSON payload carried in the `data:` field.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            Self::Chunk(text) => serde_json::json!({ "chunk": text }),
            Self::End => serde_json::json!({}),
            Self::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}

/// Build the first message of a session: system prompt followed by the user
/// turn in role-marker form.
pub fn compose_primed_message(system_prompt: &str, message: &str) -> String {
    format!("{system_prompt}\n\nUSER: {message}\nASSISTANT:")
}

enum TurnOutcome {
    Completed { reply: String, fragments: usize },
    Cancelled { fragments: usize },
}

/// Request handler state shared by every connection.
#[derive(Clone)]
pub struct ChatRelay {
    registry: Arc<SessionRegistry>,
    provider: Arc<dyn Provider>,
}

impl ChatRelay {
    pub fn new(registry: Arc<SessionRegistry>, provider: Arc<dyn Provider>) -> Self {
        Self { registry, provider }
    }

    /// Start a turn and return its event stream.
    ///
    /// The stream always ends with exactly one terminal event unless the
    /// receiver is dropped first.
    pub fn handle(&self, request: ChatRequest, trace_id: &str) -> ReceiverStream<RelayEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let span = advisor_common::request_span!(
            "chat",
            trace_id,
            session_id = %request.session_id(),
            provider = %self.provider.name()
        );

        let relay = self.clone();
        tokio::spawn(async move { relay.run_turn(request, tx).await }.instrument(span));

        ReceiverStream::new(rx)
    }

    async fn run_turn(&self, request: ChatRequest, tx: mpsc::Sender<RelayEvent>) {
        let started = Instant::now();
        let handle = self
            .registry
            .resolve(request.session_id(), request.reset())
            .await;
        let mut session = handle.lock().await;

        let outbound = if session.primed {
            request.message().to_string()
        } else {
            tracing::info!("Prepending system prompt");
            session.primed = true;
            compose_primed_message(request.system_prompt(), request.message())
        };

        tracing::info!(
            has_dti_data = request.dti_data.is_some(),
            history_turns = session.conversation.history().len(),
            "Sending message (streaming): {}",
            truncate_with_ellipsis(&outbound, LOG_PREVIEW_CHARS)
        );

        let outcome = self
            .stream_turn(session.conversation.history(), &outbound, &tx)
            .await;

        match outcome {
            Ok(TurnOutcome::Completed { reply, fragments }) => {
                // An empty model turn is rejected upstream on replay
                if reply.is_empty() {
                    tracing::warn!("Upstream returned no text, turn not recorded");
                } else {
                    session.conversation.record(outbound, reply);
                }
                let _ = tx.send(RelayEvent::End).await;
                tracing::info!(
                    fragments,
                    duration_ms = started.elapsed().as_millis() as u64,
                    session_age_secs = session.age().as_secs(),
                    "Stream finished"
                );
            }
            Ok(TurnOutcome::Cancelled { fragments }) => {
                tracing::warn!(
                    fragments,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Client disconnected, upstream stream dropped"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    status_code = ?e.status_code,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Chat stream failed"
                );
                let _ = tx.send(RelayEvent::Error(e.message)).await;
            }
        }
    }

    /// Pull fragments from upstream and forward the non-empty ones in order.
    async fn stream_turn(
        &self,
        history: &[Turn],
        outbound: &str,
        tx: &mpsc::Sender<RelayEvent>,
    ) -> Result<TurnOutcome, ProviderError> {
        let mut fragments = tokio::select! {
            _ = tx.closed() => return Ok(TurnOutcome::Cancelled { fragments: 0 }),
            stream = self.provider.stream_chat(history, outbound) => stream?,
        };

        let mut reply = String::new();
        let mut forwarded = 0;

        loop {
            let next = tokio::select! {
                _ = tx.closed() => return Ok(TurnOutcome::Cancelled { fragments: forwarded }),
                next = fragments.next() => next,
            };

            let text = match next {
                Some(Ok(text)) => text,
                Some(Err(e)) => return Err(e),
                None => break,
            };

            if text.is_empty() {
                continue;
            }

            reply.push_str(&text);
            if tx.send(RelayEvent::Chunk(text)).await.is_err() {
                return Ok(TurnOutcome::Cancelled { fragments: forwarded });
            }
            forwarded += 1;
        }

        Ok(TurnOutcome::Completed {
            reply,
            fragments: forwarded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Script, ScriptedProvider};
    use advisor_common::config::SessionsConfig;

    fn relay_with(provider: Arc<ScriptedProvider>) -> ChatRelay {
        let registry = Arc::new(SessionRegistry::new(&SessionsConfig::default()));
        ChatRelay::new(registry, provider)
    }

    fn request(session: &str, message: &str) -> ChatRequest {
        ChatRequest {
            session_id: Some(session.into()),
            message: Some(message.into()),
            system_prompt: Some("You are a mortgage coach.".into()),
            ..Default::default()
        }
    }

    async fn run(relay: &ChatRelay, request: ChatRequest) -> Vec<RelayEvent> {
        relay.handle(request, "trace").collect().await
    }

    #[test]
    fn test_compose_primed_message() {
        assert_eq!(
            compose_primed_message("SYS", "hi"),
            "SYS\n\nUSER: hi\nASSISTANT:"
        );
        assert_eq!(compose_primed_message("", ""), "\n\nUSER: \nASSISTANT:");
    }

    #[test]
    fn test_request_defaults() {
        let request: ChatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.session_id(), "default");
        assert_eq!(request.message(), "");
        assert_eq!(request.system_prompt(), "");
        assert!(!request.reset());

        let nulls: ChatRequest =
            serde_json::from_str(r#"{"sessionId":null,"message":null,"reset":null}"#).unwrap();
        assert_eq!(nulls.session_id(), "default");
        assert_eq!(nulls.message(), "");
    }

    #[test]
    fn test_event_payloads() {
        assert_eq!(RelayEvent::Chunk("x".into()).payload(), serde_json::json!({"chunk": "x"}));
        assert_eq!(RelayEvent::End.payload(), serde_json::json!({}));
        assert_eq!(RelayEvent::End.name(), Some("end"));
        assert_eq!(RelayEvent::Error("boom".into()).name(), Some("error"));
        assert!(RelayEvent::Chunk("x".into()).name().is_none());
    }

    #[tokio::test]
    async fn test_first_turn_primes_then_verbatim() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::fragments(&["Hello"]),
            Script::fragments(&["Again"]),
        ]));
        let relay = relay_with(provider.clone());

        run(&relay, request("s1", "What is DTI?")).await;
        run(&relay, request("s1", "And PMI?")).await;

        let calls = provider.calls().await;
        assert_eq!(
            calls[0].message,
            "You are a mortgage coach.\n\nUSER: What is DTI?\nASSISTANT:"
        );
        assert!(calls[0].history.is_empty());
        assert_eq!(calls[1].message, "And PMI?");
        assert_eq!(
            calls[1].history,
            vec![Turn::user(calls[0].message.clone()), Turn::model("Hello")]
        );
    }

    #[tokio::test]
    async fn test_fragments_then_end_in_order() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::fragments(&[
            "a", "", "b", "c",
        ])]));
        let relay = relay_with(provider);

        let events = run(&relay, request("s", "q")).await;
        assert_eq!(
            events,
            vec![
                RelayEvent::Chunk("a".into()),
                RelayEvent::Chunk("b".into()),
                RelayEvent::Chunk("c".into()),
                RelayEvent::End,
            ]
        );
    }

    #[tokio::test]
    async fn test_mid_stream_failure_emits_single_error() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::fail_after(
            &["f1", "f2"],
            "connection reset",
        )]));
        let relay = relay_with(provider);

        let events = run(&relay, request("s", "q")).await;
        assert_eq!(
            events,
            vec![
                RelayEvent::Chunk("f1".into()),
                RelayEvent::Chunk("f2".into()),
                RelayEvent::Error("connection reset".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_turn_keeps_primed_but_not_history() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::reject("quota exceeded"),
            Script::fragments(&["ok"]),
        ]));
        let relay = relay_with(provider.clone());

        let events = run(&relay, request("s", "first")).await;
        assert_eq!(events, vec![RelayEvent::Error("quota exceeded".into())]);

        run(&relay, request("s", "second")).await;
        let calls = provider.calls().await;
        assert_eq!(calls[1].message, "second");
        assert!(calls[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_empty_reply_is_not_recorded() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::fragments(&[""]),
            Script::fragments(&["ok"]),
        ]));
        let relay = relay_with(provider.clone());

        let events = run(&relay, request("s", "a")).await;
        assert_eq!(events, vec![RelayEvent::End]);

        run(&relay, request("s", "b")).await;
        let calls = provider.calls().await;
        assert_eq!(calls[1].message, "b");
        assert!(calls[1].history.iter().all(|turn| !turn.text.is_empty()));
        assert!(calls[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_reset_reprimes_session() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Script::fragments(&["one"]),
            Script::fragments(&["two"]),
        ]));
        let relay = relay_with(provider.clone());

        run(&relay, request("s", "first")).await;
        let mut again = request("s", "fresh start");
        again.reset = Some(true);
        run(&relay, again).await;

        let calls = provider.calls().await;
        assert!(calls[1].message.ends_with("USER: fresh start\nASSISTANT:"));
        assert!(calls[1].history.is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_drops_upstream() {
        let provider = Arc::new(ScriptedProvider::new(vec![Script::stall_after(&["first"])]));
        let relay = relay_with(provider.clone());

        let mut events = relay.handle(request("s", "q"), "trace");
        assert_eq!(events.next().await, Some(RelayEvent::Chunk("first".into())));
        drop(events);

        let dropped = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while !provider.upstream_dropped() {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(dropped.is_ok(), "upstream stream was not dropped");
    }
}
