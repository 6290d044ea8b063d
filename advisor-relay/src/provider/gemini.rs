//! Google Gemini streaming provider.
//!
//! Talks to `models/{model}:streamGenerateContent?alt=sse` and turns each SSE
//! payload into one text fragment.

use super::{FragmentStream, Provider, ProviderError, Role, Turn};
use advisor_common::config::LlmConfig;
use advisor_common::util::{sanitize_for_log, truncate_with_ellipsis};
use async_trait::async_trait;
use eventsource_client as es;
use eventsource_client::Client as _;
use futures_util::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const PROVIDER_NAME: &str = "gemini";

/// Every harm category the API lets callers tune.
const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Finish reasons that mean the candidate was cut off by policy.
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// Longest upstream error body forwarded into an error message.
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Gemini provider bound to one model configuration.
pub struct GeminiProvider {
    api_key: String,
    config: LlmConfig,
}

// ══════════════════════════════════════════════════════════════════════════════
// API REQUEST/RESPONSE TYPES
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: Role,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    top_k: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting<'a> {
    category: &'static str,
    threshold: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

/// Body of a non-2xx response.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

impl GeminiProvider {
    /// Create a provider for the configured model.
    pub fn new(api_key: impl Into<String>, config: LlmConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
        }
    }

    fn stream_url(&self) -> String {
        let model_path = if self.config.model.starts_with("models/") {
            self.config.model.clone()
        } else {
            format!("models/{}", self.config.model)
        };

        format!(
            "{}/{model_path}:streamGenerateContent?alt=sse",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn build_request<'a>(&'a self, history: &'a [Turn], message: &'a str) -> GenerateContentRequest<'a> {
        let contents = history
            .iter()
            .map(|turn| Content {
                role: turn.role,
                parts: vec![Part { text: &turn.text }],
            })
            .chain(std::iter::once(Content {
                role: Role::User,
                parts: vec![Part { text: message }],
            }))
            .collect();

        GenerateContentRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                top_p: self.config.top_p,
                top_k: self.config.top_k,
            },
            safety_settings: HARM_CATEGORIES
                .iter()
                .map(|category| SafetySetting {
                    category: *category,
                    threshold: &self.config.safety_threshold,
                })
                .collect(),
        }
    }

    /// One-shot SSE client for a single completion request.
    fn event_source(&self, body: String) -> Result<impl es::Client, es::Error> {
        let client = es::ClientBuilder::for_url(&self.stream_url())?
            .header("x-goog-api-key", &self.api_key)?
            .header("content-type", "application/json")?
            .method("POST".into())
            .body(body)
            .connect_timeout(Duration::from_secs(self.config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(self.config.read_timeout_secs))
            .reconnect(
                es::ReconnectOptions::reconnect(false)
                    .retry_initial(false)
                    .build(),
            )
            .build();

        Ok(client)
    }

    /// Map a failure seen before the first event.
    async fn connect_error(&self, err: es::Error) -> ProviderError {
        match err {
            es::Error::UnexpectedResponse(response, body) => {
                let status = response.status();
                let text = body
                    .body_bytes()
                    .await
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                let detail = serde_json::from_str::<ErrorEnvelope>(&text)
                    .map(|env| env.error.message)
                    .unwrap_or_else(|_| truncate_with_ellipsis(text.trim(), MAX_ERROR_BODY_CHARS));

                self.error(format!(
                    "API error ({status}): {}",
                    sanitize_for_log(&detail)
                ))
                .with_status(status)
            }
            other => self.error(format!(
                "Request failed: {}",
                sanitize_for_log(&other.to_string())
            )),
        }
    }

    fn error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::new(PROVIDER_NAME, &self.config.model, message)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn stream_chat(
        &self,
        history: &[Turn],
        message: &str,
    ) -> Result<FragmentStream, ProviderError> {
        let request = self.build_request(history, message);

        tracing::debug!(
            model = %self.config.model,
            turns = request.contents.len(),
            "Gemini streaming request"
        );

        let body = serde_json::to_string(&request)
            .map_err(|e| self.error(format!("Failed to encode request: {e}")))?;
        let mut events = self
            .event_source(body)
            .map_err(|e| self.error(format!("Invalid request: {}", sanitize_for_log(&e.to_string()))))?
            .stream();

        // Wait for the response head so HTTP failures are reported here.
        let first = loop {
            match events.next().await {
                Some(Ok(es::SSE::Connected(_))) => break None,
                Some(Ok(es::SSE::Comment(_))) => continue,
                Some(Ok(event)) => break Some(event),
                Some(Err(e)) => return Err(self.connect_error(e).await),
                None => return Err(self.error("Connection closed before a response arrived")),
            }
        };

        Ok(fragments_from_events(
            events,
            first,
            self.config.model.clone(),
        ))
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// STREAM DECODING
// ══════════════════════════════════════════════════════════════════════════════

struct FragmentState<S> {
    events: S,
    first: Option<es::SSE>,
    model: String,
    done: bool,
}

/// Turn decoded SSE items into a fragment stream.
///
/// The stream ends after the first error; nothing is read past it.
fn fragments_from_events<S>(events: S, first: Option<es::SSE>, model: String) -> FragmentStream
where
    S: Stream<Item = Result<es::SSE, es::Error>> + Send + Unpin + 'static,
{
    let state = FragmentState {
        events,
        first,
        model,
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            let item = match state.first.take() {
                Some(sse) => Ok(sse),
                None => state.events.next().await?,
            };

            let result = match item {
                Ok(es::SSE::Event(event)) => match parse_event(&event.data, &state.model) {
                    Some(result) => result,
                    None => continue,
                },
                Ok(_) => continue,
                Err(es::Error::Eof) => return None,
                Err(e) => Err(ProviderError::new(
                    PROVIDER_NAME,
                    &state.model,
                    format!("Stream interrupted: {}", sanitize_for_log(&e.to_string())),
                )),
            };

            state.done = result.is_err();
            return Some((result, state));
        }
    })
    .boxed()
}

/// Decode one SSE payload into a fragment, an error, or nothing.
fn parse_event(data: &str, model: &str) -> Option<Result<String, ProviderError>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }

    let err = |message: String| Some(Err(ProviderError::new(PROVIDER_NAME, model, message)));

    let response: GenerateContentResponse = match serde_json::from_str(data) {
        Ok(response) => response,
        Err(e) => return err(format!("Failed to parse response: {e}")),
    };

    if let Some(api_error) = response.error {
        return err(format!("API error: {}", api_error.message));
    }

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return err(format!("Prompt blocked: {reason}"));
    }

    let Some(candidate) = response.candidates.and_then(|c| c.into_iter().next()) else {
        return None;
    };

    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        if let Some(reason) = candidate
            .finish_reason
            .filter(|r| BLOCKING_FINISH_REASONS.contains(&r.as_str()))
        {
            return err(format!("Response stopped: {reason}"));
        }
    }

    Some(Ok(text))
}
