//! Upstream model abstraction.
//!
//! The relay only needs one capability from a model: given the prior turns of a
//! conversation and a new user message, produce a lazy stream of text
//! fragments. `Provider` is that seam; `GeminiProvider` is the real backend and
//! tests plug in scripted implementations.

mod gemini;

pub use gemini::GeminiProvider;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

// ============================================================================
// Provider Trait
// ============================================================================

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = BoxStream<'static, Result<String, ProviderError>>;

/// Unified interface for streaming LLM backends.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get the model this provider sends requests to.
    fn model(&self) -> &str;

    /// Start a streaming completion for `message` on top of `history`.
    ///
    /// Errors returned here happened before the first fragment (connection,
    /// HTTP status); errors inside the stream happened mid-generation.
    async fn stream_chat(
        &self,
        history: &[Turn],
        message: &str,
    ) -> Result<FragmentStream, ProviderError>;
}

/// Error from a provider.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{provider}:{model}] {message}")]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: &str, model: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

// ============================================================================
// Conversation Types
// ============================================================================

/// Author of a conversation turn, in the upstream's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One completed message in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Upstream conversation context owned by one session.
///
/// The hosted API is stateless, so continuity comes from replaying the
/// recorded turns on every call. A turn pair is recorded only once its
/// response stream has completed.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    history: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    /// Record a completed exchange.
    pub fn record(&mut self, sent: impl Into<String>, reply: impl Into<String>) {
        self.history.push(Turn::user(sent));
        self.history.push(Turn::model(reply));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new("gemini", "gemini-1.5-flash", "quota exceeded").with_status(429);
        assert_eq!(err.to_string(), "[gemini:gemini-1.5-flash] quota exceeded");
        assert_eq!(err.status_code, Some(429));
    }

    #[test]
    fn test_conversation_records_pairs() {
        let mut conversation = Conversation::new();
        assert!(conversation.history().is_empty());

        conversation.record("hi", "hello there");
        assert_eq!(
            conversation.history(),
            &[Turn::user("hi"), Turn::model("hello there")]
        );
    }

    #[test]
    fn test_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Model).unwrap(), "\"model\"");
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
    }
}
