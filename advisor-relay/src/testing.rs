//! Scripted provider for exercising the relay without network access.

use crate::provider::{FragmentStream, Provider, ProviderError, Turn};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const PROVIDER: &str = "scripted";
const MODEL: &str = "scripted-model";

/// Behaviour of one `stream_chat` call.
#[derive(Debug, Clone)]
pub enum Script {
    /// Yield these items in order, then end.
    Items(Vec<Result<String, String>>),
    /// Fail before producing a stream.
    Reject(String),
    /// Yield these fragments, then never finish.
    Stall(Vec<String>),
}

impl Script {
    pub fn fragments(texts: &[&str]) -> Self {
        Self::Items(texts.iter().map(|t| Ok(t.to_string())).collect())
    }

    pub fn fail_after(texts: &[&str], message: &str) -> Self {
        let mut items: Vec<_> = texts.iter().map(|t| Ok(t.to_string())).collect();
        items.push(Err(message.to_string()));
        Self::Items(items)
    }

    pub fn reject(message: &str) -> Self {
        Self::Reject(message.to_string())
    }

    pub fn stall_after(texts: &[&str]) -> Self {
        Self::Stall(texts.iter().map(|t| t.to_string()).collect())
    }
}

/// Arguments of one recorded `stream_chat` call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub history: Vec<Turn>,
    pub message: String,
}

/// Sets a flag when the stream holding it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Provider that replays queued scripts and records what it was sent.
///
/// Once the queue is exhausted every call yields an empty stream.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<RecordedCall>>,
    dropped: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().await.clone()
    }

    /// Whether a stalled stream has been dropped by its consumer.
    pub fn upstream_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn model(&self) -> &str {
        MODEL
    }

    async fn stream_chat(
        &self,
        history: &[Turn],
        message: &str,
    ) -> Result<FragmentStream, ProviderError> {
        self.calls.lock().await.push(RecordedCall {
            history: history.to_vec(),
            message: message.to_string(),
        });

        let script = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or(Script::Items(Vec::new()));

        match script {
            Script::Reject(message) => Err(ProviderError::new(PROVIDER, MODEL, message)),
            Script::Items(items) => {
                let items = items
                    .into_iter()
                    .map(|item| item.map_err(|m| ProviderError::new(PROVIDER, MODEL, m)));
                Ok(stream::iter(items).boxed())
            }
            Script::Stall(texts) => {
                let flag = DropFlag(Arc::clone(&self.dropped));
                let tail = stream::pending().map(move |item: Result<String, ProviderError>| {
                    let _keep = &flag;
                    item
                });
                Ok(stream::iter(texts.into_iter().map(Ok)).chain(tail).boxed())
            }
        }
    }
}
