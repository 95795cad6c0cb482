use async_trait::async_trait;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::retry::{RetryPolicy, Retryable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transport failed: {0}")]
    Failed(String),
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            TransportError::Failed(_) => None,
        }
    }
}

/// Messaging front-end the bot talks through.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(&self, chat: &str, text: &str) -> Result<MessageId, TransportError>;

    async fn edit_message(&self, chat: &str, id: MessageId, text: &str)
    -> Result<(), TransportError>;

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), TransportError>;
}

pub async fn send_with_retry(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    chat: &str,
    text: &str,
) -> Result<MessageId, TransportError> {
    policy.run(move |_| transport.send_message(chat, text)).await
}

pub async fn edit_with_retry(
    transport: &dyn Transport,
    policy: &RetryPolicy,
    chat: &str,
    id: MessageId,
    text: &str,
) -> Result<(), TransportError> {
    policy.run(move |_| transport.edit_message(chat, id, text)).await
}

/// Renders every message as a line in the terminal; edits rewrite the line.
/// Without a terminal (piped output) messages and edits are printed in turn.
pub struct ConsoleTransport {
    mp: MultiProgress,
    bars: Mutex<HashMap<MessageId, ProgressBar>>,
    next_id: AtomicU64,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            mp: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ConsoleTransport {
    async fn send_message(&self, _chat: &str, text: &str) -> Result<MessageId, TransportError> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if self.mp.is_hidden() {
            println!("{}", text);
            return Ok(id);
        }
        let pb = self.mp.add(ProgressBar::new(1));
        let style = ProgressStyle::default_bar()
            .template("{msg}")
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        pb.set_style(style);
        pb.set_message(text.to_string());
        pb.tick();
        self.bars
            .lock()
            .map_err(|_| TransportError::Failed("message table poisoned".into()))?
            .insert(id, pb);
        Ok(id)
    }

    async fn edit_message(
        &self,
        _chat: &str,
        id: MessageId,
        text: &str,
    ) -> Result<(), TransportError> {
        if self.mp.is_hidden() {
            println!("{}", text);
            return Ok(());
        }
        let bars = self
            .bars
            .lock()
            .map_err(|_| TransportError::Failed("message table poisoned".into()))?;
        let pb = bars
            .get(&id)
            .ok_or_else(|| TransportError::Failed(format!("unknown message {}", id.0)))?;
        pb.set_message(text.to_string());
        pb.tick();
        Ok(())
    }

    async fn answer_callback(&self, _callback_id: &str, text: &str) -> Result<(), TransportError> {
        if self.mp.is_hidden() {
            println!("{}", text);
            return Ok(());
        }
        self.mp
            .println(text)
            .map_err(|e| TransportError::Failed(e.to_string()))
    }
}
