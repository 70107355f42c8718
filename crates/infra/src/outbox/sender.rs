//! Message delivery capability.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::info;

use super::types::Envelope;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("rejected by server: {0}")]
    Rejected(String),
}

/// Delivers envelopes to an external transport.
///
/// Implementations may hold a connection open between calls; the processor
/// reuses one sender for every item of every pass.
pub trait MessageSender: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError>;
}

impl<T: MessageSender + ?Sized> MessageSender for Arc<T> {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        (**self).send(envelope)
    }
}

/// Development sender: logs each envelope instead of delivering it.
#[derive(Debug, Default)]
pub struct TracingSender {
    sent: AtomicU64,
}

impl TracingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl MessageSender for TracingSender {
    fn send(&self, envelope: &Envelope) -> Result<(), SendError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            from = %envelope.from,
            to = %envelope.to,
            reply_to = ?envelope.reply_to,
            subject = %envelope.subject,
            has_text = envelope.text.is_some(),
            has_html = envelope.html.is_some(),
            "message delivered to log"
        );
        Ok(())
    }
}
