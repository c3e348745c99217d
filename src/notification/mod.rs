// Alert delivery: notifier implementations and the bounded alert queue
pub mod log_notifier;
pub mod telegram;

pub use log_notifier::LogNotifier;
pub use telegram::TelegramNotifier;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

pub const EMOJI_ARROW_UP: &str = "\u{2B06}";
pub const EMOJI_ARROW_DOWN: &str = "\u{2B07}";

/// Sink for formatted (HTML) alert messages
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, message: &str) -> Result<()>;
}

/// Producer side of the bounded alert queue
///
/// Never blocks: when the queue is full or the worker is gone the message
/// is dropped with a warning.
#[derive(Debug, Clone)]
pub struct AlertSender {
    tx: mpsc::Sender<String>,
}

impl AlertSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queue a message; returns false if it was dropped
    pub fn send(&self, message: String) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Alert queue full, dropping notification");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Alert worker stopped, dropping notification");
                false
            }
        }
    }
}

/// Spawn the worker that drains the alert queue into `notifier`
///
/// The worker ends once every `AlertSender` clone is dropped and the queue
/// is empty.
pub fn spawn_alert_worker(
    notifier: Arc<dyn Notifier>,
    capacity: usize,
) -> (AlertSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));

    let handle = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = notifier.send_message(&message).await {
                tracing::warn!(error = %e, "Failed to deliver notification");
            }
        }
        tracing::debug!("Alert worker finished");
    });

    (AlertSender::new(tx), handle)
}
