use super::Notifier;
use crate::Result;
use async_trait::async_trait;

/// Writes alerts to the log instead of a chat; used for backtests
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, message: &str) -> Result<()> {
        tracing::info!(target: "trendalert::alert", "{}", message);
        Ok(())
    }
}
