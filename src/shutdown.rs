use tokio::sync::watch;

/// Root cancellation handle; `trigger` stops every task holding a `Shutdown`
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Cloneable cancellation signal observed by long-running tasks
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
        }
    }
}

impl Shutdown {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires. Never resolves if the trigger is
    /// dropped without firing.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_clones() {
        let (trigger, shutdown) = channel();
        let mut a = shutdown.clone();
        let mut b = trigger.subscribe();
        assert!(!shutdown.is_cancelled());

        let waiter = tokio::spawn(async move {
            a.cancelled().await;
            b.cancelled().await;
        });

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger_returns_immediately() {
        let (trigger, mut shutdown) = channel();
        trigger.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_cancels() {
        let (trigger, mut shutdown) = channel();
        drop(trigger);
        let result = tokio::time::timeout(Duration::from_millis(50), shutdown.cancelled()).await;
        assert!(result.is_err());
    }
}
