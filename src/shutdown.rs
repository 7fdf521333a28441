use tokio::sync::broadcast;

/// Coordinates cooperative cancellation of long-running tasks.
///
/// Tasks subscribe before they start; [Shutdown::trigger] fans the signal
/// out to every subscriber. Dropping the coordinator releases subscribers
/// the same way.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (tx, _) = broadcast::channel(1);
        Shutdown { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signals every subscriber to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_reaches_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.subscribe();
        let mut second = shutdown.subscribe();

        shutdown.trigger();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn dropping_the_coordinator_releases_subscribers() {
        let shutdown = Shutdown::new();
        let mut subscriber = shutdown.subscribe();
        drop(shutdown);

        assert!(subscriber.recv().await.is_err());
    }
}
