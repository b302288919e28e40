//! Wake signal for long-polling runners.
//!
//! A notification carries no payload: it only tells pollers that some job
//! may have become Waiting. Lagged or missed signals cost latency, never
//! correctness, because every poll re-reads the database.

use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct TaskNotifier {
    sender: broadcast::Sender<()>,
}

impl TaskNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(16);
        Self { sender }
    }

    pub fn notify(&self) {
        // No subscribers is fine.
        let _ = self.sender.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }
}

impl Default for TaskNotifier {
    fn default() -> Self {
        Self::new()
    }
}
