//! ---
//! kiln_section: "04-orchestration"
//! kiln_subsection: "module"
//! kiln_type: "source"
//! kiln_scope: "code"
//! kiln_description: "Shared broadcast stop signal."
//! kiln_version: "v0.0.0-prealpha"
//! kiln_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

/// One-shot stop signal observed by the build batch and the run loop.
/// Cloning shares the signal.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: broadcast::Sender<()>,
    fired: Arc<AtomicBool>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// New, untriggered signal.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            tx,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the signal. Later calls have no further effect.
    pub fn trigger(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            debug!("stop signal triggered");
            let _ = self.tx.send(());
        }
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has fired, immediately if it already has.
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn late_waiters_observe_an_earlier_trigger() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.triggered().await })
        };
        signal.trigger();
        signal.trigger();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter wakes")
            .expect("join");
        timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("already triggered");
        assert!(signal.is_triggered());
    }
}
