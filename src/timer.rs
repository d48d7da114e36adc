//! Cancellable deferred timers feeding the supervisor mailbox.
//!
//! Each timer is a one-shot task that sleeps and then posts an event into
//! the mailbox. Expiry callbacks never touch supervisor state directly, so
//! cancelling only needs to abort the task; handlers additionally guard
//! against a stale expiry that was already queued when the timer was
//! cancelled.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One-shot, re-armable, cancellable timer.
#[derive(Default)]
pub(crate) struct DeferredTimer {
    task: Option<JoinHandle<()>>,
}

impl DeferredTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer; a previously armed expiry is cancelled first.
    pub fn arm<E: Send + 'static>(&mut self, tx: &mpsc::Sender<E>, delay: Duration, event: E) {
        self.cancel();
        let tx = tx.clone();
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        }));
    }

    /// Cancel a pending expiry. Idempotent; cancelling an expired or never
    /// armed timer does nothing.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for DeferredTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let mut timer = DeferredTimer::new();
        timer.arm(&tx, Duration::from_millis(500), 7);
        assert!(timer.is_armed());
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_expiry() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let mut timer = DeferredTimer::new();
        timer.arm(&tx, Duration::from_millis(500), 7);
        timer.cancel();
        timer.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_pending_expiry() {
        let (tx, mut rx) = mpsc::channel::<u32>(4);
        let mut timer = DeferredTimer::new();
        timer.arm(&tx, Duration::from_millis(500), 1);
        timer.arm(&tx, Duration::from_millis(100), 2);
        assert_eq!(rx.recv().await, Some(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
    }
}
