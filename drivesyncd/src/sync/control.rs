use std::sync::Arc;
use std::time::Duration;

use drivesync_core::CancellationToken;
use tokio::sync::watch;

/// Shared pause/cancel handle for a running sync job. Cloning is cheap; all
/// clones observe the same state.
#[derive(Clone)]
pub struct SyncControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl SyncControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    // send_replace rather than send: the flag must stick even when no task
    // is subscribed at that moment.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Cancelling also clears the paused flag so tasks blocked in
    /// `wait_while_paused` wake up and observe the cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait_while_paused(&self) {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() || !*rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Sleeps in short slices so cancellation cuts the wait short and pauses
    /// stretch it. Used for retry backoff delays.
    pub async fn sleep_interruptible(&self, total: Duration) {
        const SLICE: Duration = Duration::from_millis(200);
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return;
            }
            self.wait_while_paused().await;
            let step = remaining.min(SLICE);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(step) => {}
            }
            remaining = remaining.saturating_sub(step);
        }
    }
}

impl Default for SyncControl {
    fn default() -> Self {
        Self::new()
    }
}
