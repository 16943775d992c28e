use std::time::Duration;

use tokio::time::Instant;

/// Paces a byte stream to a fixed bytes-per-second budget. The limiter
/// tracks the total bytes it has admitted since creation and sleeps until
/// the wall clock catches up with the budgeted transfer time.
#[derive(Debug)]
pub struct BandwidthLimiter {
    bytes_per_sec: u64,
    started: Instant,
    sent: u64,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            started: Instant::now(),
            sent: 0,
        }
    }

    pub async fn pace(&mut self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        self.sent = self.sent.saturating_add(bytes as u64);
        let budget = Duration::from_secs_f64(self.sent as f64 / self.bytes_per_sec as f64);
        let elapsed = self.started.elapsed();
        if budget > elapsed {
            tokio::time::sleep(budget - elapsed).await;
        }
    }
}
