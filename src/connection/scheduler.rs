//! Send scheduler: serializes writes through a single write lock and paces
//! them to a configured `download_speed` ceiling.
//!
//! All frame writes go through one owner, an async mutex guarding the
//! transport's write half, avoiding contention on the sink: handler
//! subtasks need a direct `send(action).await` rather than a fire-and-forget
//! channel.

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Result;
use crate::protocol::{Action, FrameWriter};

/// Token-bucket rate limiter over a monotonic clock, replenished at
/// `bytes_per_sec`. A `bytes_per_sec` of `0` disables pacing entirely.
struct RateLimiter {
    bytes_per_sec: u64,
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    fn new(bytes_per_sec: u64) -> Self {
        Self { bytes_per_sec, tokens: bytes_per_sec as f64, last_refill: Instant::now() }
    }

    fn set_rate(&mut self, bytes_per_sec: u64) {
        self.bytes_per_sec = bytes_per_sec;
        self.tokens = bytes_per_sec as f64;
        self.last_refill = Instant::now();
    }

    async fn throttle(&mut self, bytes: usize) {
        if self.bytes_per_sec == 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.bytes_per_sec as f64).min(self.bytes_per_sec as f64);
        self.last_refill = now;

        let bytes = bytes as f64;
        if bytes > self.tokens {
            let deficit = bytes - self.tokens;
            let wait = std::time::Duration::from_secs_f64(deficit / self.bytes_per_sec as f64);
            tokio::time::sleep(wait).await;
            self.tokens = 0.0;
            self.last_refill = Instant::now();
        } else {
            self.tokens -= bytes;
        }
    }
}

/// Per-connection send scheduler, owning the write half and the rate
/// limiter behind a single async mutex each.
pub struct SendScheduler<W> {
    write: Mutex<W>,
    writer: FrameWriter,
    rate: Mutex<RateLimiter>,
}

impl<W: AsyncWrite + Unpin> SendScheduler<W> {
    pub fn new(write: W, writer: FrameWriter, download_speed: u64) -> Self {
        Self { write: Mutex::new(write), writer, rate: Mutex::new(RateLimiter::new(download_speed)) }
    }

    /// Update the rate cap in response to a `DownloadSpeedAction`.
    pub async fn set_download_speed(&self, bytes_per_sec: u64) {
        self.rate.lock().await.set_rate(bytes_per_sec);
    }

    /// Send one action atomically: encode it fully, pace the whole
    /// serialized frame against the rate limiter, then write it while
    /// holding the write lock for its full duration.
    pub async fn send(&self, action: &Action) -> Result<()> {
        let mut buf = Vec::new();
        self.writer.write_action(&mut buf, action).await?;

        self.rate.lock().await.throttle(buf.len()).await;

        let mut guard = self.write.lock().await;
        use tokio::io::AsyncWriteExt;
        guard.write_all(&buf).await?;
        guard.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use crate::protocol::action::ActionHead;
    use crate::scheme_format::SchemeFormat;

    #[tokio::test]
    async fn sends_without_pacing_when_rate_is_zero() {
        let (client, mut server) = tokio::io::duplex(4096);
        let scheduler = SendScheduler::new(client, FrameWriter::new(SchemeFormat::Json), 0);
        let action = Action::Ping { send_time: 42 };
        scheduler.send(&action).await.unwrap();

        let reader = crate::protocol::FrameReader::new(8 * 1024 * 1024, SchemeFormat::Json);
        let back = reader.read_action(&mut server).await.unwrap();
        match back {
            Action::Ping { send_time } => assert_eq!(send_time, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn pacing_delays_large_payload() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        // 1000 bytes/sec cap, payload well over a token bucket's burst.
        let scheduler = SendScheduler::new(client, FrameWriter::new(SchemeFormat::Json), 1000);
        let action = Action::Action {
            head: ActionHead { handler_id: 0, message_id: 1, send_time: 0, data_type: 0, compressor: 0, data_len: 0 },
            headers: Headers::new(),
            payload: vec![0u8; 3000],
        };

        let start = std::time::Instant::now();
        scheduler.send(&action).await.unwrap();
        let elapsed = start.elapsed();
        // With a fresh bucket at ~1000 tokens and a ~3000+ byte frame, some
        // sleeping is unavoidable.
        assert!(elapsed >= std::time::Duration::from_millis(900), "elapsed = {elapsed:?}");

        let reader = crate::protocol::FrameReader::new(8 * 1024 * 1024, SchemeFormat::Json);
        let back = reader.read_action(&mut server).await.unwrap();
        assert!(matches!(back, Action::Action { .. }));
    }
}
