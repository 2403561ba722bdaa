//! Server-side ping loop: a keep-alive push at `0.9 * idle_timeout` cadence
//! so an idle connection's timer never actually fires against a peer that is
//! merely quiet. A plain `tokio::time::interval`, since this side never
//! waits on a pong.

use std::sync::Arc;

use crate::protocol::Action;

use super::ConnectionInner;

pub(crate) async fn run(inner: Arc<ConnectionInner>) {
    let Some(interval) = inner.config().ping_interval() else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if inner.is_closed() {
            return;
        }
        let send_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if let Err(err) = inner.send_raw(&Action::Ping { send_time }).await {
            tracing::debug!(error = %err, "ping send failed, stopping ping loop");
            return;
        }
    }
}
