use gatelink_proto::{Packet, PacketType};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::SharedStream;

/// Interval between keep-alive packets
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Start sending keep-alive packets on `stream` every `interval`.
///
/// The task ends when the stream is closed or a send fails. The remote side
/// does not time out on missing keep-alives; liveness is tracked elsewhere.
pub fn start_keep_alive(stream: SharedStream, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if stream.is_closed() {
                break;
            }
            if let Err(e) = stream.send(Packet::new(PacketType::KeepAlive)).await {
                warn!(stream_id = stream.stream_id(), "Failed to send keep-alive: {}", e);
                break;
            }
            debug!(stream_id = stream.stream_id(), "Sent keep-alive");
        }
        debug!(stream_id = stream.stream_id(), "Keep-alive task ended");
    })
}
