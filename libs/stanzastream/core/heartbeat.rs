//! Keep-alive heartbeat for the stream.
//!
//! A dedicated task ticks at the keep-alive interval and asks the writer
//! to emit one idle byte. The writer applies the actual idleness check
//! and owns the socket, so heartbeat traffic can never interleave with a
//! stanza.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use tokio::sync::Notify;
use tracing::debug;

use crate::writer::WriterCommand;

/// Heartbeat task: one `KeepAlive` command per interval until shutdown.
pub(crate) async fn run_keepalive(
    interval: Duration,
    writer_tx: Sender<WriterCommand>,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    // Skip the immediate first tick: a fresh connection is not idle.
    ticker.tick().await;
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(interval_ms = interval.as_millis() as u64, "keep-alive task started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match writer_tx.try_send(WriterCommand::KeepAlive) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        // Queue full means the connection is anything but
                        // idle; skip this round.
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("writer gone, keep-alive task exiting");
                        break;
                    }
                }
            }
            _ = shutdown.notified() => {
                debug!("keep-alive task received shutdown");
                break;
            }
        }
    }

    debug!("keep-alive task exiting");
}

/// Spawn the keep-alive task
pub(crate) fn spawn_keepalive(
    interval: Duration,
    writer_tx: Sender<WriterCommand>,
    shutdown: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_keepalive(interval, writer_tx, shutdown).await;
    })
}
