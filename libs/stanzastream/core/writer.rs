//! Outgoing half of the pipeline.
//!
//! A bounded crossbeam queue (capacity 500) feeds a dedicated tokio task
//! that serializes and flushes. `send` blocks the caller only while the
//! queue is full; that is the engine's back-pressure. The writer task is
//! the ONLY owner of the socket's write side, so stanzas and keep-alive
//! bytes can never interleave.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tracing::{debug, error, trace};

use crate::compression::DeflateHalf;
use crate::connection::ConnectionCore;
use crate::error::StreamEngineError;
use crate::framing::STREAM_CLOSE;
use crate::tls::XmppStream;

/// Capacity of the outgoing stanza queue
pub(crate) const OUTGOING_QUEUE_CAPACITY: usize = 500;

/// Work items for the writer task
pub(crate) enum WriterCommand {
    /// Serialized stanza from the public send path
    Stanza(String),
    /// Negotiation element (auth, response, stream re-open); bypasses
    /// interceptors and send listeners
    Raw(String),
    /// Write one idle byte if nothing was sent for the keep-alive
    /// interval
    KeepAlive,
    /// Drain the queue best-effort, write the closing tag, stop
    Close,
}

/// Tracks the instant of the last successful write, shared with the
/// keep-alive decision. Milliseconds since an internal epoch so the cell
/// stays a lock-free atomic.
pub(crate) struct IdleTracker {
    epoch: Instant,
    last_write_ms: AtomicU64,
}

impl IdleTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_write_ms: AtomicU64::new(0),
        }
    }

    fn record_write(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_write_ms.store(ms, Ordering::Release);
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.last_write_ms.load(Ordering::Acquire);
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Writer task: pop, serialize (optionally compress), flush.
pub(crate) async fn run_writer(
    mut write: WriteHalf<XmppStream>,
    rx: Receiver<WriterCommand>,
    mut deflate: Option<DeflateHalf>,
    idle: Arc<IdleTracker>,
    keep_alive_interval: Duration,
    shutdown: Arc<AtomicBool>,
    core: Weak<ConnectionCore>,
) {
    debug!("writer task started");

    loop {
        // Blocking pop off the async executor, with a timeout so the
        // shutdown flag is observed even on a quiet connection.
        let cmd = {
            let rx = rx.clone();
            tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_millis(100)))
                .await
                .ok()
        };

        match cmd {
            Some(Ok(WriterCommand::Stanza(xml))) | Some(Ok(WriterCommand::Raw(xml))) => {
                if let Err(e) = write_text(&mut write, &mut deflate, &idle, &xml).await {
                    report_write_error(&core, &shutdown, e);
                    break;
                }
            }
            Some(Ok(WriterCommand::KeepAlive)) => {
                if idle.idle_for() < keep_alive_interval {
                    continue;
                }
                trace!("writing keep-alive byte");
                if let Err(e) = write_text(&mut write, &mut deflate, &idle, " ").await {
                    report_write_error(&core, &shutdown, e);
                    break;
                }
            }
            Some(Ok(WriterCommand::Close)) => {
                // Best-effort drain of whatever was queued before close
                while let Ok(cmd) = rx.try_recv() {
                    if let WriterCommand::Stanza(xml) | WriterCommand::Raw(xml) = cmd {
                        if write_text(&mut write, &mut deflate, &idle, &xml)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                if let Err(e) = write_text(&mut write, &mut deflate, &idle, STREAM_CLOSE).await {
                    debug!(error = %e, "closing tag write failed during shutdown");
                }
                let _ = write.shutdown().await;
                break;
            }
            Some(Err(RecvTimeoutError::Timeout)) => {
                if shutdown.load(Ordering::Acquire) {
                    debug!("shutdown flag detected, writer task exiting");
                    break;
                }
            }
            Some(Err(RecvTimeoutError::Disconnected)) | None => {
                debug!("outgoing queue closed, writer task exiting");
                break;
            }
        }
    }

    debug!("writer task exiting");
}

async fn write_text(
    write: &mut WriteHalf<XmppStream>,
    deflate: &mut Option<DeflateHalf>,
    idle: &IdleTracker,
    text: &str,
) -> crate::error::Result<()> {
    match deflate {
        Some(codec) => {
            let wire = codec.compress_chunk(text.as_bytes())?;
            write.write_all(&wire).await?;
        }
        None => {
            write.write_all(text.as_bytes()).await?;
        }
    }
    write.flush().await?;
    idle.record_write();
    Ok(())
}

fn report_write_error(
    core: &Weak<ConnectionCore>,
    shutdown: &Arc<AtomicBool>,
    error: StreamEngineError,
) {
    if shutdown.load(Ordering::Acquire) {
        return;
    }
    error!(error = %error, "write failure");
    if let Some(core) = core.upgrade() {
        core.handle_connection_error(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tracker_measures_since_last_write() {
        let idle = IdleTracker::new();
        idle.record_write();
        assert!(idle.idle_for() < Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(30));
        assert!(idle.idle_for() >= Duration::from_millis(30));
    }
}
