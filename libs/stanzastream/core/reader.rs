//! Incoming half of the pipeline.
//!
//! One task owns the read side and the framing buffer. Every complete
//! top-level element is classified and routed: stanzas to collectors and
//! the dispatcher, SASL elements to the authentication exchange, stream
//! features to the waiting negotiation gate, stream errors to the
//! connection-error path. Any unexpected parse failure or end-of-stream
//! while not shutting down kills the connection (the reconnection
//! manager may later resurrect it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossbeam_channel::Sender;
use tokio::io::{AsyncReadExt, ReadHalf};
use tokio::sync::Notify;
use tracing::{debug, error, trace, warn};

use crate::compression::InflateHalf;
use crate::connection::ConnectionCore;
use crate::error::StreamEngineError;
use crate::features::StreamFeatures;
use crate::framing::{self, ElementKind};
use crate::sasl::SaslEvent;
use crate::stanza::Stanza;
use crate::tls::XmppStream;

/// Cap on the framing buffer; growth beyond this means the peer sent
/// something that never completes into an element
const MAX_ELEMENT_BUFFER: usize = 1024 * 1024;

pub(crate) struct ReaderContext {
    pub core: Weak<ConnectionCore>,
    pub dispatch_tx: Sender<Stanza>,
    pub shutdown: Arc<AtomicBool>,
    pub notify: Arc<Notify>,
}

enum Flow {
    Continue,
    Stop,
}

/// Reader task entry point. `residual` carries bytes the negotiation
/// sequence read past the final feature element; they belong to this
/// stream position and must be processed before the first socket read.
pub(crate) async fn run_reader(
    mut read: ReadHalf<XmppStream>,
    mut inflate: Option<InflateHalf>,
    ctx: ReaderContext,
    residual: Vec<u8>,
) {
    debug!("reader task started");

    let mut buffer: Vec<u8> = residual;
    let mut chunk = [0u8; 8192];

    {
        let mut consumed = 0;
        while let Some((element, used)) = framing::extract_element(&buffer[consumed..]) {
            consumed += used;
            if let Flow::Stop = handle_element(&ctx, &element) {
                debug!("reader task exiting");
                return;
            }
        }
        if consumed > 0 {
            buffer.drain(..consumed);
        }
    }

    'outer: loop {
        tokio::select! {
            _ = ctx.notify.notified() => {
                debug!("shutdown notified, reader task exiting");
                break;
            }
            result = read.read(&mut chunk) => {
                let n = match result {
                    Ok(0) => {
                        report_error(
                            &ctx,
                            StreamEngineError::IoFailure("connection closed by peer".into()),
                        );
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        report_error(&ctx, e.into());
                        break;
                    }
                };

                match inflate.as_mut() {
                    Some(codec) => match codec.decompress_chunk(&chunk[..n]) {
                        Ok(plain) => buffer.extend_from_slice(&plain),
                        Err(e) => {
                            report_error(&ctx, e);
                            break;
                        }
                    },
                    None => buffer.extend_from_slice(&chunk[..n]),
                }

                let mut consumed = 0;
                while let Some((element, used)) = framing::extract_element(&buffer[consumed..]) {
                    consumed += used;
                    match handle_element(&ctx, &element) {
                        Flow::Continue => {}
                        Flow::Stop => break 'outer,
                    }
                }
                if consumed > 0 {
                    buffer.drain(..consumed);
                }

                if buffer.len() > MAX_ELEMENT_BUFFER {
                    report_error(
                        &ctx,
                        StreamEngineError::ProtocolFailure(
                            "incoming element exceeds buffer limit".into(),
                        ),
                    );
                    break;
                }
            }
        }
    }

    debug!("reader task exiting");
}

fn handle_element(ctx: &ReaderContext, element: &str) -> Flow {
    let Some(core) = ctx.core.upgrade() else {
        return Flow::Stop;
    };

    trace!(element, "received element");

    match framing::classify(element) {
        ElementKind::Stanza(_) => {
            match Stanza::parse(element) {
                Some(stanza) => deliver_stanza(ctx, &core, stanza),
                None => warn!(element, "stanza failed attribute parse, dropped"),
            }
            Flow::Continue
        }
        ElementKind::StreamHeader => {
            let header = framing::parse_stream_header(element);
            debug!(id = ?header.id, from = ?header.from, "stream header");
            *core.stream_header.write() = Some(header);
            Flow::Continue
        }
        ElementKind::Features => {
            let features = StreamFeatures::parse(element);
            debug!(?features, "stream features");
            *core.features.write() = Some(features.clone());
            if let Some(gate) = core.gates.features.lock().take() {
                let _ = gate.send(features);
            }
            Flow::Continue
        }
        ElementKind::SaslChallenge => {
            forward_sasl(&core, SaslEvent::Challenge(decode_payload(element)));
            Flow::Continue
        }
        ElementKind::SaslSuccess => {
            forward_sasl(&core, SaslEvent::Success(decode_payload(element)));
            Flow::Continue
        }
        ElementKind::SaslFailure => {
            let condition =
                framing::first_child_name(element).unwrap_or_else(|| "not-authorized".into());
            forward_sasl(&core, SaslEvent::Failure(condition));
            Flow::Continue
        }
        ElementKind::StreamError => {
            let condition =
                framing::first_child_name(element).unwrap_or_else(|| "undefined-condition".into());
            let text = {
                let t = framing::text_content(element);
                (!t.is_empty()).then_some(t)
            };
            error!(condition, "stream error from server");
            report_error(ctx, StreamEngineError::StreamError { condition, text });
            Flow::Stop
        }
        ElementKind::StreamClose => {
            if ctx.shutdown.load(Ordering::Acquire) {
                Flow::Stop
            } else {
                report_error(
                    ctx,
                    StreamEngineError::ProtocolFailure("stream closed by server".into()),
                );
                Flow::Stop
            }
        }
        ElementKind::TlsProceed
        | ElementKind::TlsFailure
        | ElementKind::CompressionAck
        | ElementKind::CompressionFailure => {
            // TLS and compression are settled before the pipeline exists
            warn!(element, "negotiation element after negotiation finished");
            Flow::Continue
        }
        ElementKind::Unknown => {
            debug!(element, "unclassified element ignored");
            Flow::Continue
        }
    }
}

fn deliver_stanza(ctx: &ReaderContext, core: &Arc<ConnectionCore>, stanza: Stanza) {
    // Complete an internal request first so negotiation never races the
    // public delivery path.
    if stanza.is_iq_reply() {
        if let Some(id) = stanza.id.clone() {
            core.pending_iq.complete(&id, stanza.clone());
        }
    }

    // Offer to every live collector, pruning cancelled ones.
    let snapshot: Vec<_> = core.collectors.read().iter().cloned().collect();
    let mut saw_cancelled = false;
    for collector in &snapshot {
        if collector.is_cancelled() {
            saw_cancelled = true;
            continue;
        }
        collector.process(&stanza);
    }
    if saw_cancelled {
        core.collectors.write().retain(|c| !c.is_cancelled());
    }

    // Hand off to the dispatcher thread; user callbacks stay off the
    // I/O path.
    let _ = ctx.dispatch_tx.send(stanza);
}

fn forward_sasl(core: &Arc<ConnectionCore>, event: SaslEvent) {
    match core.gates.sasl.lock().as_ref() {
        Some(tx) => {
            let _ = tx.send(event);
        }
        None => warn!("SASL element with no authentication in progress"),
    }
}

/// Base64 payload of a challenge/success element; bad encodings become
/// empty payloads and fail inside the mechanism
fn decode_payload(element: &str) -> Vec<u8> {
    let text = framing::text_content(element);
    if text.is_empty() || text == "=" {
        return Vec::new();
    }
    BASE64.decode(text.as_bytes()).unwrap_or_default()
}

fn report_error(ctx: &ReaderContext, error: StreamEngineError) {
    if ctx.shutdown.load(Ordering::Acquire) {
        return;
    }
    if let Some(core) = ctx.core.upgrade() {
        core.handle_connection_error(error);
    }
}
