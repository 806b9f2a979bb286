//! Common test utilities for stanzastream integration tests.
//!
//! Provides a scripted in-process XMPP server over plain TCP. The
//! script controls which features are advertised and how authentication
//! rounds are answered, so tests can drive every negotiation branch
//! without a real server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use stanzastream::framing::{self, ElementKind};
use stanzastream::{Stanza, StanzaKind};

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// What the mock server offers and how it behaves
#[derive(Debug, Clone)]
pub struct ServerScript {
    /// SASL mechanisms to advertise; empty means no `<mechanisms/>`
    pub mechanisms: Vec<&'static str>,
    pub offer_bind: bool,
    pub offer_session: bool,
    /// Whether `<auth/>` is answered with success
    pub accept_auth: bool,
    /// Accept the socket but never write anything
    pub silent: bool,
    /// Answer `jabber:iq:auth` probes (legacy authentication)
    pub legacy_auth: bool,
    /// Send this stream error condition shortly after features
    pub error_after_connect: Option<&'static str>,
    /// Abruptly drop the FIRST connection this long after the client
    /// goes available (tests reconnection)
    pub drop_first_connection_after_ms: Option<u64>,
    /// Echo message stanzas back to the client
    pub echo_messages: bool,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            mechanisms: vec!["PLAIN"],
            offer_bind: true,
            offer_session: true,
            accept_auth: true,
            silent: false,
            legacy_auth: true,
            error_after_connect: None,
            drop_first_connection_after_ms: None,
            echo_messages: true,
        }
    }
}

/// A scripted mock XMPP server for testing
pub struct MockXmppServer {
    pub addr: SocketAddr,
    shutdown: Arc<Notify>,
}

impl MockXmppServer {
    /// Create and start a new mock server
    pub async fn start(script: ServerScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_clone = shutdown.clone();
        let connections = Arc::new(AtomicUsize::new(0));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let script = script.clone();
                                let index = connections.fetch_add(1, Ordering::SeqCst) + 1;
                                tokio::spawn(async move {
                                    Self::handle_connection(stream, script, index).await;
                                });
                            }
                            Err(e) => {
                                eprintln!("accept error: {}", e);
                                break;
                            }
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        break;
                    }
                }
            }
        });

        Self { addr, shutdown }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Shutdown the accept loop (established connections keep running)
    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }

    async fn handle_connection(mut stream: TcpStream, script: ServerScript, index: usize) {
        if script.silent {
            // Swallow bytes until the client gives up
            let mut buf = [0u8; 1024];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    return;
                }
            }
            return;
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];
        let mut authenticated = false;

        loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buffer.extend_from_slice(&chunk[..n]);

            let mut consumed = 0;
            while let Some((element, used)) = framing::extract_element(&buffer[consumed..]) {
                consumed += used;
                if !Self::handle_element(&mut stream, &script, index, &mut authenticated, &element)
                    .await
                {
                    return;
                }
            }
            if consumed > 0 {
                buffer.drain(..consumed);
            }
        }
    }

    /// React to one client element; false ends the connection
    async fn handle_element(
        stream: &mut TcpStream,
        script: &ServerScript,
        index: usize,
        authenticated: &mut bool,
        element: &str,
    ) -> bool {
        verbose_println!("mock <- {}", element);

        match framing::classify(element) {
            ElementKind::StreamHeader => {
                let header = format!(
                    "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
                     xmlns:stream='http://etherx.jabber.org/streams' id='mock{index}' \
                     from='example.test' version='1.0'>"
                );
                let features = Self::features_for(script, *authenticated);
                if write_all(stream, &format!("{header}{features}")).await.is_err() {
                    return false;
                }

                if let Some(condition) = script.error_after_connect {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    let _ = write_all(
                        stream,
                        &format!(
                            "<stream:error><{condition} \
                             xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>\
                             </stream:stream>"
                        ),
                    )
                    .await;
                    return false;
                }
                true
            }
            ElementKind::Unknown if element.contains("<auth") => {
                if script.accept_auth {
                    *authenticated = true;
                    write_all(stream, "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
                        .await
                        .is_ok()
                } else {
                    write_all(
                        stream,
                        "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                         <not-authorized/></failure>",
                    )
                    .await
                    .is_ok()
                }
            }
            ElementKind::Stanza(StanzaKind::Iq) => Self::handle_iq(stream, script, element).await,
            ElementKind::Stanza(StanzaKind::Message) => {
                if script.echo_messages {
                    return write_all(stream, element).await.is_ok();
                }
                true
            }
            ElementKind::Stanza(StanzaKind::Presence) => {
                if index == 1 {
                    if let Some(ms) = script.drop_first_connection_after_ms {
                        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
                        // Abrupt drop, no closing tag
                        return false;
                    }
                }
                true
            }
            ElementKind::StreamClose => {
                let _ = write_all(stream, "</stream:stream>").await;
                false
            }
            _ => true,
        }
    }

    async fn handle_iq(stream: &mut TcpStream, script: &ServerScript, element: &str) -> bool {
        let Some(iq) = Stanza::parse(element) else {
            return true;
        };
        let id = iq.id.as_deref().unwrap_or("0");

        if element.contains("urn:ietf:params:xml:ns:xmpp-bind") {
            let resource =
                framing::child_text(element, "resource").unwrap_or_else(|| "granted".into());
            let resource = if resource.is_empty() { "granted".into() } else { resource };
            return write_all(
                stream,
                &format!(
                    "<iq type='result' id='{id}'>\
                     <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                     <jid>user@example.test/{resource}</jid></bind></iq>"
                ),
            )
            .await
            .is_ok();
        }

        if element.contains("urn:ietf:params:xml:ns:xmpp-session") {
            return write_all(stream, &format!("<iq type='result' id='{id}'/>"))
                .await
                .is_ok();
        }

        if element.contains("jabber:iq:auth") {
            if !script.legacy_auth {
                return write_all(
                    stream,
                    &format!(
                        "<iq type='error' id='{id}'><error type='cancel'>\
                         <service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
                         </error></iq>"
                    ),
                )
                .await
                .is_ok();
            }
            if iq.type_attr.as_deref() == Some("get") {
                return write_all(
                    stream,
                    &format!(
                        "<iq type='result' id='{id}'><query xmlns='jabber:iq:auth'>\
                         <username/><password/><digest/><resource/></query></iq>"
                    ),
                )
                .await
                .is_ok();
            }
            // Credential submission; the mock accepts anything present
            return write_all(stream, &format!("<iq type='result' id='{id}'/>"))
                .await
                .is_ok();
        }

        // Unknown iq: generic result keeps the client moving
        write_all(stream, &format!("<iq type='result' id='{id}'/>"))
            .await
            .is_ok()
    }

    fn features_for(script: &ServerScript, authenticated: bool) -> String {
        if authenticated {
            let mut inner = String::new();
            if script.offer_bind {
                inner.push_str("<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>");
            }
            if script.offer_session {
                inner.push_str("<session xmlns='urn:ietf:params:xml:ns:xmpp-session'/>");
            }
            return format!("<stream:features>{inner}</stream:features>");
        }

        if script.mechanisms.is_empty() {
            return "<stream:features/>".to_string();
        }
        let list: String = script
            .mechanisms
            .iter()
            .map(|m| format!("<mechanism>{m}</mechanism>"))
            .collect();
        format!(
            "<stream:features><mechanisms \
             xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>{list}</mechanisms></stream:features>"
        )
    }
}

impl Drop for MockXmppServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_all(stream: &mut TcpStream, text: &str) -> std::io::Result<()> {
    verbose_println!("mock -> {}", text);
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await
}
