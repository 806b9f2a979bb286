//! Connection orchestration.
//!
//! `XmppConnection` is created config-only. `connect()` runs the
//! negotiation sequence (socket, stream open, optional TLS, optional
//! compression) while it still owns the stream, then splits it and
//! spawns the pipeline: reader task, writer task, keep-alive task and
//! the dispatcher thread. From that point on, ownership is strict: only
//! the writer touches the write side, only the reader reads.
//!
//! `shutdown` stops the pipeline but keeps login state for a resume;
//! `disconnect` additionally discards everything derived, returning the
//! connection to its pre-connect state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use crate::collector::{CollectorRegistry, StanzaCollector};
use crate::compression::{self, DeflateHalf, InflateHalf};
use crate::config::ConnectionConfig;
use crate::config::SecurityMode;
use crate::connection_state::{AtomicConnectionState, ConnectionState};
use crate::dispatcher::{spawn_dispatcher, ListenerEntry, ListenerRegistry};
use crate::error::{Result, StreamEngineError};
use crate::features::StreamFeatures;
use crate::filter::StanzaFilter;
use crate::framing::{self, ElementKind};
use crate::heartbeat::spawn_keepalive;
use crate::listener::{ConnectionEvent, ConnectionListener, StanzaInterceptor, StanzaListener};
use crate::manager::ReconnectionManager;
use crate::reader::{run_reader, ReaderContext};
use crate::requests::PendingIqMap;
use crate::sasl::SaslEvent;
use crate::stanza::{Stanza, StreamHeader};
use crate::tls::{build_connector, XmppStream};
use crate::writer::{run_writer, IdleTracker, WriterCommand, OUTGOING_QUEUE_CAPACITY};

/// Wait gates the reader resolves for whoever is blocked in a
/// negotiation step
pub(crate) struct Gates {
    pub sasl: Mutex<Option<mpsc::UnboundedSender<SaslEvent>>>,
    pub features: Mutex<Option<oneshot::Sender<StreamFeatures>>>,
}

impl Gates {
    fn new() -> Self {
        Self {
            sasl: Mutex::new(None),
            features: Mutex::new(None),
        }
    }

    pub(crate) fn clear(&self) {
        *self.sasl.lock() = None;
        *self.features.lock() = None;
    }
}

/// The login to replay on auto-resume
#[derive(Clone)]
pub(crate) enum LoginRequest {
    Credentials {
        username: String,
        password: String,
        resource: String,
    },
    Anonymous,
}

/// Everything that exists only while a socket is up
struct Pipeline {
    outgoing_tx: Sender<WriterCommand>,
    dispatch_tx: Sender<Stanza>,
    shutdown: Arc<AtomicBool>,
    notify: Arc<Notify>,
    /// Patched in right after the task spawns; the reader may already be
    /// processing residual bytes while the handle lands here
    reader: Option<tokio::task::JoinHandle<()>>,
    writer: tokio::task::JoinHandle<()>,
    keepalive: tokio::task::JoinHandle<()>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
}

/// Shared state behind the public `XmppConnection` handle. Background
/// tasks hold `Weak` references so a dropped connection unwinds.
pub struct ConnectionCore {
    pub(crate) config: ConnectionConfig,
    pub(crate) state: AtomicConnectionState,
    secure: AtomicBool,
    compressed: AtomicBool,
    pub(crate) collectors: CollectorRegistry,
    stanza_listeners: ListenerRegistry,
    send_listeners: ListenerRegistry,
    interceptors: RwLock<Vec<Arc<dyn StanzaInterceptor>>>,
    conn_listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    pipeline: Mutex<Option<Pipeline>>,
    pub(crate) pending_iq: PendingIqMap,
    pub(crate) gates: Gates,
    pub(crate) stream_header: RwLock<Option<StreamHeader>>,
    pub(crate) features: RwLock<Option<StreamFeatures>>,
    pub(crate) bound_address: RwLock<Option<String>>,
    pub(crate) last_login: RwLock<Option<LoginRequest>>,
    pub(crate) was_authenticated: AtomicBool,
    id_prefix: String,
    id_counter: AtomicU64,
    /// Serializes connect/login/disconnect against each other
    ops: tokio::sync::Mutex<()>,
}

impl ConnectionCore {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        let id_prefix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(5)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self {
            config,
            state: AtomicConnectionState::default(),
            secure: AtomicBool::new(false),
            compressed: AtomicBool::new(false),
            collectors: Arc::new(RwLock::new(Vec::new())),
            stanza_listeners: Arc::new(RwLock::new(Vec::new())),
            send_listeners: Arc::new(RwLock::new(Vec::new())),
            interceptors: RwLock::new(Vec::new()),
            conn_listeners: RwLock::new(Vec::new()),
            pipeline: Mutex::new(None),
            pending_iq: PendingIqMap::new(),
            gates: Gates::new(),
            stream_header: RwLock::new(None),
            features: RwLock::new(None),
            bound_address: RwLock::new(None),
            last_login: RwLock::new(None),
            was_authenticated: AtomicBool::new(false),
            id_prefix,
            id_counter: AtomicU64::new(1),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    // ---- lifecycle -----------------------------------------------------

    /// Connect and negotiate the stream. When the connection was
    /// previously authenticated and dropped abruptly, the prior login is
    /// replayed automatically once the socket is up again.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.ops.lock().await;
        self.connect_locked().await?;

        if self.was_authenticated.load(Ordering::Acquire) {
            let request = self.last_login.read().clone();
            if let Some(request) = request {
                debug!("replaying previous login after reconnect");
                if let Err(e) = self.login_request_locked(request).await {
                    // Never leave a half-authenticated pipeline behind
                    self.shutdown_locked(false).await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn connect_locked(self: &Arc<Self>) -> Result<()> {
        if self.state.is_connected() {
            return Err(StreamEngineError::StateConflict(
                "connection is already established".into(),
            ));
        }

        self.state.set(ConnectionState::Connecting);
        let bound = self.config.reply_timeout * 3;

        let outcome = match tokio::time::timeout(bound, negotiate(&self.config, &self.state)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.state.set(ConnectionState::Disconnected);
                return Err(StreamEngineError::timeout("stream negotiation", bound));
            }
        };

        info!(
            host = %self.config.host,
            port = self.config.port,
            secured = outcome.secured,
            compressed = outcome.compressed,
            "stream negotiated"
        );

        let (read_half, write_half) = tokio::io::split(outcome.stream);
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::bounded(OUTGOING_QUEUE_CAPACITY);
        let (dispatch_tx, dispatch_rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let idle = Arc::new(IdleTracker::new());

        let writer = tokio::spawn(run_writer(
            write_half,
            outgoing_rx,
            outcome.deflate,
            idle,
            self.config.keep_alive_interval,
            Arc::clone(&shutdown),
            Arc::downgrade(self),
        ));
        let keepalive = spawn_keepalive(
            self.config.keep_alive_interval,
            outgoing_tx.clone(),
            Arc::clone(&notify),
        );
        let dispatcher = spawn_dispatcher(
            dispatch_rx,
            Arc::clone(&self.stanza_listeners),
            Arc::clone(&shutdown),
        );

        *self.stream_header.write() = Some(outcome.header);
        *self.features.write() = Some(outcome.features);
        self.secure.store(outcome.secured, Ordering::Release);
        self.compressed.store(outcome.compressed, Ordering::Release);
        self.state.set(if outcome.secured {
            ConnectionState::Secured
        } else {
            ConnectionState::StreamOpened
        });

        // The pipeline must be registered before the reader runs: a
        // stream error in the residual bytes goes through
        // handle_connection_error, which tears the pipeline down.
        *self.pipeline.lock() = Some(Pipeline {
            outgoing_tx,
            dispatch_tx: dispatch_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            notify: Arc::clone(&notify),
            reader: None,
            writer,
            keepalive,
            dispatcher: Some(dispatcher),
        });

        let reader = tokio::spawn(run_reader(
            read_half,
            outcome.inflate,
            ReaderContext {
                core: Arc::downgrade(self),
                dispatch_tx,
                shutdown,
                notify,
            },
            outcome.residual,
        ));

        match self.pipeline.lock().as_mut() {
            Some(pipeline) => pipeline.reader = Some(reader),
            None => {
                // The residual bytes already killed the connection;
                // listeners saw ClosedOnError.
                return Err(StreamEngineError::IoFailure(
                    "connection lost during startup".into(),
                ));
            }
        }

        self.notify_event(&ConnectionEvent::Connected);
        Ok(())
    }

    /// Stop the pipeline and close the socket, keeping login state so a
    /// later `connect()` can resume. A planned shutdown announces
    /// unavailability and emits `Closed`.
    pub(crate) async fn shutdown(self: &Arc<Self>) {
        let _guard = self.ops.lock().await;
        self.shutdown_locked(true).await;
    }

    async fn shutdown_locked(&self, planned: bool) {
        let pipeline = self.pipeline.lock().take();
        let Some(pipeline) = pipeline else {
            self.state.set(ConnectionState::Disconnected);
            return;
        };

        self.state.set(ConnectionState::Closing);

        if planned && self.was_authenticated.load(Ordering::Acquire) {
            let _ = pipeline.outgoing_tx.try_send(WriterCommand::Stanza(
                Stanza::presence_unavailable().as_xml().to_string(),
            ));
        }
        // Close must be queued before the flag flips: the writer drains
        // the queue up to Close, then writes the closing tag.
        let _ = pipeline
            .outgoing_tx
            .send_timeout(WriterCommand::Close, Duration::from_millis(500));
        pipeline.shutdown.store(true, Ordering::Release);
        pipeline.notify.notify_waiters();

        let Pipeline {
            outgoing_tx,
            dispatch_tx,
            reader,
            writer,
            keepalive,
            dispatcher,
            ..
        } = pipeline;
        drop(outgoing_tx);
        drop(dispatch_tx);
        let _ = writer.await;
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        let _ = keepalive.await;
        if let Some(handle) = dispatcher {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        self.gates.clear();
        self.pending_iq.clear();
        self.secure.store(false, Ordering::Release);
        self.compressed.store(false, Ordering::Release);
        self.state.set(ConnectionState::Disconnected);

        if planned {
            self.notify_event(&ConnectionEvent::Closed);
        }
        debug!(planned, "connection shut down");
    }

    /// Shutdown plus discarding of all derived state; the connection is
    /// back to its freshly constructed shape.
    pub(crate) async fn disconnect(self: &Arc<Self>) {
        let _guard = self.ops.lock().await;
        self.shutdown_locked(true).await;

        self.was_authenticated.store(false, Ordering::Release);
        *self.last_login.write() = None;
        *self.bound_address.write() = None;
        *self.stream_header.write() = None;
        *self.features.write() = None;

        let collectors: Vec<_> = self.collectors.read().iter().cloned().collect();
        for collector in collectors {
            collector.cancel();
        }
    }

    /// Asynchronous error path shared by the reader and writer tasks.
    /// Shuts the pipeline down and reports `ClosedOnError`; reconnection
    /// may resume the connection afterwards.
    pub(crate) fn handle_connection_error(&self, error: StreamEngineError) {
        let pipeline = self.pipeline.lock().take();
        let Some(pipeline) = pipeline else {
            // A planned close is already tearing things down
            return;
        };
        pipeline.shutdown.store(true, Ordering::Release);
        pipeline.notify.notify_waiters();

        self.gates.clear();
        self.pending_iq.clear();
        self.secure.store(false, Ordering::Release);
        self.compressed.store(false, Ordering::Release);
        self.state.set(ConnectionState::Disconnected);

        warn!(error = %error, "connection lost");
        self.notify_event(&ConnectionEvent::ClosedOnError(error));
        // Tasks unwind on their own: the channels died with `pipeline`
    }

    // ---- traffic -------------------------------------------------------

    /// Queue a stanza for sending. Interceptors run (and may rewrite the
    /// stanza) before it is queued; send listeners observe it right
    /// after, in enqueue order. Blocks only while the bounded outgoing
    /// queue is full.
    pub(crate) fn send(&self, mut stanza: Stanza) -> Result<()> {
        if !self.state.is_connected() {
            return Err(StreamEngineError::StateConflict(
                "cannot send while disconnected".into(),
            ));
        }

        let interceptors: Vec<_> = self.interceptors.read().iter().cloned().collect();
        for interceptor in interceptors {
            interceptor.intercept(&mut stanza);
        }

        let tx = self.writer_tx()?;
        tx.send(WriterCommand::Stanza(stanza.as_xml().to_string()))
            .map_err(|_| StreamEngineError::StateConflict("connection closed".into()))?;

        let listeners: Vec<_> = self.send_listeners.read().iter().cloned().collect();
        for entry in listeners {
            if entry.filter.accept(&stanza) {
                if let Err(e) = entry.listener.on_stanza(&stanza) {
                    warn!(error = %e, "send listener failed");
                }
            }
        }
        Ok(())
    }

    /// Queue a negotiation element, bypassing interceptors and send
    /// listeners
    pub(crate) fn send_negotiation(&self, xml: String) -> Result<()> {
        self.writer_tx()?
            .send(WriterCommand::Raw(xml))
            .map_err(|_| StreamEngineError::StateConflict("connection closed".into()))
    }

    fn writer_tx(&self) -> Result<Sender<WriterCommand>> {
        self.pipeline
            .lock()
            .as_ref()
            .map(|p| p.outgoing_tx.clone())
            .ok_or_else(|| StreamEngineError::StateConflict("not connected".into()))
    }

    // ---- registries ----------------------------------------------------

    pub(crate) fn collector(&self, filter: Box<dyn StanzaFilter>) -> Arc<StanzaCollector> {
        StanzaCollector::register(&self.collectors, filter, self.config.collector_capacity)
    }

    pub(crate) fn add_stanza_listener(
        &self,
        listener: Arc<dyn StanzaListener>,
        filter: Box<dyn StanzaFilter>,
    ) {
        self.stanza_listeners
            .write()
            .push(Arc::new(ListenerEntry { filter, listener }));
    }

    pub(crate) fn remove_stanza_listener(&self, listener: &Arc<dyn StanzaListener>) {
        self.stanza_listeners
            .write()
            .retain(|entry| !Arc::ptr_eq(&entry.listener, listener));
    }

    pub(crate) fn add_send_listener(
        &self,
        listener: Arc<dyn StanzaListener>,
        filter: Box<dyn StanzaFilter>,
    ) {
        self.send_listeners
            .write()
            .push(Arc::new(ListenerEntry { filter, listener }));
    }

    pub(crate) fn remove_send_listener(&self, listener: &Arc<dyn StanzaListener>) {
        self.send_listeners
            .write()
            .retain(|entry| !Arc::ptr_eq(&entry.listener, listener));
    }

    pub(crate) fn add_interceptor(&self, interceptor: Arc<dyn StanzaInterceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub(crate) fn remove_interceptor(&self, interceptor: &Arc<dyn StanzaInterceptor>) {
        self.interceptors
            .write()
            .retain(|i| !Arc::ptr_eq(i, interceptor));
    }

    pub(crate) fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.conn_listeners.write().push(listener);
    }

    pub(crate) fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.conn_listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub(crate) fn notify_event(&self, event: &ConnectionEvent) {
        let snapshot: Vec<_> = self.conn_listeners.read().iter().cloned().collect();
        for listener in snapshot {
            listener.on_event(event);
        }
    }

    // ---- queries -------------------------------------------------------

    pub(crate) fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub(crate) fn is_authenticated(&self) -> bool {
        self.state.is_authenticated()
    }

    pub(crate) fn is_secure(&self) -> bool {
        self.secure.load(Ordering::Acquire)
    }

    pub(crate) fn is_compressed(&self) -> bool {
        self.compressed.load(Ordering::Acquire)
    }

    pub(crate) fn fresh_id(&self) -> String {
        format!(
            "{}-{}",
            self.id_prefix,
            self.id_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    // Replays a stored login; the per-flavor implementations live in
    // sasl.rs
    pub(crate) async fn login_request_locked(self: &Arc<Self>, request: LoginRequest) -> Result<String> {
        match request {
            LoginRequest::Credentials {
                username,
                password,
                resource,
            } => self.login_locked(&username, &password, &resource).await,
            LoginRequest::Anonymous => self.login_anonymously_locked().await,
        }
    }

    pub(crate) async fn login(
        self: &Arc<Self>,
        username: &str,
        password: &str,
        resource: &str,
    ) -> Result<String> {
        let _guard = self.ops.lock().await;
        self.login_locked(username, password, resource).await
    }

    pub(crate) async fn login_anonymously(self: &Arc<Self>) -> Result<String> {
        let _guard = self.ops.lock().await;
        self.login_anonymously_locked().await
    }
}

// ---- stream negotiation (pre-pipeline) --------------------------------

struct NegotiationOutcome {
    stream: XmppStream,
    inflate: Option<InflateHalf>,
    deflate: Option<DeflateHalf>,
    header: StreamHeader,
    features: StreamFeatures,
    secured: bool,
    compressed: bool,
    /// Bytes read past the last negotiation element; they belong to the
    /// reader task
    residual: Vec<u8>,
}

/// Run the stream negotiation sequence: open the socket, exchange stream
/// headers, then settle TLS and compression before anything splits the
/// stream. The caller bounds this future with `3 x reply_timeout`.
async fn negotiate(
    config: &ConnectionConfig,
    state: &AtomicConnectionState,
) -> Result<NegotiationOutcome> {
    let tcp = TcpStream::connect((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            StreamEngineError::IoFailure(format!(
                "connect {}:{}: {e}",
                config.host, config.port
            ))
        })?;

    let mut stream = XmppStream::Plain(tcp);
    let mut buffer: Vec<u8> = Vec::new();
    let mut inflate: Option<InflateHalf> = None;
    let mut deflate: Option<DeflateHalf> = None;
    let mut header: Option<StreamHeader> = None;
    let mut last_features = StreamFeatures::default();
    let mut compression_settled = !config.compression_enabled;

    send_raw(&mut stream, &mut deflate, &framing::stream_open(&config.service_name)).await?;

    loop {
        let element = next_element(&mut stream, &mut buffer, &mut inflate).await?;

        match framing::classify(&element) {
            ElementKind::StreamHeader => {
                let parsed = framing::parse_stream_header(&element);
                let legacy = parsed.is_legacy();
                debug!(id = ?parsed.id, legacy, "response stream header");
                header = Some(parsed);
                state.set(ConnectionState::StreamOpened);

                // Pre-1.0 servers never send features: the gate opens on
                // the bare header and negotiation is done.
                if legacy {
                    if config.security == SecurityMode::Required {
                        return Err(StreamEngineError::ConfigurationConflict(
                            "security mode requires TLS but the server predates stream features"
                                .into(),
                        ));
                    }
                    return Ok(NegotiationOutcome {
                        stream,
                        inflate,
                        deflate,
                        header: header.unwrap_or_default(),
                        features: StreamFeatures::default(),
                        secured: false,
                        compressed: false,
                        residual: buffer,
                    });
                }
            }
            ElementKind::Features => {
                let features = StreamFeatures::parse(&element);

                if !stream.is_secure() {
                    if features.starttls && config.security != SecurityMode::Disabled {
                        state.set(ConnectionState::TlsNegotiating);
                        send_raw(
                            &mut stream,
                            &mut deflate,
                            &format!("<starttls xmlns='{}'/>", framing::ns::TLS),
                        )
                        .await?;
                        last_features = features;
                        continue;
                    }
                    if config.security == SecurityMode::Required {
                        return Err(StreamEngineError::ConfigurationConflict(
                            "server does not offer starttls but security mode requires TLS".into(),
                        ));
                    }
                    if features.starttls_required && config.security == SecurityMode::Disabled {
                        return Err(StreamEngineError::ConfigurationConflict(
                            "server requires TLS but security mode disables it".into(),
                        ));
                    }
                }

                if !compression_settled
                    && deflate.is_none()
                    && features.offers_compression(compression::ZLIB)
                {
                    state.set(ConnectionState::Compressing);
                    send_raw(
                        &mut stream,
                        &mut deflate,
                        &format!(
                            "<compress xmlns='{}'><method>zlib</method></compress>",
                            framing::ns::COMPRESS_PROTOCOL
                        ),
                    )
                    .await?;
                    last_features = features;
                    continue;
                }

                let secured = stream.is_secure();
                let compressed = deflate.is_some();
                return Ok(NegotiationOutcome {
                    stream,
                    inflate,
                    deflate,
                    header: header.unwrap_or_default(),
                    features,
                    secured,
                    compressed,
                    residual: buffer,
                });
            }
            ElementKind::TlsProceed => {
                let connector =
                    build_connector(config.tls_config.clone(), config.accept_invalid_certs)?;
                stream = stream
                    .upgrade_to_tls(&connector, &config.service_name)
                    .await?;
                state.set(ConnectionState::Secured);
                debug!("TLS handshake complete, reopening stream");

                // The parser starts over on the fresh byte stream
                buffer.clear();
                send_raw(&mut stream, &mut deflate, &framing::stream_open(&config.service_name))
                    .await?;
            }
            ElementKind::TlsFailure => {
                return Err(StreamEngineError::ProtocolFailure(
                    "server refused STARTTLS".into(),
                ));
            }
            ElementKind::CompressionAck => {
                deflate = Some(DeflateHalf::new());
                inflate = Some(InflateHalf::new());
                compression_settled = true;
                debug!("stream compression enabled, reopening stream");

                buffer.clear();
                send_raw(&mut stream, &mut deflate, &framing::stream_open(&config.service_name))
                    .await?;
            }
            ElementKind::CompressionFailure => {
                // Denied compression is recoverable: continue uncompressed
                // with the features from before the attempt.
                warn!("server denied stream compression, continuing uncompressed");
                let secured = stream.is_secure();
                return Ok(NegotiationOutcome {
                    stream,
                    inflate,
                    deflate,
                    header: header.unwrap_or_default(),
                    features: last_features,
                    secured,
                    compressed: false,
                    residual: buffer,
                });
            }
            ElementKind::StreamError => {
                let condition = framing::first_child_name(&element)
                    .unwrap_or_else(|| "undefined-condition".into());
                let text = {
                    let t = framing::text_content(&element);
                    (!t.is_empty()).then_some(t)
                };
                return Err(StreamEngineError::StreamError { condition, text });
            }
            ElementKind::StreamClose => {
                return Err(StreamEngineError::IoFailure(
                    "server closed the stream during negotiation".into(),
                ));
            }
            other => {
                debug!(?other, "ignoring element during negotiation");
            }
        }
    }
}

async fn next_element(
    stream: &mut XmppStream,
    buffer: &mut Vec<u8>,
    inflate: &mut Option<InflateHalf>,
) -> Result<String> {
    loop {
        if let Some((element, used)) = framing::extract_element(buffer) {
            buffer.drain(..used);
            return Ok(element);
        }

        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(StreamEngineError::IoFailure(
                "connection closed during negotiation".into(),
            ));
        }
        match inflate.as_mut() {
            Some(codec) => {
                let plain = codec.decompress_chunk(&chunk[..n])?;
                buffer.extend_from_slice(&plain);
            }
            None => buffer.extend_from_slice(&chunk[..n]),
        }
    }
}

async fn send_raw(
    stream: &mut XmppStream,
    deflate: &mut Option<DeflateHalf>,
    text: &str,
) -> Result<()> {
    match deflate.as_mut() {
        Some(codec) => {
            let wire = codec.compress_chunk(text.as_bytes())?;
            stream.write_all(&wire).await?;
        }
        None => stream.write_all(text.as_bytes()).await?,
    }
    stream.flush().await?;
    Ok(())
}

// ---- public handle ----------------------------------------------------

/// A client connection to an XML-streaming IM server.
///
/// Created config-only; `connect()` brings up the socket and pipeline,
/// `login()` authenticates and binds a resource. All traffic goes
/// through `send`, collectors and listeners.
pub struct XmppConnection {
    core: Arc<ConnectionCore>,
    _reconnection: Option<Arc<ReconnectionManager>>,
}

impl XmppConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        let reconnection_allowed = config.reconnection_allowed;
        let core = Arc::new(ConnectionCore::new(config));
        let _reconnection = reconnection_allowed.then(|| ReconnectionManager::attach(&core));
        Self {
            core,
            _reconnection,
        }
    }

    /// Open the socket and negotiate the stream; bounded by
    /// `3 x reply_timeout`. Replays the previous login after an abrupt
    /// drop.
    pub async fn connect(&self) -> Result<()> {
        self.core.connect().await
    }

    /// Authenticate, bind `resource` and (when offered) establish a
    /// session. Returns the bound full address.
    pub async fn login(&self, username: &str, password: &str, resource: &str) -> Result<String> {
        self.core.login(username, password, resource).await
    }

    /// Anonymous authentication; the server assigns the identity
    pub async fn login_anonymously(&self) -> Result<String> {
        self.core.login_anonymously().await
    }

    /// Orderly shutdown keeping state for a later resume
    pub async fn shutdown(&self) {
        self.core.shutdown().await
    }

    /// Full disconnect; the connection returns to its pre-connect state
    pub async fn disconnect(&self) {
        self.core.disconnect().await
    }

    /// Queue a stanza for sending. Interceptors run (and may rewrite it)
    /// before it is queued; send listeners observe it right after.
    /// Blocks only while the bounded outgoing queue is full; errors with
    /// a state conflict when disconnected.
    pub fn send(&self, stanza: Stanza) -> Result<()> {
        self.core.send(stanza)
    }

    /// Create a collector fed with every received stanza its filter
    /// accepts. Call `cancel()` when done with it.
    pub fn collector(&self, filter: impl StanzaFilter + 'static) -> Arc<StanzaCollector> {
        self.core.collector(Box::new(filter))
    }

    pub fn add_stanza_listener(
        &self,
        listener: Arc<dyn StanzaListener>,
        filter: impl StanzaFilter + 'static,
    ) {
        self.core.add_stanza_listener(listener, Box::new(filter));
    }

    pub fn remove_stanza_listener(&self, listener: &Arc<dyn StanzaListener>) {
        self.core.remove_stanza_listener(listener);
    }

    pub fn add_send_listener(
        &self,
        listener: Arc<dyn StanzaListener>,
        filter: impl StanzaFilter + 'static,
    ) {
        self.core.add_send_listener(listener, Box::new(filter));
    }

    pub fn remove_send_listener(&self, listener: &Arc<dyn StanzaListener>) {
        self.core.remove_send_listener(listener);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn StanzaInterceptor>) {
        self.core.add_interceptor(interceptor);
    }

    pub fn remove_interceptor(&self, interceptor: &Arc<dyn StanzaInterceptor>) {
        self.core.remove_interceptor(interceptor);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.add_connection_listener(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.core.remove_connection_listener(listener);
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.core.is_authenticated()
    }

    pub fn is_secure(&self) -> bool {
        self.core.is_secure()
    }

    pub fn is_compressed(&self) -> bool {
        self.core.is_compressed()
    }

    /// Bound full address after a successful login
    pub fn bound_address(&self) -> Option<String> {
        self.core.bound_address.read().clone()
    }

    /// Stream id assigned by the server, if connected
    pub fn stream_id(&self) -> Option<String> {
        self.core.stream_header.read().as_ref().and_then(|h| h.id.clone())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.core.config
    }
}
