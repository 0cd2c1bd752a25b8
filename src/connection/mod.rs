//! Client connection engine.
//!
//! A [`Connection`] owns one transport for its whole life:
//!
//! 1. `open_streams` resolves and connects (TCP or direct TLS).
//! 2. The injected [`Login`] negotiates the session.
//! 3. The read loop frames, decodes and dispatches inbound stanzas inline.
//!
//! Outbound data from any task goes through an unbounded queue drained by a
//! single writer task, so stanzas never interleave on the wire. Every fatal
//! condition ends in [`ConnectionHandle::connection_failed`], which notifies
//! the connection listeners. There is no reconnect.

pub mod dns;
pub mod framing;
pub mod login;
pub mod transport;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub use dns::{parse_server_input, ParsedServer, XmppEndpoint};
pub use framing::{Frame, StanzaReader, MAX_STANZA_BUFFER_SIZE};
pub use login::{Login, LoginContext, SaslPlainLogin};

use crate::error::ConnectionError;
use crate::jid::Jid;
use crate::listeners::{
    lock, ConnectionListener, IqListener, Listeners, MessageListener, PendingKey,
    PresenceListener,
};
use crate::stanza::{Iq, Stanza};
use transport::{BoxedReader, BoxedStream};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a terminating run waits for queued writes to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const STREAM_CLOSE: &str = "</stream:stream>";

/// Session identity and transport parameters.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub jid: Jid,
    pub password: String,
    /// Host to connect to. Defaults to the address domain.
    pub server: Option<String>,
    /// Explicit port. When unset the server is resolved through SRV.
    pub port: Option<u16>,
    pub use_tls: bool,
    /// Skip certificate verification. Development servers only.
    pub insecure_tls: bool,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(jid: Jid, password: impl Into<String>) -> Self {
        Self {
            jid,
            password: password.into(),
            server: None,
            port: None,
            use_tls: true,
            insecure_tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_insecure_tls(mut self, insecure_tls: bool) -> Self {
        self.insecure_tls = insecure_tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Apply a server input string (see [`parse_server_input`]).
    pub fn with_server_input(self, input: &str) -> Self {
        match parse_server_input(input) {
            ParsedServer::Direct(host, port, use_tls) => {
                self.with_server(host).with_port(port).with_tls(use_tls)
            }
            ParsedServer::Domain(domain) => self.with_server(domain),
        }
    }

    /// The host to resolve or connect to.
    pub fn server_host(&self) -> &str {
        match self.server.as_deref() {
            Some(server) if !server.is_empty() => server,
            _ => self.jid.domain(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("jid", &self.jid)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("insecure_tls", &self.insecure_tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

enum Outbound {
    Data(String),
    /// Write the stream close tag, then shut the writer down. Failures are
    /// reported to the connection listeners.
    Logoff,
    /// Shut the writer down quietly.
    Close,
}

struct Shared {
    config: ConnectionConfig,
    logged_in: AtomicBool,
    writer: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    bound_jid: Mutex<Option<Jid>>,
    listeners: Listeners,
}

/// Cloneable access to a connection: sending, listener registration and
/// session state. Safe to use from any task or thread, including from inside
/// listener callbacks.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    fn new(config: ConnectionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                logged_in: AtomicBool::new(false),
                writer: Mutex::new(None),
                bound_jid: Mutex::new(None),
                listeners: Listeners::new(),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// The configured session address.
    pub fn jid(&self) -> &Jid {
        &self.shared.config.jid
    }

    /// The full address assigned by the server at bind time, if any.
    pub fn bound_jid(&self) -> Option<Jid> {
        lock(&self.shared.bound_jid).clone()
    }

    pub(crate) fn set_bound_jid(&self, jid: Jid) {
        *lock(&self.shared.bound_jid) = Some(jid);
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.logged_in.load(Ordering::SeqCst)
    }

    fn install_writer(&self, tx: mpsc::UnboundedSender<Outbound>) {
        *lock(&self.shared.writer) = Some(tx);
    }

    /// Drop the outbound queue. Returns whether it was still attached.
    fn detach_writer(&self) -> bool {
        lock(&self.shared.writer).take().is_some()
    }

    pub(crate) fn enqueue(&self, xml: String) -> Result<(), ConnectionError> {
        match lock(&self.shared.writer).as_ref() {
            Some(tx) => tx
                .send(Outbound::Data(xml))
                .map_err(|_| ConnectionError::NotConnected),
            None => Err(ConnectionError::NotConnected),
        }
    }

    /// Encode and queue a stanza. Failures are reported to the connection
    /// listeners, not to the caller.
    pub fn send(&self, stanza: impl Into<Stanza>) {
        let xml = stanza.into().to_xml();
        debug!(xml = %xml, "SEND");
        if let Err(e) = self.enqueue(xml) {
            warn!(error = %e, "Dropping outbound stanza");
            self.connection_failed(&e.to_string());
        }
    }

    /// Register `listener` for the response to `iq`, then send it. The
    /// responder is the iq's `to`, or the session domain when absent.
    pub fn send_iq(&self, iq: Iq, listener: Arc<dyn IqListener>) {
        let responder = iq.to.clone().unwrap_or_else(|| self.jid().domain_jid());
        self.add_pending_iq(&responder, iq.id.clone(), listener);
        self.send(iq);
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.shared.listeners.connection.add(listener)
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.shared.listeners.connection.remove(listener)
    }

    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) -> bool {
        self.shared.listeners.message.add(listener)
    }

    pub fn remove_message_listener(&self, listener: &Arc<dyn MessageListener>) -> bool {
        self.shared.listeners.message.remove(listener)
    }

    pub fn add_presence_listener(&self, listener: Arc<dyn PresenceListener>) -> bool {
        self.shared.listeners.presence.add(listener)
    }

    pub fn remove_presence_listener(&self, listener: &Arc<dyn PresenceListener>) -> bool {
        self.shared.listeners.presence.remove(listener)
    }

    pub fn add_iq_listener(&self, listener: Arc<dyn IqListener>) -> bool {
        self.shared.listeners.iq.add(listener)
    }

    pub fn remove_iq_listener(&self, listener: &Arc<dyn IqListener>) -> bool {
        self.shared.listeners.iq.remove(listener)
    }

    /// Route the next iq from `from` with `id` to `listener` only. Replaces
    /// any listener already waiting on the same key.
    pub fn add_pending_iq(&self, from: &Jid, id: impl Into<String>, listener: Arc<dyn IqListener>) {
        self.shared.listeners.pending.insert(from, id, listener);
    }

    /// Forget a pending response. Returns whether one was waiting.
    pub fn cancel_pending_iq(&self, from: &Jid, id: &str) -> bool {
        self.shared
            .listeners
            .pending
            .take(&PendingKey::new(from, id))
            .is_some()
    }

    /// End the session: close the stream and the writer. The read loop then
    /// ends when the server closes its side. Write failures on the way out
    /// go to the connection listeners.
    pub fn logoff(&self) {
        self.shared.logged_in.store(false, Ordering::SeqCst);
        let writer = lock(&self.shared.writer).take();
        let queued = match writer {
            Some(tx) => {
                info!(jid = %self.jid(), "Logging off");
                tx.send(Outbound::Logoff).is_ok()
            }
            None => false,
        };
        if !queued {
            self.connection_failed(&ConnectionError::NotConnected.to_string());
        }
    }

    /// Tear down after a fatal condition and notify every connection
    /// listener once.
    pub fn connection_failed(&self, message: &str) {
        if self.shared.logged_in.swap(false, Ordering::SeqCst) {
            if let Some(tx) = lock(&self.shared.writer).take() {
                let _ = tx.send(Outbound::Close);
            }
        }
        warn!(reason = message, "Connection failed");
        self.shared.listeners.dispatch_connection_failed(message);
    }

    fn dispatch(&self, stanza: Stanza) {
        let listeners = &self.shared.listeners;
        match stanza {
            Stanza::Message(message) => listeners.dispatch_message(&message),
            Stanza::Presence(presence) => listeners.dispatch_presence(&presence),
            Stanza::Iq(mut iq) => {
                if iq.from.is_none() {
                    iq.from = Some(self.jid().domain_jid());
                }
                if !listeners.dispatch_iq(&iq) {
                    debug!(id = %iq.id, "Unhandled IQ, replying with service-unavailable");
                    self.send(iq.error_reply());
                }
            }
        }
    }
}

/// One client connection with its login strategy.
pub struct Connection<L> {
    handle: ConnectionHandle,
    login: L,
}

impl<L: Login> Connection<L> {
    pub fn new(config: ConnectionConfig, login: L) -> Self {
        Self {
            handle: ConnectionHandle::new(config),
            login,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Resolve and connect. Failures are also reported to the connection
    /// listeners.
    pub async fn open_streams(&self) -> Result<BoxedStream, ConnectionError> {
        let config = self.handle.config();
        info!(jid = %config.jid, server = config.server_host(), port = ?config.port,
            use_tls = config.use_tls, "Connecting");
        transport::open_stream(config).await.map_err(|e| {
            self.handle.connection_failed(&e.to_string());
            e
        })
    }

    /// Connect, log in and process the stream until it ends.
    ///
    /// Only returns once the connection is over; the error says why. The
    /// connection listeners have already been notified by then.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let stream = self.open_streams().await?;
        self.run_with_stream(stream).await
    }

    /// Like [`run`](Self::run) over an already connected stream.
    pub async fn run_with_stream<S>(self, stream: S) -> Result<(), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        self.handle.install_writer(tx);
        let writer_task = tokio::spawn(write_loop(write_half, rx, self.handle.clone()));
        let mut reader = StanzaReader::new(Box::new(read_half) as BoxedReader);

        let err = match self.session(&mut reader).await {
            Ok(()) => ConnectionError::StreamClosed,
            Err(e) => e,
        };
        self.terminate(&err, writer_task).await;
        Err(err)
    }

    async fn session(&self, reader: &mut StanzaReader<BoxedReader>) -> Result<(), ConnectionError> {
        {
            let mut ctx = LoginContext::new(reader, &self.handle);
            self.login.login(&mut ctx).await?;
        }
        self.handle.shared.logged_in.store(true, Ordering::SeqCst);
        info!(jid = %self.handle.jid(), "Logged in");
        self.read_loop(reader).await
    }

    async fn read_loop(&self, reader: &mut StanzaReader<BoxedReader>) -> Result<(), ConnectionError> {
        loop {
            match reader.next_frame().await? {
                None | Some(Frame::StreamClose) => return Err(ConnectionError::StreamClosed),
                Some(Frame::StreamOpen(header)) => {
                    debug!(header = %header, "Ignoring stream header");
                }
                Some(Frame::Element { name, xml }) => {
                    if !Stanza::is_recognized(&name) {
                        if name == "error" {
                            warn!(xml = %xml, "Stream error from server");
                        } else {
                            debug!(element = %name, "Skipping unrecognized element");
                        }
                        continue;
                    }
                    debug!(xml = %xml, "RECV");
                    match Stanza::decode(&xml) {
                        Ok(Some(stanza)) => self.handle.dispatch(stanza),
                        Ok(None) => {}
                        Err(e) if e.is_malformed() => return Err(e.into()),
                        // Bad attribute values only cost this one stanza.
                        Err(e) => warn!(element = %name, error = %e, "Dropping undecodable stanza"),
                    }
                }
            }
        }
    }

    async fn terminate(&self, err: &ConnectionError, mut writer_task: JoinHandle<()>) {
        match err {
            ConnectionError::StreamClosed => info!("Stream closed"),
            other => error!(error = %other, "Connection terminated"),
        }
        self.handle.connection_failed(&err.to_string());
        self.handle.detach_writer();
        self.handle.shared.listeners.pending.clear();

        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task)
            .await
            .is_err()
        {
            warn!("Writer did not drain in time, aborting");
            writer_task.abort();
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, xml: &str) -> std::io::Result<()> {
    writer.write_all(xml.as_bytes()).await?;
    writer.flush().await
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    handle: ConnectionHandle,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        let xml = match item {
            Outbound::Data(xml) => xml,
            Outbound::Logoff => {
                let closed = match write_frame(&mut writer, STREAM_CLOSE).await {
                    Ok(()) => writer.shutdown().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = closed {
                    error!(error = %e, "Closing the stream failed");
                    handle.connection_failed(&ConnectionError::Io(e).to_string());
                }
                return;
            }
            Outbound::Close => break,
        };
        if let Err(e) = write_frame(&mut writer, &xml).await {
            error!(error = %e, "Write failed");
            // A detached writer means the session is already being torn down.
            if handle.detach_writer() {
                handle.connection_failed(&ConnectionError::Io(e).to_string());
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stanza::{Element, IqType, Message, Presence, PresenceType};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, DuplexStream, ReadBuf};

    struct NoLogin;

    impl Login for NoLogin {
        async fn login(&self, _ctx: &mut LoginContext<'_>) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    struct SendOnLogin {
        iq: Iq,
        listener: Arc<dyn IqListener>,
    }

    impl Login for SendOnLogin {
        async fn login(&self, ctx: &mut LoginContext<'_>) -> Result<(), ConnectionError> {
            ctx.handle().send_iq(self.iq.clone(), self.listener.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        failures: Mutex<Vec<String>>,
        messages: Mutex<Vec<Message>>,
        presences: Mutex<Vec<Presence>>,
        iqs: Mutex<Vec<Iq>>,
        handles_iq: bool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn handling() -> Arc<Self> {
            Arc::new(Self {
                handles_iq: true,
                ..Self::default()
            })
        }

        fn failures(&self) -> Vec<String> {
            self.failures.lock().unwrap().clone()
        }

        fn message_ids(&self) -> Vec<Option<String>> {
            self.messages.lock().unwrap().iter().map(|m| m.id.clone()).collect()
        }
    }

    impl ConnectionListener for Recorder {
        fn on_connection_failed(&self, message: &str) {
            self.failures.lock().unwrap().push(message.to_string());
        }
    }

    impl MessageListener for Recorder {
        fn on_message(&self, message: &Message) {
            self.messages.lock().unwrap().push(message.clone());
        }
    }

    impl PresenceListener for Recorder {
        fn on_presence(&self, presence: &Presence) {
            self.presences.lock().unwrap().push(presence.clone());
        }
    }

    impl IqListener for Recorder {
        fn on_iq(&self, iq: &Iq) -> bool {
            self.iqs.lock().unwrap().push(iq.clone());
            self.handles_iq
        }
    }

    fn test_config() -> ConnectionConfig {
        ConnectionConfig::new("alice@example.com/test".parse().unwrap(), "secret")
    }

    fn jid(s: &str) -> Jid {
        s.parse().unwrap()
    }

    /// Feed `input` followed by end-of-stream to a connection and collect
    /// everything it wrote.
    async fn run_session<L: Login>(
        connection: Connection<L>,
        input: &str,
    ) -> (Result<(), ConnectionError>, String) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        server.write_all(input.as_bytes()).await.unwrap();
        server.shutdown().await.unwrap();

        let result = connection.run_with_stream(client).await;
        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        (result, written)
    }

    fn written_iqs(written: &str) -> Vec<Iq> {
        let mut iqs = Vec::new();
        let mut offset = 0;
        while let Some((frame, consumed)) = framing::extract_frame(&written.as_bytes()[offset..]).unwrap() {
            offset += consumed;
            if let Frame::Element { xml, .. } = frame {
                if let Some(Stanza::Iq(iq)) = Stanza::decode(&xml).unwrap() {
                    iqs.push(iq);
                }
            }
        }
        iqs
    }

    #[tokio::test]
    async fn test_presence_message_and_unhandled_iq() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_presence_listener(recorder.clone());
        handle.add_message_listener(recorder.clone());
        handle.add_connection_listener(recorder.clone());

        let (result, written) =
            run_session(connection, r#"<presence/><message/><iq id="7" from="b@x"/>"#).await;

        assert!(matches!(result, Err(ConnectionError::StreamClosed)));
        assert_eq!(recorder.presences.lock().unwrap().len(), 1);
        assert_eq!(recorder.messages.lock().unwrap().len(), 1);

        let replies = written_iqs(&written);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "7");
        assert_eq!(replies[0].kind, IqType::Error);
        assert_eq!(replies[0].to, Some(jid("b@x")));
        assert!(written.contains(
            "<error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error>"
        ));
        assert_eq!(recorder.failures(), vec!["stream closed by server".to_string()]);
    }

    #[tokio::test]
    async fn test_unrecognized_element_does_not_disrupt_delivery() {
        let connection = Connection::new(test_config(), NoLogin);
        let recorder = Recorder::new();
        connection.handle().add_message_listener(recorder.clone());

        let input = "<message id='a'><body>1</body></message>\
                     <x:blob xmlns:x='urn:example:blob'><message id='inner'/></x:blob>\
                     <stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>\
                     <message id='b'/>";
        let (_, written) = run_session(connection, input).await;

        assert_eq!(
            recorder.message_ids(),
            vec![Some("a".to_string()), Some("b".to_string())]
        );
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_stanza_does_not_end_session() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());
        handle.add_message_listener(recorder.clone());
        handle.add_presence_listener(recorder.clone());
        handle.add_iq_listener(recorder.clone());

        let input = "<presence type='bogus'/>\
                     <message id='m1' from='bob@example.com/'/>\
                     <iq id='q1' type='bogus' from='b@x'/>\
                     <message id='after'/>";
        let (result, written) = run_session(connection, input).await;

        assert!(matches!(result, Err(ConnectionError::StreamClosed)));
        let presences = recorder.presences.lock().unwrap().clone();
        assert_eq!(presences.len(), 1);
        assert_eq!(presences[0].kind, PresenceType::Available);
        assert_eq!(recorder.message_ids(), vec![Some("after".to_string())]);
        assert!(recorder.iqs.lock().unwrap().is_empty());
        assert!(written.is_empty());
        assert_eq!(recorder.failures(), vec!["stream closed by server".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_iq_is_consumed_once() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let pending = Recorder::handling();
        let generic = Recorder::new();
        handle.add_pending_iq(&jid("a@x"), "42", pending.clone());
        handle.add_iq_listener(generic.clone());

        let input = "<iq type='result' id='42' from='a@x'/><iq type='result' id='42' from='a@x'/>";
        let (_, written) = run_session(connection, input).await;

        assert_eq!(pending.iqs.lock().unwrap().len(), 1);
        assert_eq!(generic.iqs.lock().unwrap().len(), 1);
        // Only the second iq went unhandled.
        let replies = written_iqs(&written);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].id, "42");
    }

    #[tokio::test]
    async fn test_handled_iq_gets_no_error_reply() {
        let connection = Connection::new(test_config(), NoLogin);
        let declining = Recorder::new();
        let handling = Recorder::handling();
        connection.handle().add_iq_listener(declining.clone());
        connection.handle().add_iq_listener(handling.clone());

        let (_, written) = run_session(connection, "<iq type='get' id='q' from='b@x'/>").await;

        // Every listener runs even after one has handled the query.
        assert_eq!(declining.iqs.lock().unwrap().len(), 1);
        assert_eq!(handling.iqs.lock().unwrap().len(), 1);
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn test_iq_without_sender_defaults_to_domain() {
        let connection = Connection::new(test_config(), NoLogin);
        let recorder = Recorder::new();
        connection.handle().add_iq_listener(recorder.clone());

        let (_, written) = run_session(
            connection,
            "<iq type='get' id='p1'><ping xmlns='urn:xmpp:ping'/></iq>",
        )
        .await;

        let received = recorder.iqs.lock().unwrap();
        assert_eq!(received[0].from, Some(jid("example.com")));
        let replies = written_iqs(&written);
        assert_eq!(replies[0].to, Some(jid("example.com")));
    }

    #[tokio::test]
    async fn test_send_iq_routes_response_to_listener() {
        let responder = Recorder::handling();
        let query = Element::new("query").with_attr("xmlns", "jabber:iq:roster");
        let login = SendOnLogin {
            iq: Iq::get("roster_1", None, query),
            listener: responder.clone(),
        };
        let connection = Connection::new(test_config(), login);
        let generic = Recorder::handling();
        connection.handle().add_iq_listener(generic.clone());

        let (_, written) = run_session(
            connection,
            "<iq type='result' id='roster_1' from='example.com'><query xmlns='jabber:iq:roster'/></iq>",
        )
        .await;

        assert_eq!(responder.iqs.lock().unwrap().len(), 1);
        assert!(generic.iqs.lock().unwrap().is_empty());
        let sent = written_iqs(&written);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, IqType::Get);
        assert_eq!(sent[0].id, "roster_1");
    }

    #[tokio::test]
    async fn test_read_failure_notifies_each_listener_once() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let first = Recorder::new();
        let second = Recorder::new();
        for recorder in [&first, &second] {
            handle.add_connection_listener(recorder.clone());
            handle.add_message_listener(recorder.clone());
        }

        let (result, _) =
            run_session(connection, "<message id='a'/><!bogus><message id='b'/>").await;

        assert!(matches!(result, Err(ConnectionError::Framing(_))));
        for recorder in [&first, &second] {
            assert_eq!(recorder.failures().len(), 1);
            assert_eq!(recorder.message_ids(), vec![Some("a".to_string())]);
        }
        assert!(!handle.is_logged_in());
    }

    #[tokio::test]
    async fn test_send_without_writer_reports_failure() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());

        handle.send(Message::chat(jid("bob@example.com"), "hello"));
        assert_eq!(recorder.failures(), vec!["not connected".to_string()]);

        run_session(connection, "").await.0.unwrap_err();
        assert_eq!(recorder.failures().len(), 2);

        // The writer is gone once the run has ended.
        handle.send(Presence::available());
        assert_eq!(recorder.failures().len(), 3);
    }

    #[tokio::test]
    async fn test_pending_table_cleared_when_run_ends() {
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let listener = Recorder::handling();
        handle.add_pending_iq(&jid("a@x"), "1", listener.clone());
        handle.add_pending_iq(&jid("a@x"), "2", listener.clone());

        assert!(handle.cancel_pending_iq(&jid("a@x"), "1"));
        assert!(!handle.cancel_pending_iq(&jid("a@x"), "1"));

        run_session(connection, "").await.0.unwrap_err();
        assert!(!handle.cancel_pending_iq(&jid("a@x"), "2"));
    }

    #[tokio::test]
    async fn test_login_failure_is_reported() {
        struct Refused;

        impl Login for Refused {
            async fn login(&self, _ctx: &mut LoginContext<'_>) -> Result<(), ConnectionError> {
                Err(ConnectionError::LoginFailed("not-authorized".to_string()))
            }
        }

        let connection = Connection::new(test_config(), Refused);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());
        handle.add_message_listener(recorder.clone());

        let (result, _) = run_session(connection, "<message id='a'/>").await;

        assert!(matches!(result, Err(ConnectionError::LoginFailed(_))));
        assert_eq!(recorder.failures(), vec!["login failed: not-authorized".to_string()]);
        assert!(recorder.message_ids().is_empty());
        assert!(!handle.is_logged_in());
    }

    #[tokio::test]
    async fn test_logoff_closes_stream() {
        let (client, mut server) = tokio::io::duplex(1024);
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());
        let run = tokio::spawn(connection.run_with_stream(client));

        while !handle.is_logged_in() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.logoff();
        assert!(!handle.is_logged_in());

        let mut written = String::new();
        read_to_close(&mut server, &mut written).await;
        assert_eq!(written, STREAM_CLOSE);

        server.write_all(STREAM_CLOSE.as_bytes()).await.unwrap();
        assert!(matches!(run.await.unwrap(), Err(ConnectionError::StreamClosed)));
        assert_eq!(recorder.failures().len(), 1);
    }

    /// Reads from a duplex stream; every write fails.
    struct BrokenWriter {
        inner: DuplexStream,
    }

    impl AsyncRead for BrokenWriter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_logoff_reports_write_failure() {
        let (client, server) = tokio::io::duplex(1024);
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());
        let run = tokio::spawn(connection.run_with_stream(BrokenWriter { inner: client }));

        while !handle.is_logged_in() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.logoff();

        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.failures().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(recorder.failures(), vec!["I/O error: broken pipe".to_string()]);

        drop(server);
        assert!(matches!(run.await.unwrap(), Err(ConnectionError::StreamClosed)));
        assert_eq!(recorder.failures().len(), 2);
    }

    #[tokio::test]
    async fn test_logoff_without_connection_reports_failure() {
        let connection = Connection::new(test_config(), NoLogin);
        let recorder = Recorder::new();
        connection.handle().add_connection_listener(recorder.clone());

        connection.handle().logoff();
        assert_eq!(recorder.failures(), vec!["not connected".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sends_keep_stanzas_whole() {
        const TASKS: usize = 8;
        const PER_TASK: usize = 50;

        let (client, mut server) = tokio::io::duplex(1024);
        let connection = Connection::new(test_config(), NoLogin);
        let handle = connection.handle();
        let recorder = Recorder::new();
        handle.add_connection_listener(recorder.clone());
        let run = tokio::spawn(connection.run_with_stream(client));

        while !handle.is_logged_in() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let reader = tokio::spawn(async move {
            let mut written = String::new();
            read_to_close(&mut server, &mut written).await;
            (server, written)
        });

        let senders: Vec<_> = (0..TASKS)
            .map(|task| {
                let handle = handle.clone();
                tokio::spawn(async move {
                    for n in 0..PER_TASK {
                        let mut message =
                            Message::chat(jid("bob@example.com"), format!("payload {} of task {}", n, task));
                        message.id = Some(format!("{}-{}", task, n));
                        handle.send(message);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.await.unwrap();
        }
        handle.logoff();

        let (mut server, written) = reader.await.unwrap();
        let mut ids = Vec::new();
        let mut offset = 0;
        let mut closed = false;
        while let Some((frame, consumed)) = framing::extract_frame(&written.as_bytes()[offset..]).unwrap() {
            offset += consumed;
            match frame {
                Frame::Element { xml, .. } => match Stanza::decode(&xml).unwrap() {
                    Some(Stanza::Message(message)) => ids.push(message.id.unwrap()),
                    other => panic!("unexpected stanza: {:?}", other),
                },
                Frame::StreamClose => closed = true,
                Frame::StreamOpen(_) => panic!("unexpected stream header"),
            }
        }
        assert!(closed);
        assert_eq!(offset, written.len());
        assert_eq!(ids.len(), TASKS * PER_TASK);
        // Each task's stanzas stay in the order it sent them.
        for task in 0..TASKS {
            let prefix = format!("{}-", task);
            let sequence: Vec<usize> = ids
                .iter()
                .filter_map(|id| id.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(sequence, (0..PER_TASK).collect::<Vec<_>>());
        }

        server.write_all(STREAM_CLOSE.as_bytes()).await.unwrap();
        assert!(matches!(run.await.unwrap(), Err(ConnectionError::StreamClosed)));
        assert_eq!(recorder.failures(), vec!["stream closed by server".to_string()]);
    }

    async fn read_to_close(server: &mut DuplexStream, written: &mut String) {
        let mut buf = [0u8; 256];
        loop {
            let n = server.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            written.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = test_config()
            .with_server("127.0.0.1")
            .with_port(port)
            .with_tls(false);
        let connection = Connection::new(config, NoLogin);
        let recorder = Recorder::new();
        connection.handle().add_connection_listener(recorder.clone());

        assert!(matches!(
            connection.run().await,
            Err(ConnectionError::ConnectFailed { .. })
        ));
        assert_eq!(recorder.failures().len(), 1);
    }

    #[test]
    fn test_server_input_configures_endpoint() {
        let config = test_config().with_server_input("tls://xmpp.example.net:5270");
        assert_eq!(config.server_host(), "xmpp.example.net");
        assert_eq!(config.port, Some(5270));
        assert!(config.use_tls);

        let config = test_config().with_server_input("example.org");
        assert_eq!(config.server_host(), "example.org");
        assert_eq!(config.port, None);

        let config = test_config().with_server_input("[::1]:5222");
        assert_eq!(config.server_host(), "::1");
        assert_eq!(config.port, Some(5222));
        assert!(!config.use_tls);

        assert_eq!(test_config().server_host(), "example.com");
        assert!(!format!("{:?}", test_config()).contains("secret"));
    }
}
