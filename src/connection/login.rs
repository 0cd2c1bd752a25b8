//! Login strategies run by the engine between connect and the parse loop.

use std::future::Future;

use base64::Engine as _;
use tracing::{debug, info, warn};

use super::framing::{Frame, StanzaReader};
use super::transport::BoxedReader;
use super::{ConnectionConfig, ConnectionHandle};
use crate::error::ConnectionError;
use crate::jid::Jid;
use crate::stanza::{Element, Presence, Stanza};

pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";

const BIND_ID: &str = "bind_1";

/// Protocol-specific session setup.
///
/// Runs on the connection task with exclusive access to the inbound stream.
/// An error aborts the connection and is reported to the failure listeners.
pub trait Login: Send + Sync + 'static {
    fn login(
        &self,
        ctx: &mut LoginContext<'_>,
    ) -> impl Future<Output = Result<(), ConnectionError>> + Send;
}

/// What a [`Login`] can do with the freshly opened stream.
pub struct LoginContext<'a> {
    reader: &'a mut StanzaReader<BoxedReader>,
    handle: &'a ConnectionHandle,
}

impl<'a> LoginContext<'a> {
    pub(super) fn new(reader: &'a mut StanzaReader<BoxedReader>, handle: &'a ConnectionHandle) -> Self {
        Self { reader, handle }
    }

    pub fn config(&self) -> &ConnectionConfig {
        self.handle.config()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        self.handle
    }

    /// Queue raw XML for the writer.
    pub fn send_raw(&self, xml: impl Into<String>) -> Result<(), ConnectionError> {
        self.handle.enqueue(xml.into())
    }

    pub fn send(&self, stanza: impl Into<Stanza>) -> Result<(), ConnectionError> {
        self.send_raw(stanza.into().to_xml())
    }

    /// Send the client stream header addressed to the session domain.
    pub fn open_stream(&self) -> Result<(), ConnectionError> {
        let domain = quick_xml::escape::escape(self.config().jid.domain());
        self.send_raw(format!(
            "<?xml version='1.0'?><stream:stream to='{}' version='1.0' \
             xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>",
            domain
        ))
    }

    /// Open a new stream over the same transport, as required after SASL
    /// success. The server answers with a fresh header and features.
    pub fn restart_stream(&self) -> Result<(), ConnectionError> {
        debug!("Restarting stream");
        self.open_stream()
    }

    /// Next top-level element. Stream headers are skipped; the end of the
    /// stream is an error since login is not complete yet.
    pub async fn next_element(&mut self) -> Result<Element, ConnectionError> {
        loop {
            match self.reader.next_frame().await? {
                Some(Frame::StreamOpen(header)) => {
                    debug!(header = %header, "Stream opened by server");
                }
                Some(Frame::Element { xml, .. }) => {
                    debug!(xml = %xml, "RECV (login)");
                    return Ok(Element::parse(&xml)?);
                }
                Some(Frame::StreamClose) | None => return Err(ConnectionError::StreamClosed),
            }
        }
    }

    /// Record the address the server bound for this session.
    pub fn set_bound_jid(&self, jid: Jid) {
        self.handle.set_bound_jid(jid);
    }
}

/// SASL PLAIN authentication followed by resource binding.
#[derive(Debug, Clone)]
pub struct SaslPlainLogin {
    resource: Option<String>,
    initial_presence: bool,
}

impl SaslPlainLogin {
    pub fn new() -> Self {
        Self {
            resource: None,
            initial_presence: true,
        }
    }

    /// Resource to request at bind time. The server picks one when unset.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_initial_presence(mut self, enabled: bool) -> Self {
        self.initial_presence = enabled;
        self
    }

    async fn expect_features(ctx: &mut LoginContext<'_>) -> Result<Element, ConnectionError> {
        let element = ctx.next_element().await?;
        if element.local_name() == "features" {
            Ok(element)
        } else {
            Err(ConnectionError::LoginFailed(format!(
                "expected stream features, got <{}/>",
                element.name()
            )))
        }
    }

    async fn authenticate(&self, ctx: &mut LoginContext<'_>) -> Result<(), ConnectionError> {
        let features = Self::expect_features(ctx).await?;
        let offers_plain = features
            .get_child("mechanisms")
            .map(|m| m.children().any(|c| c.text() == "PLAIN"))
            .unwrap_or(false);
        if !offers_plain {
            return Err(ConnectionError::LoginFailed(
                "server does not offer SASL PLAIN".to_string(),
            ));
        }
        if !ctx.config().use_tls {
            warn!("Sending SASL PLAIN credentials over an unencrypted stream");
        }

        let config = ctx.config();
        let username = config.jid.local().unwrap_or_default();
        let payload = format!("\0{}\0{}", username, config.password);
        let auth = Element::new("auth")
            .with_attr("xmlns", NS_SASL)
            .with_attr("mechanism", "PLAIN")
            .with_text(base64::engine::general_purpose::STANDARD.encode(payload));
        ctx.send_raw(auth.to_xml())?;

        let reply = ctx.next_element().await?;
        match reply.local_name() {
            "success" => Ok(()),
            "failure" => {
                let condition = reply
                    .children()
                    .find(|c| c.local_name() != "text")
                    .map(|c| c.local_name().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                Err(ConnectionError::LoginFailed(format!(
                    "authentication failed: {}",
                    condition
                )))
            }
            other => Err(ConnectionError::LoginFailed(format!(
                "unexpected SASL reply <{}/>",
                other
            ))),
        }
    }

    async fn bind(&self, ctx: &mut LoginContext<'_>) -> Result<Jid, ConnectionError> {
        let features = Self::expect_features(ctx).await?;
        if features.get_child("bind").is_none() {
            return Err(ConnectionError::LoginFailed(
                "server does not offer resource binding".to_string(),
            ));
        }

        let mut bind = Element::new("bind").with_attr("xmlns", NS_BIND);
        if let Some(resource) = &self.resource {
            bind = bind.with_child(Element::new("resource").with_text(resource.as_str()));
        }
        let request = Element::new("iq")
            .with_attr("type", "set")
            .with_attr("id", BIND_ID)
            .with_child(bind);
        ctx.send_raw(request.to_xml())?;

        loop {
            let reply = ctx.next_element().await?;
            if reply.local_name() != "iq" || reply.attr("id") != Some(BIND_ID) {
                debug!(element = reply.name(), "Ignoring element while waiting for bind result");
                continue;
            }
            if reply.attr("type") != Some("result") {
                return Err(ConnectionError::LoginFailed("resource binding refused".to_string()));
            }
            let bound = reply
                .get_child("bind")
                .and_then(|b| b.get_child("jid"))
                .map(|j| j.text())
                .ok_or_else(|| {
                    ConnectionError::LoginFailed("bind result without address".to_string())
                })?;
            return bound
                .parse::<Jid>()
                .map_err(|e| ConnectionError::LoginFailed(format!("bad bound address: {}", e)));
        }
    }
}

impl Default for SaslPlainLogin {
    fn default() -> Self {
        Self::new()
    }
}

impl Login for SaslPlainLogin {
    async fn login(&self, ctx: &mut LoginContext<'_>) -> Result<(), ConnectionError> {
        ctx.open_stream()?;
        self.authenticate(ctx).await?;
        ctx.restart_stream()?;
        let jid = self.bind(ctx).await?;
        info!(jid = %jid, "Session bound");
        ctx.set_bound_jid(jid);

        if self.initial_presence {
            ctx.send(Presence::available())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' from='example.com' version='1.0'>";

    /// Read from the client until `needle` has been seen.
    async fn read_until(server: &mut DuplexStream, seen: &mut String, needle: &str) {
        let mut buf = [0u8; 1024];
        while !seen.contains(needle) {
            let n = tokio::time::timeout(Duration::from_secs(5), server.read(&mut buf))
                .await
                .expect("client stalled")
                .unwrap();
            assert!(n > 0, "client closed before sending {}", needle);
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    #[tokio::test]
    async fn test_sasl_plain_login_binds_resource() {
        let (client, mut server) = tokio::io::duplex(8192);
        let config = ConnectionConfig::new("alice@example.com".parse().unwrap(), "secret");
        let connection = Connection::new(config, SaslPlainLogin::new().with_resource("cli"));
        let handle = connection.handle();
        let run = tokio::spawn(connection.run_with_stream(client));

        let mut seen = String::new();
        read_until(&mut server, &mut seen, "<stream:stream").await;
        assert!(seen.contains("to='example.com'"));
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>")
            .await
            .unwrap();

        read_until(&mut server, &mut seen, "</auth>").await;
        // "\0alice\0secret"
        assert!(seen.contains("mechanism='PLAIN'>AGFsaWNlAHNlY3JldA==</auth>"));
        server
            .write_all(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>")
            .await
            .unwrap();
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>")
            .await
            .unwrap();

        read_until(&mut server, &mut seen, "</iq>").await;
        assert_eq!(seen.matches("<stream:stream").count(), 2);
        assert!(seen.contains("<resource>cli</resource>"));
        server
            .write_all(b"<iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>alice@example.com/cli</jid></bind></iq>")
            .await
            .unwrap();

        read_until(&mut server, &mut seen, "<presence/>").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !handle.is_logged_in() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("login did not complete");
        assert_eq!(
            handle.bound_jid().map(|j| j.to_string()).as_deref(),
            Some("alice@example.com/cli")
        );

        server.write_all(b"</stream:stream>").await.unwrap();
        let result = run.await.unwrap();
        assert!(matches!(result, Err(ConnectionError::StreamClosed)));
        assert!(!handle.is_logged_in());
    }

    #[tokio::test]
    async fn test_sasl_failure_aborts_login() {
        let (client, mut server) = tokio::io::duplex(8192);
        let config = ConnectionConfig::new("alice@example.com".parse().unwrap(), "wrong");
        let connection = Connection::new(config, SaslPlainLogin::new());
        let handle = connection.handle();
        let run = tokio::spawn(connection.run_with_stream(client));

        let mut seen = String::new();
        read_until(&mut server, &mut seen, "<stream:stream").await;
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>")
            .await
            .unwrap();
        read_until(&mut server, &mut seen, "</auth>").await;
        server
            .write_all(b"<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
            .await
            .unwrap();

        match run.await.unwrap() {
            Err(ConnectionError::LoginFailed(reason)) => assert!(reason.contains("not-authorized")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(!handle.is_logged_in());
    }

    #[tokio::test]
    async fn test_missing_plain_mechanism_is_rejected() {
        let (client, mut server) = tokio::io::duplex(8192);
        let config = ConnectionConfig::new("alice@example.com".parse().unwrap(), "secret");
        let run = tokio::spawn(Connection::new(config, SaslPlainLogin::new()).run_with_stream(client));

        let mut seen = String::new();
        read_until(&mut server, &mut seen, "<stream:stream").await;
        server.write_all(SERVER_HEADER.as_bytes()).await.unwrap();
        server
            .write_all(b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>SCRAM-SHA-1</mechanism></mechanisms></stream:features>")
            .await
            .unwrap();

        assert!(matches!(
            run.await.unwrap(),
            Err(ConnectionError::LoginFailed(_))
        ));
    }
}
