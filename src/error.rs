use thiserror::Error;

/// Errors produced while parsing an XMPP address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("address has an empty domain")]
    EmptyDomain,

    #[error("address has an empty local part")]
    EmptyLocal,

    #[error("address has an empty resource")]
    EmptyResource,
}

/// Errors produced by the stanza codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("<{element}/> is missing the '{attribute}' attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("<{element}/> has an invalid '{attribute}' value: {value}")]
    InvalidAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },

    #[error("invalid address: {0}")]
    InvalidJid(#[from] JidError),
}

impl StanzaError {
    /// Whether the input was not well-formed XML. Other errors concern one
    /// stanza's attribute values; the stream itself is still intact.
    pub fn is_malformed(&self) -> bool {
        matches!(self, StanzaError::Xml(_))
    }
}

/// Fatal connection errors. Every variant ends the connection and is reported
/// to the connection-failure listeners.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("DNS resolution failed: {0}")]
    DnsResolutionFailed(String),

    #[error("failed to connect to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TCP connect timed out after {secs}s to {host}:{port}")]
    ConnectTimeout { host: String, port: u16, secs: u64 },

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("login failed: {0}")]
    LoginFailed(String),

    #[error("stream framing error: {0}")]
    Framing(String),

    #[error(transparent)]
    Stanza(#[from] StanzaError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stream closed by server")]
    StreamClosed,

    #[error("not connected")]
    NotConnected,
}
