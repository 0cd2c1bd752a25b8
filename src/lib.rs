//! XMPP client connection engine.
//!
//! Owns one long-lived client stream: frames and decodes inbound stanzas,
//! fans them out to registered listeners, correlates IQ responses with their
//! requests and answers queries nobody handled.

pub mod connection;
pub mod error;
pub mod jid;
pub mod listeners;
pub mod stanza;

pub use connection::{Connection, ConnectionConfig, ConnectionHandle, Login, LoginContext, SaslPlainLogin};
pub use error::{ConnectionError, JidError, StanzaError};
pub use jid::Jid;
pub use listeners::{ConnectionListener, IqListener, MessageListener, PresenceListener};
pub use stanza::{Element, Iq, IqType, Message, MessageType, Presence, PresenceType, Show, Stanza};
