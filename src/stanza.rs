//! Stanza codec: typed `<message/>`, `<presence/>` and `<iq/>` values.
//!
//! Decoding works on one complete top-level element as extracted by the
//! stream framing layer; encoding produces a well-formed fragment ready to be
//! written to the stream. Nothing here performs I/O.

use std::borrow::Cow;
use std::fmt;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

use crate::error::StanzaError;
use crate::jid::Jid;

/// Namespace of stanza-level error conditions (RFC 6120 §8.3).
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// A minimal XML element tree, used for stanza payloads the engine does not
/// interpret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    /// Qualified name as it appeared on the wire (may carry a prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_name(&self) -> &str {
        match self.name.rsplit_once(':') {
            Some((_, local)) => local,
            None => &self.name,
        }
    }

    /// The default namespace declared on this element, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.attr("xmlns")
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((key, value)),
        }
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name.
    pub fn get_child(&self, local_name: &str) -> Option<&Element> {
        self.children().find(|c| c.local_name() == local_name)
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Parse exactly one element from `xml`. Leading declarations, comments
    /// and whitespace are ignored; anything after the root element is an
    /// error.
    pub fn parse(xml: &str) -> Result<Element, StanzaError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| StanzaError::Xml(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    if root.is_some() {
                        return Err(StanzaError::Xml("content after root element".into()));
                    }
                    stack.push(element_from_start(&start)?);
                }
                Event::Empty(start) => {
                    if root.is_some() {
                        return Err(StanzaError::Xml("content after root element".into()));
                    }
                    let element = element_from_start(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::End(_) => {
                    let Some(element) = stack.pop() else {
                        return Err(StanzaError::Xml("unexpected end tag".into()));
                    };
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Element(element)),
                        None => root = Some(element),
                    }
                }
                Event::Text(text) => {
                    let text = text
                        .unescape()
                        .map_err(|e| StanzaError::Xml(e.to_string()))?;
                    push_text(&mut stack, &root, text)?;
                }
                Event::CData(cdata) => {
                    let raw = cdata.into_inner();
                    push_text(&mut stack, &root, String::from_utf8_lossy(&raw))?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if !stack.is_empty() {
            return Err(StanzaError::Xml("unclosed element".into()));
        }
        root.ok_or_else(|| StanzaError::Xml("no element found".into()))
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attrs {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(child) => child.write_to(out),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, StanzaError> {
    let mut element = Element::new(String::from_utf8_lossy(start.name().as_ref()));
    for attr in start.attributes() {
        let attr = attr.map_err(|e| StanzaError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| StanzaError::Xml(e.to_string()))?;
        element.attrs.push((key, value.into_owned()));
    }
    Ok(element)
}

fn push_text(
    stack: &mut [Element],
    root: &Option<Element>,
    text: Cow<'_, str>,
) -> Result<(), StanzaError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(Node::Text(text.into_owned()));
            Ok(())
        }
        // Whitespace around the root element is insignificant.
        None if text.trim().is_empty() => Ok(()),
        None if root.is_some() => Err(StanzaError::Xml("content after root element".into())),
        None => Err(StanzaError::Xml("text outside root element".into())),
    }
}

fn jid_attr(element: &Element, attribute: &'static str) -> Result<Option<Jid>, StanzaError> {
    element
        .attr(attribute)
        .map(|value| value.parse::<Jid>())
        .transpose()
        .map_err(StanzaError::from)
}

fn child_text(element: &Element, local_name: &str) -> Option<String> {
    element.get_child(local_name).map(Element::text)
}

fn push_addressing(element: &mut Element, from: &Option<Jid>, to: &Option<Jid>, id: Option<&str>) {
    if let Some(to) = to {
        element.set_attr("to", to.to_string());
    }
    if let Some(from) = from {
        element.set_attr("from", from.to_string());
    }
    if let Some(id) = id {
        element.set_attr("id", id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Normal,
    Chat,
    Groupchat,
    Headline,
    Error,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Normal => "normal",
            MessageType::Chat => "chat",
            MessageType::Groupchat => "groupchat",
            MessageType::Headline => "headline",
            MessageType::Error => "error",
        }
    }

    /// Unknown values are treated as `normal` (RFC 6121 §5.2.2).
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("chat") => MessageType::Chat,
            Some("groupchat") => MessageType::Groupchat,
            Some("headline") => MessageType::Headline,
            Some("error") => MessageType::Error,
            _ => MessageType::Normal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Message {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub thread: Option<String>,
    /// Child elements other than subject, body and thread.
    pub payload: Vec<Element>,
}

impl Message {
    pub fn chat(to: Jid, body: impl Into<String>) -> Self {
        Self {
            to: Some(to),
            kind: MessageType::Chat,
            body: Some(body.into()),
            ..Default::default()
        }
    }

    pub fn from_element(element: &Element) -> Result<Self, StanzaError> {
        let payload = element
            .children()
            .filter(|c| !matches!(c.local_name(), "subject" | "body" | "thread"))
            .cloned()
            .collect();
        Ok(Self {
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            id: element.attr("id").map(str::to_string),
            kind: MessageType::from_attr(element.attr("type")),
            subject: child_text(element, "subject"),
            body: child_text(element, "body"),
            thread: child_text(element, "thread"),
            payload,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("message");
        push_addressing(&mut element, &self.from, &self.to, self.id.as_deref());
        if self.kind != MessageType::Normal {
            element.set_attr("type", self.kind.as_str());
        }
        for (name, text) in [
            ("subject", &self.subject),
            ("body", &self.body),
            ("thread", &self.thread),
        ] {
            if let Some(text) = text {
                element = element.with_child(Element::new(name).with_text(text.as_str()));
            }
        }
        for child in &self.payload {
            element = element.with_child(child.clone());
        }
        element
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceType {
    /// No `type` attribute.
    #[default]
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    pub fn as_str(self) -> Option<&'static str> {
        match self {
            PresenceType::Available => None,
            PresenceType::Unavailable => Some("unavailable"),
            PresenceType::Subscribe => Some("subscribe"),
            PresenceType::Subscribed => Some("subscribed"),
            PresenceType::Unsubscribe => Some("unsubscribe"),
            PresenceType::Unsubscribed => Some("unsubscribed"),
            PresenceType::Probe => Some("probe"),
            PresenceType::Error => Some("error"),
        }
    }

    /// Unknown values are treated as available, like a missing type.
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("unavailable") => PresenceType::Unavailable,
            Some("subscribe") => PresenceType::Subscribe,
            Some("subscribed") => PresenceType::Subscribed,
            Some("unsubscribe") => PresenceType::Unsubscribe,
            Some("unsubscribed") => PresenceType::Unsubscribed,
            Some("probe") => PresenceType::Probe,
            Some("error") => PresenceType::Error,
            _ => PresenceType::Available,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Show {
    Away,
    Chat,
    Dnd,
    Xa,
}

impl Show {
    pub fn as_str(self) -> &'static str {
        match self {
            Show::Away => "away",
            Show::Chat => "chat",
            Show::Dnd => "dnd",
            Show::Xa => "xa",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "away" => Some(Show::Away),
            "chat" => Some(Show::Chat),
            "dnd" => Some(Show::Dnd),
            "xa" => Some(Show::Xa),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Presence {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: PresenceType,
    pub show: Option<Show>,
    pub status: Option<String>,
    pub priority: Option<i8>,
    /// Child elements other than show, status and priority.
    pub payload: Vec<Element>,
}

impl Presence {
    /// Initial available presence with no addressing.
    pub fn available() -> Self {
        Self::default()
    }

    pub fn from_element(element: &Element) -> Result<Self, StanzaError> {
        let payload = element
            .children()
            .filter(|c| !matches!(c.local_name(), "show" | "status" | "priority"))
            .cloned()
            .collect();
        Ok(Self {
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            id: element.attr("id").map(str::to_string),
            kind: PresenceType::from_attr(element.attr("type")),
            show: child_text(element, "show").and_then(|s| Show::parse(&s)),
            status: child_text(element, "status"),
            priority: child_text(element, "priority").and_then(|p| p.trim().parse().ok()),
            payload,
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("presence");
        push_addressing(&mut element, &self.from, &self.to, self.id.as_deref());
        if let Some(kind) = self.kind.as_str() {
            element.set_attr("type", kind);
        }
        if let Some(show) = self.show {
            element = element.with_child(Element::new("show").with_text(show.as_str()));
        }
        if let Some(status) = &self.status {
            element = element.with_child(Element::new("status").with_text(status.as_str()));
        }
        if let Some(priority) = self.priority {
            element = element.with_child(Element::new("priority").with_text(priority.to_string()));
        }
        for child in &self.payload {
            element = element.with_child(child.clone());
        }
        element
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }

    /// A missing type is read as `get`: the query still gets answered.
    fn from_attr(value: Option<&str>) -> Result<Self, StanzaError> {
        match value {
            None | Some("get") => Ok(IqType::Get),
            Some("set") => Ok(IqType::Set),
            Some("result") => Ok(IqType::Result),
            Some("error") => Ok(IqType::Error),
            Some(other) => Err(StanzaError::InvalidAttribute {
                element: "iq",
                attribute: "type",
                value: other.to_string(),
            }),
        }
    }
}

/// An info/query stanza. The `id` is mandatory and is what responses are
/// correlated on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Iq {
    pub from: Option<Jid>,
    pub to: Option<Jid>,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: IqType,
    pub payload: Vec<Element>,
}

impl Iq {
    pub fn new(kind: IqType, id: impl Into<String>) -> Self {
        Self {
            from: None,
            to: None,
            id: id.into(),
            kind,
            payload: Vec::new(),
        }
    }

    pub fn get(id: impl Into<String>, to: Option<Jid>, query: Element) -> Self {
        let mut iq = Self::new(IqType::Get, id);
        iq.to = to;
        iq.payload.push(query);
        iq
    }

    pub fn set(id: impl Into<String>, to: Option<Jid>, query: Element) -> Self {
        let mut iq = Self::new(IqType::Set, id);
        iq.to = to;
        iq.payload.push(query);
        iq
    }

    /// Empty `result` addressed back to the sender.
    pub fn result_reply(&self) -> Iq {
        Iq {
            from: self.to.clone(),
            to: self.from.clone(),
            id: self.id.clone(),
            kind: IqType::Result,
            payload: Vec::new(),
        }
    }

    /// `error` reply carrying a `service-unavailable` condition, sent for
    /// queries no listener handled.
    pub fn error_reply(&self) -> Iq {
        let condition = Element::new("service-unavailable").with_attr("xmlns", NS_STANZAS);
        Iq {
            from: self.to.clone(),
            to: self.from.clone(),
            id: self.id.clone(),
            kind: IqType::Error,
            payload: vec![Element::new("error")
                .with_attr("type", "cancel")
                .with_child(condition)],
        }
    }

    /// The first payload element, conventionally the query.
    pub fn query(&self) -> Option<&Element> {
        self.payload.first()
    }

    pub fn from_element(element: &Element) -> Result<Self, StanzaError> {
        let id = element.attr("id").ok_or(StanzaError::MissingAttribute {
            element: "iq",
            attribute: "id",
        })?;
        Ok(Self {
            from: jid_attr(element, "from")?,
            to: jid_attr(element, "to")?,
            id: id.to_string(),
            kind: IqType::from_attr(element.attr("type"))?,
            payload: element.children().cloned().collect(),
        })
    }

    pub fn to_element(&self) -> Element {
        let mut element = Element::new("iq");
        push_addressing(&mut element, &self.from, &self.to, Some(&self.id));
        element.set_attr("type", self.kind.as_str());
        for child in &self.payload {
            element = element.with_child(child.clone());
        }
        element
    }
}

/// One decoded top-level protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stanza", rename_all = "lowercase")]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    /// Whether a top-level element with this local name decodes to a stanza.
    pub fn is_recognized(local_name: &str) -> bool {
        matches!(local_name, "message" | "presence" | "iq")
    }

    /// Decode one top-level element. Returns `Ok(None)` for elements that are
    /// not stanzas.
    pub fn decode(xml: &str) -> Result<Option<Stanza>, StanzaError> {
        Self::from_element(&Element::parse(xml)?)
    }

    pub fn from_element(element: &Element) -> Result<Option<Stanza>, StanzaError> {
        Ok(Some(match element.local_name() {
            "message" => Stanza::Message(Message::from_element(element)?),
            "presence" => Stanza::Presence(Presence::from_element(element)?),
            "iq" => Stanza::Iq(Iq::from_element(element)?),
            _ => return Ok(None),
        }))
    }

    pub fn to_element(&self) -> Element {
        match self {
            Stanza::Message(m) => m.to_element(),
            Stanza::Presence(p) => p.to_element(),
            Stanza::Iq(iq) => iq.to_element(),
        }
    }

    pub fn to_xml(&self) -> String {
        self.to_element().to_xml()
    }

    pub fn sender(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.from.as_ref(),
            Stanza::Presence(p) => p.from.as_ref(),
            Stanza::Iq(iq) => iq.from.as_ref(),
        }
    }

    pub fn recipient(&self) -> Option<&Jid> {
        match self {
            Stanza::Message(m) => m.to.as_ref(),
            Stanza::Presence(p) => p.to.as_ref(),
            Stanza::Iq(iq) => iq.to.as_ref(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Stanza::Message(m) => m.id.as_deref(),
            Stanza::Presence(p) => p.id.as_deref(),
            Stanza::Iq(iq) => Some(&iq.id),
        }
    }
}

impl From<Message> for Stanza {
    fn from(message: Message) -> Self {
        Stanza::Message(message)
    }
}

impl From<Presence> for Stanza {
    fn from(presence: Presence) -> Self {
        Stanza::Presence(presence)
    }
}

impl From<Iq> for Stanza {
    fn from(iq: Iq) -> Self {
        Stanza::Iq(iq)
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}
