//! XMPP stream framing: splits the inbound byte stream into top-level units.
//!
//! A client stream is one long XML document whose root `<stream:stream>` is
//! never closed until the session ends. The extractor therefore works on the
//! accumulated byte buffer and returns one complete top-level element at a
//! time, together with the number of bytes it consumed.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::error::ConnectionError;

/// Upper bound on buffered, not yet complete, stream data.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// One top-level unit of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The `<stream:stream ...>` header, including any XML declaration.
    StreamOpen(String),
    /// `</stream:stream>`: the peer ended the stream.
    StreamClose,
    /// A complete top-level element. `name` is its local name.
    Element { name: String, xml: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Idle,
    InElement,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Partial input surfaces from quick-xml as an "unclosed" syntax error.
fn is_incomplete(error: &quick_xml::Error) -> bool {
    matches!(
        error,
        quick_xml::Error::Syntax(
            SyntaxError::UnclosedTag
                | SyntaxError::UnclosedPIOrXmlDecl
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedCData
        )
    )
}

/// Extract the first complete frame from `buffer`.
///
/// Returns `Ok(Some((frame, consumed)))` when a frame is complete and
/// `Ok(None)` when more bytes are needed. Malformed input is an error; the
/// stream cannot be resynchronised after that.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>, ConnectionError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    // The root element is open for the whole session, so end names are
    // checked per element by the stanza decoder instead.
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut element_start: usize = 0;
    let mut element_name = String::new();

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && e.name().local_name().as_ref() == b"stream" {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::StreamOpen(bytes_to_string(&buffer[..tag_end])),
                        tag_end,
                    )));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InElement;
                    element_start = pos;
                    element_name = bytes_to_string(e.name().local_name().as_ref());
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    let local_name = e.name().local_name();
                    let frame = if local_name.as_ref() == b"stream" {
                        Frame::StreamOpen(bytes_to_string(&buffer[..tag_end]))
                    } else {
                        Frame::Element {
                            name: bytes_to_string(local_name.as_ref()),
                            xml: bytes_to_string(&buffer[pos..tag_end]),
                        }
                    };
                    return Ok(Some((frame, tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(_)) => {
                if depth == 0 {
                    // Only the stream root can close at this level.
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, tag_end)));
                }

                depth -= 1;
                if state == ParserState::InElement && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Element {
                            name: std::mem::take(&mut element_name),
                            xml: bytes_to_string(&buffer[element_start..tag_end]),
                        },
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            Err(e) if is_incomplete(&e) => return Ok(None),
            Err(e) => return Err(ConnectionError::Framing(e.to_string())),
        }
    }
}

/// Buffers reads from the transport and yields whole frames.
pub struct StanzaReader<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
    max_buffer: usize,
}

impl<R: AsyncRead + Unpin> StanzaReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK_SIZE),
            chunk: vec![0; READ_CHUNK_SIZE],
            max_buffer: MAX_STANZA_BUFFER_SIZE,
        }
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Next frame from the stream, or `Ok(None)` at end of input.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ConnectionError> {
        loop {
            if let Some((frame, consumed)) = extract_frame(&self.buffer)? {
                self.buffer.drain(..consumed);
                trace!(remaining = self.buffer.len(), "Frame extracted");
                return Ok(Some(frame));
            }

            let leading_ws = self
                .buffer
                .iter()
                .take_while(|b| b.is_ascii_whitespace())
                .count();
            self.buffer.drain(..leading_ws);

            if self.buffer.len() > self.max_buffer {
                return Err(ConnectionError::Framing(format!(
                    "incomplete element exceeds {} bytes",
                    self.max_buffer
                )));
            }

            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if !self.buffer.is_empty() {
                    trace!(pending = self.buffer.len(), "Stream ended inside an element");
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&self.chunk[..n]);
        }
    }
}
