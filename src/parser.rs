//! Incremental XML tokenizer for the socket read loop.
//!
//! Socket reads deliver arbitrary byte slices, so the parser keeps everything
//! unconsumed in a carry-over buffer and re-lexes from its start on every
//! [`XmlParser::feed`]. quick-xml's zero-copy reader makes the re-parse a
//! scan over bytes already in memory; only fully lexed constructs are drained
//! from the buffer and emitted as events.

use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

/// Cap on bytes held while waiting for a construct to complete. A peer that
/// streams an unterminated tag or endless character data hits this instead of
/// growing the buffer forever.
pub const MAX_PARSE_BUFFER_SIZE: usize = 1024 * 1024;

/// One lexical construct from the stream, namespace-unaware.
///
/// Names are the raw qualified names as written; namespace resolution happens
/// in the connection layer, which tracks scopes across elements. Declarations
/// are split out of the attribute list: `("", uri)` is a default `xmlns`,
/// anything else an `xmlns:prefix`, both in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum XmlEvent {
    ElementStart {
        qname: String,
        declarations: Vec<(String, String)>,
        attributes: Vec<(String, String)>,
    },
    ElementEnd {
        qname: String,
    },
    /// Character data with entities decoded. Not trimmed.
    Text(String),
    /// CDATA contents, verbatim.
    CData(String),
    Comment,
    ProcessingInstruction,
    DocType,
}

/// Why a feed was rejected. All of these are fatal for the stream.
#[derive(Debug, Error)]
pub enum XmlParseError {
    #[error("malformed XML: {0}")]
    Malformed(#[from] quick_xml::Error),
    #[error("malformed attribute: {0}")]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error("stream data is not valid UTF-8")]
    Encoding,
    #[error("unparsed stream data exceeds the receive buffer limit")]
    BufferOverflow,
}

/// Push parser: bytes in, [`XmlEvent`]s out.
#[derive(Debug, Default)]
pub struct XmlParser {
    buffer: Vec<u8>,
}

impl XmlParser {
    pub fn new() -> Self {
        XmlParser::default()
    }

    /// Feed one chunk from the socket and collect every event that is
    /// complete so far.
    ///
    /// Incomplete trailing constructs stay buffered for the next feed. A
    /// trailing text run is also held back even when lexable, because the
    /// next chunk may extend it or complete a split entity; stream traffic
    /// always follows text with a tag, so it never sticks forever.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<XmlEvent>, XmlParseError> {
        self.buffer.extend_from_slice(data);

        let mut events = Vec::new();
        let mut consumed = 0usize;

        let mut reader = Reader::from_reader(&self.buffer[..]);
        reader.config_mut().trim_text(false);
        // End tags are matched against the element stack upstream; this
        // reader only ever sees a window of the document.
        reader.config_mut().check_end_names = false;
        reader.config_mut().allow_unmatched_ends = true;

        loop {
            match reader.read_event() {
                Ok(Event::Decl(_)) => {
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::Start(e)) => {
                    let (qname, declarations, attributes) = split_markup(&e)?;
                    events.push(XmlEvent::ElementStart {
                        qname,
                        declarations,
                        attributes,
                    });
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::Empty(e)) => {
                    let (qname, declarations, attributes) = split_markup(&e)?;
                    events.push(XmlEvent::ElementStart {
                        qname: qname.clone(),
                        declarations,
                        attributes,
                    });
                    events.push(XmlEvent::ElementEnd { qname });
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::End(e)) => {
                    let qname = std::str::from_utf8(e.name().as_ref())
                        .map_err(|_| XmlParseError::Encoding)?
                        .to_string();
                    events.push(XmlEvent::ElementEnd { qname });
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::Text(t)) => {
                    let end = reader.buffer_position() as usize;
                    if end >= self.buffer.len() {
                        // Touches the buffer end: hold it for the next feed.
                        break;
                    }
                    let text = t.unescape()?.into_owned();
                    events.push(XmlEvent::Text(text));
                    consumed = end;
                }
                Ok(Event::CData(e)) => {
                    let data = e.into_inner();
                    let text = std::str::from_utf8(&data)
                        .map_err(|_| XmlParseError::Encoding)?
                        .to_string();
                    events.push(XmlEvent::CData(text));
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::Comment(_)) => {
                    events.push(XmlEvent::Comment);
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::PI(_)) => {
                    events.push(XmlEvent::ProcessingInstruction);
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::DocType(_)) => {
                    events.push(XmlEvent::DocType);
                    consumed = reader.buffer_position() as usize;
                }
                Ok(Event::Eof) => break,
                // An unterminated construct means the rest of it has not
                // arrived yet; everything else is genuinely bad input.
                Err(quick_xml::Error::Syntax(syntax)) => match syntax {
                    SyntaxError::UnclosedTag
                    | SyntaxError::UnclosedComment
                    | SyntaxError::UnclosedDoctype
                    | SyntaxError::UnclosedCData
                    | SyntaxError::UnclosedPIOrXmlDecl => break,
                    other => {
                        return Err(XmlParseError::Malformed(quick_xml::Error::Syntax(other)))
                    }
                },
                Err(e) => return Err(XmlParseError::Malformed(e)),
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        if self.buffer.len() > MAX_PARSE_BUFFER_SIZE {
            return Err(XmlParseError::BufferOverflow);
        }
        Ok(events)
    }
}

/// Split an opening tag into its name, namespace declarations, and ordinary
/// attributes.
fn split_markup(
    e: &BytesStart<'_>,
) -> Result<(String, Vec<(String, String)>, Vec<(String, String)>), XmlParseError> {
    let qname = std::str::from_utf8(e.name().as_ref())
        .map_err(|_| XmlParseError::Encoding)?
        .to_string();

    let mut declarations = Vec::new();
    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|_| XmlParseError::Encoding)?
            .to_string();
        let value = attr.unescape_value()?.into_owned();

        if key == "xmlns" {
            declarations.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declarations.push((prefix.to_string(), value));
        } else {
            attributes.push((key, value));
        }
    }
    Ok((qname, declarations, attributes))
}
