/*!
 * Block-structured line protocol shared by all device models.
 *
 * Devices speak in sections: a header line ending in `:`, body lines, and a
 * blank line that ends the section. Commands sent to a device use the same
 * framing, and the device answers each one with a bare `ACK` or `NAK` line.
 * On connect the device dumps its complete state as a run of sections
 * called the prelude.
 *
 * [`TelnetProtocol`] describes one device model's section vocabulary and
 * [`SectionParser`] turns the incoming byte stream into calls on it.
 */
use std::fmt::Debug;
use std::marker::PhantomData;

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Line that acknowledges a command
pub const ACK: &str = "ACK";

/// Line that rejects a command
pub const NAK: &str = "NAK";

/// Header of the preamble section every model starts its prelude with
pub const PROTOCOL_PREAMBLE: &str = "PROTOCOL PREAMBLE:";

/// A line inside a recognized section that could not be applied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A parsed index is outside the declared bounds
    #[error("index {index} out of range in {section} (length {len})")]
    IndexOutOfRange {
        /// Section the line belongs to
        section: String,
        /// The offending index
        index: usize,
        /// Declared length
        len: usize,
    },

    /// A field that should be numeric is not
    #[error("invalid number '{value}' in {section}")]
    InvalidNumber {
        /// Section the line belongs to
        section: String,
        /// The text that failed to parse
        value: String,
    },

    /// A field has a value outside its vocabulary
    #[error("invalid value '{value}' for {field}")]
    InvalidValue {
        /// Field name
        field: String,
        /// The rejected value
        value: String,
    },

    /// A line does not have the shape its section requires
    #[error("malformed line in {section}: '{line}'")]
    Malformed {
        /// Section the line belongs to
        section: String,
        /// The line as received
        line: String,
    },
}

/// Device reply to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The command was applied
    Ack,
    /// The command was rejected
    Nak,
}

/// Section vocabulary and state model of one device family
pub trait TelnetProtocol: Send + Sync + 'static {
    /// Device state assembled from the prelude and later updates
    type State: Default + Clone + Debug + Send + Sync + 'static;

    /// Change notifications published as fields change
    type Event: Clone + Debug + Send + Sync + 'static;

    /// Short name used for logs and task names
    const NAME: &'static str;

    /// Whether `line` opens one of this model's sections
    fn is_section_header(line: &str) -> bool;

    /// Apply one body line of `section` to `state`
    ///
    /// Lines the model does not know are ignored. A line that is
    /// recognized but cannot be applied is a violation; `state` must be
    /// left untouched in that case.
    fn parse_line(
        state: &mut Self::State,
        section: &str,
        line: &str,
        events: &mut Vec<Self::Event>,
    ) -> Result<(), ProtocolViolation>;

    /// Whether finishing `section` completes the prelude
    fn ends_prelude(state: &Self::State, section: &str) -> bool;

    /// Unique id of the device, once known
    fn device_id(state: &Self::State) -> Option<&str>;
}

/// What one call to [`SectionParser::feed`] produced
#[derive(Debug)]
pub struct ParseOutput<E> {
    /// Events for fields that changed
    pub events: Vec<E>,
    /// Command replies, in wire order
    pub replies: Vec<Reply>,
    /// The prelude finished within this input
    pub prelude_completed: bool,
}

impl<E> Default for ParseOutput<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            replies: Vec::new(),
            prelude_completed: false,
        }
    }
}

/// Splits the incoming stream into lines and dispatches them
///
/// Owned by a single read loop; partial lines are buffered until their
/// terminator arrives, so multi-byte characters split across reads decode
/// correctly.
#[derive(Debug)]
pub struct SectionParser<P: TelnetProtocol> {
    buffer: BytesMut,
    current_section: Option<String>,
    prelude_parsed: bool,
    _protocol: PhantomData<P>,
}

impl<P: TelnetProtocol> Default for SectionParser<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: TelnetProtocol> SectionParser<P> {
    /// Create a parser for a fresh connection
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            current_section: None,
            prelude_parsed: false,
            _protocol: PhantomData,
        }
    }

    /// Whether the prelude has been seen
    pub fn prelude_parsed(&self) -> bool {
        self.prelude_parsed
    }

    /// Section currently being read
    pub fn current_section(&self) -> Option<&str> {
        self.current_section.as_deref()
    }

    /// Consume `data` and apply every complete line to `state`
    pub fn feed(&mut self, data: &[u8], state: &mut P::State) -> ParseOutput<P::Event> {
        self.buffer.extend_from_slice(data);
        let mut output = ParseOutput::default();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw = self.buffer.split_to(pos);
            self.buffer.advance(1);
            let text = String::from_utf8_lossy(&raw);
            let line = text.trim_end_matches('\r');
            self.handle_line(line, state, &mut output);
        }

        output
    }

    fn handle_line(&mut self, line: &str, state: &mut P::State, output: &mut ParseOutput<P::Event>) {
        trace!(protocol = P::NAME, "<- {}", line);

        if line.trim().is_empty() {
            if let Some(section) = self.current_section.take() {
                if !self.prelude_parsed && P::ends_prelude(state, &section) {
                    debug!(protocol = P::NAME, "Prelude complete");
                    self.prelude_parsed = true;
                    output.prelude_completed = true;
                }
            }
            return;
        }

        // Devices may append detail after the reply token
        if line.starts_with(ACK) {
            output.replies.push(Reply::Ack);
            return;
        }
        if line.starts_with(NAK) {
            output.replies.push(Reply::Nak);
            return;
        }

        if P::is_section_header(line) {
            self.current_section = Some(line.to_string());
            return;
        }

        match &self.current_section {
            Some(section) => {
                if let Err(violation) = P::parse_line(state, section, line, &mut output.events) {
                    warn!(protocol = P::NAME, "Skipping line: {}", violation);
                }
            }
            None => debug!(protocol = P::NAME, "Ignoring line outside a section: '{}'", line),
        }
    }
}

/// Encode a command block
pub fn encode_block<I, S>(header: &str, lines: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut block = String::from(header);
    block.push('\n');
    for line in lines {
        block.push_str(line.as_ref());
        block.push('\n');
    }
    block.push('\n');
    block
}

/// Split a `Key: value` line
pub fn split_key_value(line: &str) -> Option<(&str, &str)> {
    line.split_once(':')
        .map(|(key, value)| (key.trim(), value.trim()))
}

/// Split an `<index> <rest>` line; `rest` may be empty
pub fn split_index(line: &str) -> Option<(&str, &str)> {
    match line.split_once(' ') {
        Some((index, rest)) => Some((index, rest)),
        None if !line.is_empty() => Some((line, "")),
        None => None,
    }
}

/// Parse an unsigned number in `section`
pub fn parse_number(section: &str, value: &str) -> Result<usize, ProtocolViolation> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolViolation::InvalidNumber {
            section: section.to_string(),
            value: value.to_string(),
        })
}

/// Parse an index and check it against `len`
pub fn parse_index(section: &str, value: &str, len: usize) -> Result<usize, ProtocolViolation> {
    let index = parse_number(section, value)?;
    if index >= len {
        return Err(ProtocolViolation::IndexOutOfRange {
            section: section.to_string(),
            index,
            len,
        });
    }
    Ok(index)
}

/// Parse a `true`/`false` field
pub fn parse_bool(field: &str, value: &str) -> Result<bool, ProtocolViolation> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(ProtocolViolation::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}
