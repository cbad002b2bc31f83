//! Wire codec for chatd protocol records.
//!
//! A record is seven tagged fields joined by `|`, each field terminated by the
//! delimiter:
//!
//! ```text
//! CMD:4|SENDER:alice|RECIPIENT:bob|CONTENT:hi|EXTRA:|TYPE:0|PINNED:0|
//! ```
//!
//! Field values escape `\` as `\\` and `|` as `\|`. On the stream every record
//! is prefixed with its byte length as a little-endian u32.

use bytes::{Buf, BufMut, BytesMut};

use crate::constants::{Command, ESCAPE, FIELD_DELIMITER, MessageType};
use crate::{Error, Result};

const TAG_CMD: &str = "CMD:";
const TAG_SENDER: &str = "SENDER:";
const TAG_RECIPIENT: &str = "RECIPIENT:";
const TAG_CONTENT: &str = "CONTENT:";
const TAG_EXTRA: &str = "EXTRA:";
const TAG_TYPE: &str = "TYPE:";
const TAG_PINNED: &str = "PINNED:";

/// Size of the length prefix in front of every record.
pub const FRAME_HEADER_LEN: usize = 4;

/// One protocol record as it travels on the wire.
///
/// `command` keeps the raw code so that unknown or zero-valued commands survive
/// decoding; use [`ProtocolMessage::command`] to get the typed value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolMessage {
    pub command: u32,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub extra: String,
    pub msg_type: MessageType,
    pub pinned: bool,
}

impl ProtocolMessage {
    pub fn new(command: Command) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// A server reply carrying only a command code and a content string.
    pub fn response(command: Command, content: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    /// An unsolicited system notice pushed to a user.
    pub fn notice(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            command: Command::ReceiveMessage.into(),
            sender: sender.into(),
            content: content.into(),
            msg_type: MessageType::System,
            ..Default::default()
        }
    }

    pub fn command(&self) -> Result<Command> {
        Command::try_from(self.command)
    }

    /// Render the record body (without length prefix).
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(
            64 + self.sender.len() + self.recipient.len() + self.content.len() + self.extra.len(),
        );
        push_field(&mut out, TAG_CMD, &self.command.to_string());
        push_field(&mut out, TAG_SENDER, &self.sender);
        push_field(&mut out, TAG_RECIPIENT, &self.recipient);
        push_field(&mut out, TAG_CONTENT, &self.content);
        push_field(&mut out, TAG_EXTRA, &self.extra);
        push_field(&mut out, TAG_TYPE, &u32::from(self.msg_type).to_string());
        push_field(&mut out, TAG_PINNED, if self.pinned { "1" } else { "0" });
        out
    }

    /// Parse a record body.
    ///
    /// Decoding never fails: unknown tags are ignored, missing fields stay
    /// empty or zero, and invalid UTF-8 is replaced. Callers validate field
    /// contents themselves.
    pub fn decode(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut msg = ProtocolMessage::default();

        for segment in split_fields(&text) {
            if let Some(value) = segment.strip_prefix(TAG_CMD) {
                msg.command = parse_number(value);
            } else if let Some(value) = segment.strip_prefix(TAG_SENDER) {
                msg.sender = value.to_string();
            } else if let Some(value) = segment.strip_prefix(TAG_RECIPIENT) {
                msg.recipient = value.to_string();
            } else if let Some(value) = segment.strip_prefix(TAG_CONTENT) {
                msg.content = value.to_string();
            } else if let Some(value) = segment.strip_prefix(TAG_EXTRA) {
                msg.extra = value.to_string();
            } else if let Some(value) = segment.strip_prefix(TAG_TYPE) {
                msg.msg_type = MessageType::from_code(parse_number(value));
            } else if let Some(value) = segment.strip_prefix(TAG_PINNED) {
                msg.pinned = parse_number(value) == 1;
            }
        }

        msg
    }

    /// Write a complete length-prefixed frame.
    pub fn write_message<B: BufMut>(&self, buf: &mut B) {
        let body = self.encode();
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(body.as_bytes());
    }

    pub fn to_frame(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.write_message(&mut buf);
        buf
    }

    /// Take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` while the frame is still incomplete. A declared
    /// length above `max_len` is an error; the stream cannot be resynchronised
    /// after it.
    pub fn read_message(buf: &mut BytesMut, max_len: usize) -> Result<Option<Self>> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > max_len {
            return Err(Error::FrameTooLarge { len, max: max_len });
        }
        if buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_LEN);
        let body = buf.split_to(len);
        Ok(Some(Self::decode(&body)))
    }
}

fn push_field(out: &mut String, tag: &str, value: &str) {
    out.push_str(tag);
    for c in value.chars() {
        if c == FIELD_DELIMITER || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out.push(FIELD_DELIMITER);
}

/// Split on unescaped delimiters, resolving escapes. A trailing empty segment
/// is dropped.
fn split_fields(text: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => current.push(ESCAPE),
            },
            FIELD_DELIMITER => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

/// Leading decimal digits of `value`, or zero.
fn parse_number(value: &str) -> u32 {
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap_or(0)
}
