//! Raw frame model: header multimap plus optional body

use crate::constants::{
    CONTENT_TYPE_API_RESPONSE, CONTENT_TYPE_AUTH_REQUEST, CONTENT_TYPE_COMMAND_REPLY,
    CONTENT_TYPE_DISCONNECT_NOTICE, CONTENT_TYPE_TEXT_EVENT_JSON, CONTENT_TYPE_TEXT_EVENT_PLAIN,
    CONTENT_TYPE_TEXT_EVENT_XML, HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_REPLY_TEXT,
};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Frame classification derived from the `Content-Type` header.
///
/// Every frame the peer sends falls into exactly one of these kinds; the
/// dispatch loop routes each kind to its own delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `command/reply`
    Reply,
    /// `api/response`
    ApiResponse,
    /// `text/event-plain`
    EventPlain,
    /// `text/event-xml`
    EventXml,
    /// `text/event-json`
    EventJson,
    /// `auth/request`
    AuthRequest,
    /// `text/disconnect-notice`
    Disconnect,
}

impl FrameKind {
    /// Map a `Content-Type` value to a kind, `None` when unrecognized.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        match content_type {
            CONTENT_TYPE_COMMAND_REPLY => Some(FrameKind::Reply),
            CONTENT_TYPE_API_RESPONSE => Some(FrameKind::ApiResponse),
            CONTENT_TYPE_TEXT_EVENT_PLAIN => Some(FrameKind::EventPlain),
            CONTENT_TYPE_TEXT_EVENT_XML => Some(FrameKind::EventXml),
            CONTENT_TYPE_TEXT_EVENT_JSON => Some(FrameKind::EventJson),
            CONTENT_TYPE_AUTH_REQUEST => Some(FrameKind::AuthRequest),
            CONTENT_TYPE_DISCONNECT_NOTICE => Some(FrameKind::Disconnect),
            _ => None,
        }
    }

    /// The wire `Content-Type` value for this kind.
    pub fn as_content_type(&self) -> &'static str {
        match self {
            FrameKind::Reply => CONTENT_TYPE_COMMAND_REPLY,
            FrameKind::ApiResponse => CONTENT_TYPE_API_RESPONSE,
            FrameKind::EventPlain => CONTENT_TYPE_TEXT_EVENT_PLAIN,
            FrameKind::EventXml => CONTENT_TYPE_TEXT_EVENT_XML,
            FrameKind::EventJson => CONTENT_TYPE_TEXT_EVENT_JSON,
            FrameKind::AuthRequest => CONTENT_TYPE_AUTH_REQUEST,
            FrameKind::Disconnect => CONTENT_TYPE_DISCONNECT_NOTICE,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_content_type())
    }
}

/// Ordered header multimap with case-insensitive keys.
///
/// Insertion order is preserved; a key may appear multiple times. Lookups
/// return the first matching value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any existing values for the same key.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Remove every value stored under `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// First raw (undecoded) value for `name`.
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// First value for `name`, percent-decoded.
    ///
    /// The switch percent-escapes header values on the wire; an invalid
    /// escape sequence falls back to the raw value.
    pub fn get(&self, name: &str) -> Option<String> {
        self.get_raw(name).map(decode_value)
    }

    /// Whether any value exists under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.get_raw(name).is_some()
    }

    /// Iterate over `(name, raw value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of stored values (not distinct keys).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no headers are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render headers to wire form for an outgoing message.
    ///
    /// Keys are sorted lexicographically, embedded CRLF in values is
    /// normalized to LF, lines are CRLF-delimited with no trailing
    /// terminator. Re-parsing the output yields the same canonical form.
    pub fn to_wire(&self) -> String {
        let mut sorted: Vec<&(String, String)> = self.entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));

        let lines: Vec<String> = sorted
            .iter()
            .map(|(key, value)| format!("{}: {}", key, value.replace("\r\n", "\n")))
            .collect();
        lines.join("\r\n")
    }
}

fn decode_value(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// One complete header-block-plus-optional-body unit read from the peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    /// Parsed header block.
    pub headers: Headers,
    /// Exactly `Content-Length` bytes, when that header was present.
    pub body: Option<String>,
}

impl Frame {
    /// Build a frame from parsed parts.
    pub fn new(headers: Headers, body: Option<String>) -> Self {
        Self { headers, body }
    }

    /// Classification from the `Content-Type` header.
    pub fn kind(&self) -> Option<FrameKind> {
        self.headers.get_raw(HEADER_CONTENT_TYPE).and_then(FrameKind::from_content_type)
    }

    /// First value of `name`, percent-decoded.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    /// Whether the frame carries the header.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Frame body, if any.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Reply text: the `Reply-Text` header when present, otherwise the body.
    ///
    /// `api/response` frames carry their status in the body rather than a
    /// `Reply-Text` header.
    pub fn reply_text(&self) -> String {
        if let Some(text) = self.header(HEADER_REPLY_TEXT) {
            return text;
        }
        self.body.clone().unwrap_or_default()
    }

    /// `true` when the reply text starts with `+OK`.
    ///
    /// Only meaningful for `command/reply` frames; `api/response` bodies
    /// carry data, not a status prefix. Use [`Frame::is_err`] to detect
    /// failure there.
    pub fn is_ok(&self) -> bool {
        self.reply_text().starts_with("+OK")
    }

    /// `true` when the reply text starts with `-ERR`, the switch's only
    /// failure marker.
    pub fn is_err(&self) -> bool {
        self.reply_text().starts_with("-ERR")
    }

    /// `Unique-ID` header, the channel UUID on connect replies and events.
    pub fn channel_uuid(&self) -> Option<String> {
        self.header("Unique-ID")
    }

    /// `Job-UUID` header from `bgapi` replies.
    pub fn job_uuid(&self) -> Option<String> {
        self.header("Job-UUID")
    }

    /// Look up a channel variable, exposed as a `variable_{name}` header.
    pub fn variable(&self, name: &str) -> Option<String> {
        self.header(&format!("variable_{name}"))
    }

    /// Render to canonical wire form: sorted headers, CRLF-normalized
    /// values, `Content-Length` only when a body exists.
    pub fn to_wire(&self) -> String {
        let mut headers = self.headers.clone();
        headers.remove(HEADER_CONTENT_LENGTH);
        if let Some(body) = &self.body {
            headers.set(HEADER_CONTENT_LENGTH, body.len().to_string());
            format!("{}\r\n\r\n{}", headers.to_wire(), body)
        } else {
            format!("{}\r\n\r\n", headers.to_wire())
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.headers.iter() {
            writeln!(f, "{}: {}", key, value)?;
        }
        if let Some(body) = &self.body {
            f.write_str(body)?;
        }
        Ok(())
    }
}
