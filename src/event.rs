//! Decoded event model and per-format body decoding

use crate::constants::HEADER_CONTENT_LENGTH;
use crate::error::{EslError, EslResult};
use crate::frame::Headers;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A decoded switch event: header multimap plus optional body.
///
/// Derived from the body of an event-kind frame. For the plain-text
/// encoding the body is itself a nested header block; for JSON and XML it
/// is a structured document mapped onto the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event headers (`Event-Name`, `Unique-ID`, channel variables, ...).
    pub headers: Headers,
    /// Inner payload, present when the event headers carried their own
    /// `Content-Length`.
    pub body: Option<String>,
}

impl Event {
    /// Empty event.
    pub fn new() -> Self {
        Self::default()
    }

    /// The `Event-Name` header.
    pub fn name(&self) -> Option<String> {
        self.header("Event-Name")
    }

    /// First value of `name`, percent-decoded.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    /// Whether the event carries the header.
    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    /// Event body, if any.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// `Unique-ID` header: the channel UUID the event belongs to.
    pub fn unique_id(&self) -> Option<String> {
        self.header("Unique-ID")
    }

    /// `Application-UUID` header: set on execute-complete events.
    pub fn application_uuid(&self) -> Option<String> {
        self.header("Application-UUID")
    }

    /// `Job-UUID` header: set on background job completion events.
    pub fn job_uuid(&self) -> Option<String> {
        self.header("Job-UUID")
    }

    /// Look up a channel variable, exposed as a `variable_{name}` header.
    pub fn variable(&self, name: &str) -> Option<String> {
        self.header(&format!("variable_{name}"))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}",
            self.name().unwrap_or_default()
        )?;
        for (key, value) in self.headers.iter() {
            writeln!(f, "{}: {}", key, value)?;
        }
        if let Some(body) = &self.body {
            f.write_str(body)?;
        }
        Ok(())
    }
}

/// Decode a `text/event-plain` frame body.
///
/// The body is a nested header block terminated by a blank line. If those
/// headers carry their own `Content-Length`, exactly that many following
/// bytes form the inner body.
pub fn decode_plain(body: &str) -> EslResult<Event> {
    let mut headers = Headers::new();
    let mut rest = body;

    loop {
        let (line, remainder) = match rest.split_once('\n') {
            Some((line, remainder)) => (line.trim_end_matches('\r'), remainder),
            None => (rest.trim_end_matches('\r'), ""),
        };
        rest = remainder;

        if line.is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((name, value)) => headers.insert(name.trim(), value.trim()),
            None => {
                return Err(EslError::Framing(format!(
                    "malformed event header line: {line:?}"
                )))
            }
        }
        if rest.is_empty() {
            break;
        }
    }

    let body = match headers.get_raw(HEADER_CONTENT_LENGTH) {
        Some(raw) => {
            let length: usize = raw
                .trim()
                .parse()
                .map_err(|_| EslError::Framing(format!("invalid event Content-Length: {raw:?}")))?;
            if rest.len() < length {
                return Err(EslError::framing("event body shorter than Content-Length"));
            }
            Some(rest[..length].to_string())
        }
        None => None,
    };

    Ok(Event { headers, body })
}

/// Decode a `text/event-json` frame body.
///
/// Top-level string fields become headers; the `_body` field, when present,
/// becomes the event body. Non-string values are kept as their JSON text.
pub fn decode_json(body: &str) -> EslResult<Event> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| EslError::Framing(format!("invalid JSON event: {e}")))?;

    let mut event = Event::new();
    let Some(object) = value.as_object() else {
        return Err(EslError::framing("JSON event is not an object"));
    };

    for (key, value) in object {
        if key == "_body" {
            if let Some(text) = value.as_str() {
                event.body = Some(text.to_string());
            }
            continue;
        }
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        event.headers.insert(key.clone(), text);
    }

    Ok(event)
}

/// Decode a `text/event-xml` frame body.
///
/// Expected document shape:
///
/// ```xml
/// <event>
///   <headers>
///     <Event-Name>HEARTBEAT</Event-Name>
///   </headers>
///   <body>...</body>
/// </event>
/// ```
pub fn decode_xml(body: &str) -> EslResult<Event> {
    use quick_xml::events::Event as XmlEvent;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(body);
    let mut event = Event::new();
    let mut in_headers = false;
    let mut in_body = false;
    let mut current_tag: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(XmlEvent::Start(ref e)) => {
                let tag = String::from_utf8_lossy(
                    e.name().as_ref(),
                )
                .to_string();
                match tag.as_str() {
                    "headers" => in_headers = true,
                    "body" => in_body = true,
                    _ if in_headers => current_tag = Some(tag),
                    _ => {}
                }
            }
            Ok(XmlEvent::End(ref e)) => {
                let tag = String::from_utf8_lossy(
                    e.name().as_ref(),
                )
                .to_string();
                match tag.as_str() {
                    "headers" => in_headers = false,
                    "body" => in_body = false,
                    _ if in_headers => current_tag = None,
                    _ => {}
                }
            }
            Ok(XmlEvent::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| EslError::Framing(format!("invalid XML event: {e}")))?
                    .to_string();
                if in_body {
                    event.body = Some(text);
                } else if let Some(tag) = &current_tag {
                    event.headers.insert(tag.clone(), text);
                }
            }
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(EslError::Framing(format!("invalid XML event: {e}"))),
            _ => {}
        }
    }

    Ok(event)
}
