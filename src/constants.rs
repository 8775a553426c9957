//! Protocol constants and default configuration values

use std::time::Duration;

/// Default ESL port the switch listens on for inbound connections
pub const DEFAULT_ESL_PORT: u16 = 8021;

/// Outgoing message terminator appended after every rendered command
pub const END_OF_MESSAGE: &str = "\r\n\r\n";

/// Maximum single message size (8MB) - validates Content-Length header
/// No legitimate ESL message should exceed this (largest is sofia status ~1-2MB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

/// Content-Type header values, one per frame kind
pub const CONTENT_TYPE_AUTH_REQUEST: &str = "auth/request";
pub const CONTENT_TYPE_COMMAND_REPLY: &str = "command/reply";
pub const CONTENT_TYPE_API_RESPONSE: &str = "api/response";
pub const CONTENT_TYPE_TEXT_EVENT_PLAIN: &str = "text/event-plain";
pub const CONTENT_TYPE_TEXT_EVENT_JSON: &str = "text/event-json";
pub const CONTENT_TYPE_TEXT_EVENT_XML: &str = "text/event-xml";
pub const CONTENT_TYPE_DISCONNECT_NOTICE: &str = "text/disconnect-notice";

/// Protocol framing header: frame classification.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Protocol framing header: body length.
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
/// Protocol framing header: command reply status.
pub const HEADER_REPLY_TEXT: &str = "Reply-Text";

/// Correlation key that receives every dispatched event.
pub const LISTEN_ALL: &str = "ALL";

/// Default timeout for a command's write-and-wait cycle
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bounded wait when handing a frame to its consumer channel
pub const DEFAULT_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the inbound auth handshake
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the outbound "connect" exchange
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for the "exit" exchange during teardown
pub const DEFAULT_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between the outbound handler returning and the exit command.
/// A peer still finishing its own session setup can treat an immediate
/// close as an error; 25ms is a tuned workaround, not an algorithmic need.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(25);
