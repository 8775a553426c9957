//! Outgoing command set: a closed enum of renderable wire messages

use crate::error::{EslError, EslResult};
use crate::frame::Headers;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// Validate that a user-provided string contains no newline characters.
///
/// Commands are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol commands.
fn validate_no_newlines(s: &str, context: &str) -> EslResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(EslError::Framing(format!(
            "{context} must not contain newlines"
        )));
    }
    Ok(())
}

/// A credential kept out of `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    /// Wrap a password string.
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for Password {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Password {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Wire format requested for event subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventFormat {
    /// `text/event-plain` (default)
    #[default]
    Plain,
    /// `text/event-json`
    Json,
    /// `text/event-xml`
    Xml,
}

impl fmt::Display for EventFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFormat::Plain => f.write_str("plain"),
            EventFormat::Json => f.write_str("json"),
            EventFormat::Xml => f.write_str("xml"),
        }
    }
}

/// Every command the engine can issue, as tagged data.
///
/// Each variant renders to a verb line, optional headers, and an optional
/// body via [`Command::render`]; the connection appends the frame
/// terminator. Rendering performs no semantic validation beyond the
/// newline-injection guard.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Command {
    /// `auth <password>` / `userauth <user>:<password>`
    Auth {
        /// `user@domain` for user auth, `None` for password auth.
        user: Option<String>,
        /// The shared secret.
        password: Password,
    },
    /// `api <command> <args>` or `bgapi <command> <args>`
    Api {
        /// The API command name, e.g. `originate`.
        command: String,
        /// Arguments appended after the command.
        arguments: String,
        /// Run asynchronously via `bgapi`, correlated by `Job-UUID`.
        background: bool,
    },
    /// `event <format> <names...>` / `nixevent <format> <names...>`
    Event {
        /// Unsubscribe instead of subscribe.
        ignore: bool,
        /// Encoding of delivered events.
        format: EventFormat,
        /// Event names, or `ALL`.
        listen: Vec<String>,
    },
    /// `myevents <format> [uuid]` — session-scoped subscription
    MyEvents {
        /// Encoding of delivered events.
        format: EventFormat,
        /// Session UUID, optional on outbound connections.
        uuid: Option<String>,
    },
    /// `noevents` — clear all subscriptions
    DisableEvents,
    /// `divert_events on|off`
    DivertEvents {
        /// Divert embedded-script events onto the socket.
        enabled: bool,
    },
    /// `filter <header> <value>` / `filter delete <header> [value]`
    Filter {
        /// Remove the filter instead of adding it.
        delete: bool,
        /// Event header the filter matches on.
        header: String,
        /// Value to match; may be empty for `delete`.
        value: String,
    },
    /// `linger [seconds]` / `nolinger`
    Linger {
        /// Enable or cancel linger mode.
        enabled: bool,
        /// Grace period; `None` lingers indefinitely.
        seconds: Option<u32>,
    },
    /// `log <level>` / `nolog`
    Log {
        /// Enable or disable log forwarding.
        enabled: bool,
        /// Level name (`DEBUG`..`EMERG`) or numeric 0-7.
        level: String,
    },
    /// `sendmsg [uuid]` with headers and optional body
    SendMsg {
        /// Target channel UUID; omitted on outbound connections.
        uuid: Option<String>,
        /// Message headers (`call-command`, app fields, ...).
        headers: Headers,
        /// Optional length-delimited body.
        body: Option<String>,
        /// Set `event-lock: true` so the switch serializes this message.
        sync: bool,
        /// Set `event-lock-pri: true` (priority variant of `sync`).
        sync_pri: bool,
    },
    /// `sendevent <name>` with headers and optional body
    SendEvent {
        /// The event name placed on the verb line.
        name: String,
        /// Event headers.
        headers: Headers,
        /// Optional length-delimited body.
        body: Option<String>,
    },
    /// Outbound session establishment
    Connect,
    /// Graceful session teardown
    Exit,
}

impl Command {
    /// Password authentication.
    pub fn auth(password: impl Into<Password>) -> Self {
        Command::Auth {
            user: None,
            password: password.into(),
        }
    }

    /// User authentication; `user` must be `user@domain`.
    pub fn user_auth(user: impl Into<String>, password: impl Into<Password>) -> Self {
        Command::Auth {
            user: Some(user.into()),
            password: password.into(),
        }
    }

    /// Foreground API command.
    pub fn api(command: impl Into<String>, arguments: impl Into<String>) -> Self {
        Command::Api {
            command: command.into(),
            arguments: arguments.into(),
            background: false,
        }
    }

    /// Background API command, answered later by a `BACKGROUND_JOB` event.
    pub fn bgapi(command: impl Into<String>, arguments: impl Into<String>) -> Self {
        Command::Api {
            command: command.into(),
            arguments: arguments.into(),
            background: true,
        }
    }

    /// Execute a dialplan application on a channel, `sendmsg`-framed.
    ///
    /// Arguments longer than the 2048-byte header limit (or when
    /// `force_body` is set) move into the message body with
    /// `content-type: text/plain`.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        uuid: impl Into<String>,
        app: impl Into<String>,
        args: impl Into<String>,
        app_uuid: Option<String>,
        loops: u32,
        sync: bool,
        sync_pri: bool,
        force_body: bool,
    ) -> Self {
        let args = args.into();
        let mut headers = Headers::new();
        headers.set("call-command", "execute");
        headers.set("execute-app-name", app.into());
        headers.set("loops", loops.max(1).to_string());
        // Application-UUID on completion events correlates back to this.
        if let Some(app_uuid) = app_uuid {
            headers.set("Event-UUID", app_uuid);
        }

        let body = if args.len() > 2048 || force_body {
            headers.set("content-type", "text/plain");
            Some(args)
        } else {
            headers.set("execute-app-arg", args);
            None
        };

        Command::SendMsg {
            uuid: Some(uuid.into()),
            headers,
            body,
            sync,
            sync_pri,
        }
    }

    /// Hang up a channel with the given cause, `sendmsg`-framed.
    pub fn hangup(uuid: impl Into<String>, cause: impl Into<String>, sync: bool) -> Self {
        let mut headers = Headers::new();
        headers.set("call-command", "hangup");
        headers.set("hangup-cause", cause.into());
        Command::SendMsg {
            uuid: Some(uuid.into()),
            headers,
            body: None,
            sync,
            sync_pri: false,
        }
    }

    /// Transfer a channel to a dialplan application, `sendmsg`-framed.
    pub fn transfer(uuid: impl Into<String>, application: impl Into<String>, sync: bool) -> Self {
        let mut headers = Headers::new();
        headers.set("call-command", "xferext");
        headers.set("application", application.into());
        Command::SendMsg {
            uuid: Some(uuid.into()),
            headers,
            body: None,
            sync,
            sync_pri: false,
        }
    }

    /// Re-INVITE a channel's media to another channel, `sendmsg`-framed.
    pub fn nomedia(uuid: impl Into<String>, nomedia_uuid: impl Into<String>, sync: bool) -> Self {
        let mut headers = Headers::new();
        headers.set("call-command", "nomedia");
        headers.set("nomedia-uuid", nomedia_uuid.into());
        Command::SendMsg {
            uuid: Some(uuid.into()),
            headers,
            body: None,
            sync,
            sync_pri: false,
        }
    }

    /// Hook a channel's media up to an external socket (mod_spandsp style),
    /// `sendmsg`-framed. `flags` is typically `native`.
    pub fn unicast(
        uuid: impl Into<String>,
        local: SocketAddr,
        remote: SocketAddr,
        transport: impl Into<String>,
        flags: Option<String>,
        sync: bool,
    ) -> Self {
        let mut headers = Headers::new();
        headers.set("call-command", "unicast");
        headers.set("local-ip", local.ip().to_string());
        headers.set("local-port", local.port().to_string());
        headers.set("remote-ip", remote.ip().to_string());
        headers.set("remote-port", remote.port().to_string());
        headers.set("transport", transport.into());
        if let Some(flags) = flags {
            headers.set("flags", flags);
        }
        Command::SendMsg {
            uuid: Some(uuid.into()),
            headers,
            body: None,
            sync,
            sync_pri: false,
        }
    }

    /// Render to wire form (verb line, headers, body) without the
    /// end-of-message terminator.
    pub fn render(&self) -> EslResult<String> {
        match self {
            Command::Auth { user, password } => {
                validate_no_newlines(password.as_str(), "password")?;
                match user {
                    Some(user) => {
                        validate_no_newlines(user, "user")?;
                        Ok(format!("userauth {}:{}", user, password.as_str()))
                    }
                    None => Ok(format!("auth {}", password.as_str())),
                }
            }
            Command::Api {
                command,
                arguments,
                background,
            } => {
                validate_no_newlines(command, "api command")?;
                validate_no_newlines(arguments, "api arguments")?;
                let verb = if *background { "bgapi" } else { "api" };
                if arguments.is_empty() {
                    Ok(format!("{verb} {command}"))
                } else {
                    Ok(format!("{verb} {command} {arguments}"))
                }
            }
            Command::Event {
                ignore,
                format,
                listen,
            } => {
                for name in listen {
                    validate_no_newlines(name, "event name")?;
                }
                let prefix = if *ignore { "nix" } else { "" };
                Ok(format!("{prefix}event {format} {}", listen.join(" ")))
            }
            Command::MyEvents { format, uuid } => match uuid {
                Some(uuid) => {
                    validate_no_newlines(uuid, "myevents uuid")?;
                    Ok(format!("myevents {format} {uuid}"))
                }
                None => Ok(format!("myevents {format}")),
            },
            Command::DisableEvents => Ok("noevents".to_string()),
            Command::DivertEvents { enabled } => {
                let arg = if *enabled { "on" } else { "off" };
                Ok(format!("divert_events {arg}"))
            }
            Command::Filter {
                delete,
                header,
                value,
            } => {
                validate_no_newlines(header, "filter header")?;
                validate_no_newlines(value, "filter value")?;
                if *delete {
                    if value.is_empty() {
                        Ok(format!("filter delete {header}"))
                    } else {
                        Ok(format!("filter delete {header} {value}"))
                    }
                } else {
                    Ok(format!("filter {header} {value}"))
                }
            }
            Command::Linger { enabled, seconds } => {
                if !enabled {
                    return Ok("nolinger".to_string());
                }
                Ok(match seconds {
                    Some(n) => format!("linger {n}"),
                    None => "linger".to_string(),
                })
            }
            Command::Log { enabled, level } => {
                if !enabled {
                    return Ok("nolog".to_string());
                }
                validate_no_newlines(level, "log level")?;
                Ok(format!("log {level}"))
            }
            Command::SendMsg {
                uuid,
                headers,
                body,
                sync,
                sync_pri,
            } => {
                let verb = match uuid {
                    Some(uuid) => {
                        validate_no_newlines(uuid, "sendmsg uuid")?;
                        format!("sendmsg {uuid}")
                    }
                    None => "sendmsg".to_string(),
                };
                let mut headers = headers.clone();
                // The switch serializes event-locked messages per channel.
                if *sync {
                    headers.set("event-lock", "true");
                }
                if *sync_pri {
                    headers.set("event-lock-pri", "true");
                }
                Ok(render_with_headers(&verb, headers, body.as_deref()))
            }
            Command::SendEvent {
                name,
                headers,
                body,
            } => {
                validate_no_newlines(name, "event name")?;
                Ok(render_with_headers(
                    &format!("sendevent {name}"),
                    headers.clone(),
                    body.as_deref(),
                ))
            }
            Command::Connect => Ok("connect".to_string()),
            Command::Exit => Ok("exit".to_string()),
        }
    }
}

/// Render a header-framed message: verb line, sorted headers, and an
/// optional length-delimited body.
fn render_with_headers(verb: &str, mut headers: Headers, body: Option<&str>) -> String {
    match body {
        Some(body) if !body.is_empty() => {
            headers.set("Content-Length", body.len().to_string());
            format!("{verb}\r\n{}\r\n\r\n{body}", headers.to_wire())
        }
        _ => {
            headers.remove("Content-Length");
            format!("{verb}\r\n{}", headers.to_wire())
        }
    }
}

/// Build a channel-variable block for commands like `originate`.
///
/// `format` supplies the surrounding braces with a literal `{}`
/// placeholder, e.g. `"{{}}"` for `{...}` or `"<{}>"` for enterprise
/// originate. Values containing spaces are quoted. Returns an empty
/// string for an empty map.
pub fn build_vars(format: &str, vars: &HashMap<String, String>) -> String {
    if vars.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(&String, &String)> = vars.iter().collect();
    pairs.sort_by_key(|(k, _)| k.as_str());

    let joined = pairs
        .iter()
        .map(|(key, value)| {
            if value.contains(' ') {
                format!("{key}='{value}'")
            } else {
                format!("{key}={value}")
            }
        })
        .collect::<Vec<_>>()
        .join(",");

    format.replacen("{}", &joined, 1)
}
