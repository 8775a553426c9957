//! Connection engine: frame dispatch, command correlation, event fan-out

use crate::command::{build_vars, Command, EventFormat};
use crate::constants::{
    DEFAULT_COMMAND_TIMEOUT, DEFAULT_EXIT_TIMEOUT, DEFAULT_HANDOFF_TIMEOUT, END_OF_MESSAGE,
    HEADER_CONTENT_TYPE, LISTEN_ALL,
};
use crate::error::{EslError, EslResult};
use crate::event::{decode_json, decode_plain, decode_xml, Event};
use crate::frame::{Frame, FrameKind};
use crate::framer::Framer;
use crate::listener::{EventListener, ListenerId, ListenerRegistry};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Per-connection tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct Options {
    /// Bound on each command's write-and-wait cycle.
    pub command_timeout: Duration,
    /// Bound on handing a received frame to its consumer channel before
    /// the frame is dropped.
    pub handoff_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            handoff_timeout: DEFAULT_HANDOFF_TIMEOUT,
        }
    }
}

/// Receivers for the handshake frame kinds, handed to the role-specific
/// session loops at connection start.
pub(crate) struct HandshakeReceivers {
    pub(crate) auth: mpsc::Receiver<Frame>,
    pub(crate) disconnect: mpsc::Receiver<Frame>,
}

/// Receivers consumed under the command lock, one per correlated reply kind.
struct CommandReceivers {
    reply: mpsc::Receiver<Frame>,
    api: mpsc::Receiver<Frame>,
}

struct ConnectionInner {
    writer: Mutex<OwnedWriteHalf>,
    /// Held across write and reply-wait; at most one command may be
    /// outstanding because replies carry no correlation id.
    command: Mutex<CommandReceivers>,
    /// Frame-kind routing table. Dispatch reads it shared; close clears it
    /// exclusively, which also closes every receiver.
    channels: RwLock<HashMap<FrameKind, mpsc::Sender<Frame>>>,
    registry: ListenerRegistry,
    running: CancellationToken,
    closed: AtomicBool,
    exited: AtomicBool,
    options: Options,
    remote: SocketAddr,
    outbound: bool,
}

/// A live session with the switch.
///
/// Cloning is cheap and clones share the same underlying socket. The
/// connection owns two background tasks: a dispatch loop that reads frames
/// and routes them by kind, and an event loop that decodes event frames and
/// fans them out to registered listeners.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.inner.remote)
            .field("outbound", &self.inner.outbound)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One leg of an originate, a dial string with optional per-leg channel
/// variables rendered in `[...]`.
#[derive(Debug, Clone, Default)]
pub struct Leg {
    /// Endpoint dial string, e.g. `user/1000`.
    pub dial_string: String,
    /// Channel variables scoped to this leg only.
    pub vars: HashMap<String, String>,
}

impl Leg {
    /// A leg with no per-leg variables.
    pub fn new(dial_string: impl Into<String>) -> Self {
        Self {
            dial_string: dial_string.into(),
            vars: HashMap::new(),
        }
    }
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", build_vars("[{}]", &self.vars), self.dial_string)
    }
}

impl Connection {
    /// Take ownership of a connected socket and start the background loops.
    pub(crate) fn start(
        stream: TcpStream,
        outbound: bool,
        options: Options,
    ) -> EslResult<(Connection, HandshakeReceivers)> {
        let remote = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        // Capacity 1 everywhere: the handoff timeout is the only buffer
        // the dispatch loop gets.
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (api_tx, api_rx) = mpsc::channel(1);
        let (plain_tx, plain_rx) = mpsc::channel(1);
        let (json_tx, json_rx) = mpsc::channel(1);
        let (xml_tx, xml_rx) = mpsc::channel(1);
        let (auth_tx, auth_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);

        let mut channels = HashMap::new();
        channels.insert(FrameKind::Reply, reply_tx);
        channels.insert(FrameKind::ApiResponse, api_tx);
        channels.insert(FrameKind::EventPlain, plain_tx);
        channels.insert(FrameKind::EventJson, json_tx);
        channels.insert(FrameKind::EventXml, xml_tx);
        channels.insert(FrameKind::AuthRequest, auth_tx);
        channels.insert(FrameKind::Disconnect, disconnect_tx);

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                writer: Mutex::new(write_half),
                command: Mutex::new(CommandReceivers {
                    reply: reply_rx,
                    api: api_rx,
                }),
                channels: RwLock::new(channels),
                registry: ListenerRegistry::new(),
                running: CancellationToken::new(),
                closed: AtomicBool::new(false),
                exited: AtomicBool::new(false),
                options,
                remote,
                outbound,
            }),
        };

        let framer = Framer::new(BufReader::new(read_half));
        tokio::spawn(connection.clone().dispatch_loop(framer));
        tokio::spawn(connection.clone().event_loop(plain_rx, json_rx, xml_rx));

        Ok((
            connection,
            HandshakeReceivers {
                auth: auth_rx,
                disconnect: disconnect_rx,
            },
        ))
    }

    /// Address of the peer, for logging.
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Whether the connection has been closed (or is closing).
    pub fn is_closed(&self) -> bool {
        self.inner.running.is_cancelled()
    }

    /// Resolve once the connection starts closing.
    pub(crate) async fn wait_closed(&self) {
        self.inner.running.cancelled().await
    }

    /// Send a command and wait for its correlated reply with the
    /// connection's configured timeout.
    ///
    /// The wire protocol carries no correlation ids, so the connection
    /// allows one outstanding command at a time and the first
    /// `command/reply` or `api/response` frame to arrive is the answer.
    /// The returned frame may carry `-ERR`; use [`Frame::is_err`] or the
    /// typed helpers.
    pub async fn send_command(&self, command: Command) -> EslResult<Frame> {
        self.send_command_with_timeout(command, self.inner.options.command_timeout)
            .await
    }

    /// [`Connection::send_command`] with an explicit timeout.
    pub async fn send_command_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> EslResult<Frame> {
        if self.inner.running.is_cancelled() {
            return Err(EslError::ConnectionClosed);
        }

        let wire = command.render()?;

        // The lock spans both the write and the wait so concurrent callers
        // cannot interleave commands and steal each other's replies.
        let mut receivers = self.inner.command.lock().await;
        let receivers = &mut *receivers;

        // A reply that arrived after its caller timed out is still sitting
        // in the channel; it must not answer this command.
        while let Ok(stale) = receivers.reply.try_recv() {
            warn!(remote = %self.inner.remote, reply = %stale.reply_text(), "discarding stale reply");
        }
        while let Ok(stale) = receivers.api.try_recv() {
            warn!(remote = %self.inner.remote, reply = %stale.reply_text(), "discarding stale api response");
        }

        match &command {
            Command::Auth { .. } => {
                debug!(remote = %self.inner.remote, "sending command: auth [REDACTED]")
            }
            _ => {
                let first_line = wire.lines().next().unwrap_or_default();
                debug!(remote = %self.inner.remote, command = %first_line, "sending command");
            }
        }

        {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(wire.as_bytes()).await?;
            writer.write_all(END_OF_MESSAGE.as_bytes()).await?;
            writer.flush().await?;
        }

        // Race both correlated kinds: replies come back as command/reply,
        // foreground api commands as api/response. The receivers are polled
        // before cancellation so a reply that was already delivered wins
        // even when the peer closes right behind it.
        tokio::select! {
            biased;
            frame = receivers.reply.recv() => frame.ok_or(EslError::ConnectionClosed),
            frame = receivers.api.recv() => frame.ok_or(EslError::ConnectionClosed),
            _ = self.inner.running.cancelled() => Err(EslError::ConnectionClosed),
            _ = tokio::time::sleep(timeout) => Err(EslError::Timeout { timeout }),
        }
    }

    /// Register an event listener under a correlation key: [`LISTEN_ALL`]
    /// or a UUID matched against `Unique-ID`, `Application-UUID`, and
    /// `Job-UUID`.
    pub async fn register_event_listener(
        &self,
        key: impl Into<String>,
        listener: impl Fn(Event) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener: EventListener = Arc::new(listener);
        self.inner.registry.register(key, listener).await
    }

    /// Remove a previously registered listener.
    pub async fn remove_event_listener(&self, key: &str, id: ListenerId) {
        self.inner.registry.remove(key, id).await
    }

    /// Subscribe to events: `event <format> ALL` on inbound connections,
    /// `myevents <format>` on outbound ones.
    pub async fn enable_events(&self, format: EventFormat) -> EslResult<Frame> {
        let command = if self.inner.outbound {
            Command::MyEvents { format, uuid: None }
        } else {
            Command::Event {
                ignore: false,
                format,
                listen: vec![LISTEN_ALL.to_string()],
            }
        };
        self.checked(command).await
    }

    /// Run a foreground API command, failing on an `-ERR` response.
    pub async fn api(
        &self,
        command: impl Into<String>,
        arguments: impl Into<String>,
    ) -> EslResult<Frame> {
        self.checked(Command::api(command, arguments)).await
    }

    /// Run a background API command, returning the `Job-UUID` that the
    /// eventual `BACKGROUND_JOB` event will carry.
    pub async fn bgapi(
        &self,
        command: impl Into<String>,
        arguments: impl Into<String>,
    ) -> EslResult<String> {
        let frame = self.checked(Command::bgapi(command, arguments)).await?;
        frame.job_uuid().ok_or_else(|| EslError::framing("bgapi reply missing Job-UUID"))
    }

    /// Originate a call between two endpoints via `bgapi originate`.
    ///
    /// Ensures an `origination_uuid` channel variable so the new call can
    /// be correlated, enables plain events, and returns the UUID together
    /// with the `bgapi` reply (whose `Job-UUID` keys the job completion
    /// event).
    pub async fn originate_call(
        &self,
        aleg: &str,
        bleg: &str,
        vars: &HashMap<String, String>,
    ) -> EslResult<(String, Frame)> {
        self.enable_events(EventFormat::Plain).await?;

        let mut vars = vars.clone();
        let uuid = match vars.get("origination_uuid") {
            Some(existing) => existing.clone(),
            None => {
                let uuid = Uuid::new_v4().to_string();
                vars.insert("origination_uuid".to_string(), uuid.clone());
                uuid
            }
        };

        let arguments = format!("{}{} {}", build_vars("{{}}", &vars), aleg, bleg);
        let response = self.checked(Command::bgapi("originate", arguments)).await?;
        Ok((uuid, response))
    }

    /// Originate with the enterprise syntax: several a-legs dialed at once,
    /// joined by `:_:`, global variables in `<...>` and per-leg variables
    /// in each leg's `[...]` block.
    pub async fn enterprise_originate_call(
        &self,
        vars: &HashMap<String, String>,
        alegs: &[Leg],
        bleg: &str,
    ) -> EslResult<Frame> {
        if alegs.is_empty() {
            return Err(EslError::framing("enterprise originate needs an a-leg"));
        }
        self.enable_events(EventFormat::Plain).await?;

        // origination_uuid cannot apply globally across several legs.
        let mut vars = vars.clone();
        vars.remove("origination_uuid");

        let aleg = alegs.iter().map(Leg::to_string).collect::<Vec<_>>().join(":_:");
        let arguments = format!("{}{} {}", build_vars("<{}>", &vars), aleg, bleg);
        self.checked(Command::bgapi("originate", arguments)).await
    }

    /// Execute a dialplan application on a channel.
    pub async fn execute_app(
        &self,
        uuid: impl Into<String>,
        app: impl Into<String>,
        args: impl Into<String>,
        sync: bool,
    ) -> EslResult<Frame> {
        self.checked(Command::execute(uuid, app, args, None, 1, sync, false, false)).await
    }

    /// Play an audio file on a channel via the `playback` application.
    pub async fn playback(
        &self,
        uuid: impl Into<String>,
        file: impl Into<String>,
        times: u32,
        wait: bool,
    ) -> EslResult<Frame> {
        self.audio_command(uuid, "playback", file.into(), times, wait).await
    }

    /// Run the `say` application on a channel.
    pub async fn say(
        &self,
        uuid: impl Into<String>,
        args: impl Into<String>,
        times: u32,
        wait: bool,
    ) -> EslResult<Frame> {
        self.audio_command(uuid, "say", args.into(), times, wait).await
    }

    /// Speak text on a channel via the `speak` TTS application.
    pub async fn speak(
        &self,
        uuid: impl Into<String>,
        args: impl Into<String>,
        times: u32,
        wait: bool,
    ) -> EslResult<Frame> {
        self.audio_command(uuid, "speak", args.into(), times, wait).await
    }

    /// Play a phrase macro on a channel, with an optional macro argument.
    pub async fn phrase(
        &self,
        uuid: impl Into<String>,
        macro_name: &str,
        argument: Option<&str>,
        times: u32,
        wait: bool,
    ) -> EslResult<Frame> {
        let args = match argument {
            Some(argument) => format!("{macro_name},{argument}"),
            None => macro_name.to_string(),
        };
        self.audio_command(uuid, "phrase", args, times, wait).await
    }

    /// The mod_dptools audio applications share one invocation shape.
    async fn audio_command(
        &self,
        uuid: impl Into<String>,
        app: &str,
        args: String,
        times: u32,
        wait: bool,
    ) -> EslResult<Frame> {
        self.checked(Command::execute(uuid, app, args, None, times, wait, false, false)).await
    }

    /// Answer a channel.
    pub async fn answer_call(&self, uuid: impl Into<String>) -> EslResult<Frame> {
        self.execute_app(uuid, "answer", "", true).await
    }

    /// Hang a channel up with the given cause.
    pub async fn hangup_call(
        &self,
        uuid: impl Into<String>,
        cause: impl Into<String>,
    ) -> EslResult<Frame> {
        self.checked(Command::hangup(uuid, cause, false)).await
    }

    /// Transfer a channel to a dialplan extension or application.
    pub async fn transfer_call(
        &self,
        uuid: impl Into<String>,
        application: impl Into<String>,
    ) -> EslResult<Frame> {
        self.checked(Command::transfer(uuid, application, false)).await
    }

    /// Wait for the next DTMF digit on a channel.
    ///
    /// Requires an active event subscription that includes `DTMF` events
    /// for the channel.
    pub async fn wait_for_dtmf(&self, channel_uuid: &str, timeout: Duration) -> EslResult<char> {
        let (tx, mut rx) = mpsc::channel(1);
        let id = self
            .register_event_listener(channel_uuid, move |event: Event| {
                if event.name().as_deref() != Some("DTMF") {
                    return;
                }
                if let Some(digit) = event.header("DTMF-Digit").and_then(|d| d.chars().next()) {
                    let _ = tx.try_send(digit);
                }
            })
            .await;

        let result = tokio::select! {
            biased;
            digit = rx.recv() => digit.ok_or(EslError::ConnectionClosed),
            _ = self.inner.running.cancelled() => Err(EslError::ConnectionClosed),
            _ = tokio::time::sleep(timeout) => Err(EslError::Timeout { timeout }),
        };

        self.remove_event_listener(channel_uuid, id).await;
        result
    }

    /// Send `exit` (best effort, once) and close the connection.
    pub async fn exit_and_close(&self) {
        self.exit_and_close_with_timeout(DEFAULT_EXIT_TIMEOUT).await
    }

    pub(crate) async fn exit_and_close_with_timeout(&self, timeout: Duration) {
        if !self.inner.exited.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.send_command_with_timeout(Command::Exit, timeout).await {
                debug!(remote = %self.inner.remote, error = %e, "exit during teardown failed");
            }
        }
        self.close().await;
    }

    /// Close the connection without the `exit` exchange.
    ///
    /// Idempotent and safe to call concurrently. Cancels the background
    /// loops, closes every delivery channel, shuts the socket down, and
    /// waits for in-flight listener callbacks.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(remote = %self.inner.remote, "closing connection");

        self.inner.running.cancel();
        self.inner.channels.write().await.clear();
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                trace!(remote = %self.inner.remote, error = %e, "socket shutdown failed");
            }
        }
        self.inner.registry.close().await;
    }

    /// Fail on an `-ERR` reply. Anything else passes through: replies say
    /// `+OK`, but `api/response` bodies carry bare data.
    async fn checked(&self, command: Command) -> EslResult<Frame> {
        let frame = self.send_command(command).await?;
        if frame.is_err() {
            Err(EslError::CommandFailed {
                reply_text: frame.reply_text(),
            })
        } else {
            Ok(frame)
        }
    }

    /// Read frames off the socket and route them until cancellation, EOF,
    /// or a fatal error, then close the connection.
    async fn dispatch_loop(self, mut framer: Framer<BufReader<OwnedReadHalf>>) {
        loop {
            let result = tokio::select! {
                biased;
                _ = self.inner.running.cancelled() => break,
                result = framer.read_frame() => result,
            };

            match result {
                Ok(frame) => match self.route(frame).await {
                    Ok(()) => {}
                    Err(EslError::ConnectionClosed) => break,
                    Err(e) => {
                        warn!(remote = %self.inner.remote, error = %e, "stopping frame dispatch");
                        break;
                    }
                },
                Err(EslError::ConnectionClosed) => {
                    debug!(remote = %self.inner.remote, "peer closed the connection");
                    break;
                }
                Err(e) => {
                    error!(remote = %self.inner.remote, error = %e, "frame read failed");
                    break;
                }
            }
        }
        self.close().await;
    }

    /// Hand one frame to the channel for its kind.
    ///
    /// An unrecognized content type while the table still holds channels
    /// means the byte stream has desynced and is fatal; with an emptied
    /// table it is just the shutdown signal. If the consumer is not ready
    /// within the handoff timeout the frame is dropped rather than
    /// stalling dispatch for good.
    async fn route(&self, frame: Frame) -> EslResult<()> {
        let (kind, sender) = {
            let channels = self.inner.channels.read().await;
            if channels.is_empty() {
                return Err(EslError::ConnectionClosed);
            }
            let Some(kind) = frame.kind() else {
                return Err(EslError::NoRoute(
                    frame.header(HEADER_CONTENT_TYPE).unwrap_or_default(),
                ));
            };
            trace!(remote = %self.inner.remote, kind = %kind, "received frame");
            match channels.get(&kind) {
                Some(sender) => (kind, sender.clone()),
                None => return Err(EslError::NoRoute(kind.to_string())),
            }
        };

        let handoff = self.inner.options.handoff_timeout;
        match sender.send_timeout(frame, handoff).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    remote = %self.inner.remote,
                    kind = %kind,
                    "consumer not ready within handoff timeout, dropping frame"
                );
                Ok(())
            }
            Err(SendTimeoutError::Closed(_)) => Err(EslError::ConnectionClosed),
        }
    }

    /// Decode event frames from all three encodings and fan them out.
    async fn event_loop(
        self,
        mut plain: mpsc::Receiver<Frame>,
        mut json: mpsc::Receiver<Frame>,
        mut xml: mpsc::Receiver<Frame>,
    ) {
        loop {
            let (format, frame) = tokio::select! {
                biased;
                _ = self.inner.running.cancelled() => break,
                Some(frame) = plain.recv() => (EventFormat::Plain, frame),
                Some(frame) = json.recv() => (EventFormat::Json, frame),
                Some(frame) = xml.recv() => (EventFormat::Xml, frame),
            };
            self.handle_event(format, frame).await;
        }
    }

    async fn handle_event(&self, format: EventFormat, frame: Frame) {
        let Some(body) = frame.body() else {
            warn!(remote = %self.inner.remote, format = %format, "event frame without body");
            return;
        };
        let decoded = match format {
            EventFormat::Plain => decode_plain(body),
            EventFormat::Json => decode_json(body),
            EventFormat::Xml => decode_xml(body),
        };
        match decoded {
            Ok(event) => {
                self.inner.registry.dispatch(&event).await
            }
            Err(e) => {
                warn!(remote = %self.inner.remote, format = %format, error = %e, "failed to decode event")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    /// Read one outgoing message (terminated by a double CRLF) off the
    /// scripted peer's socket.
    async fn read_message(stream: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        while !data.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            data.push(byte[0]);
        }
        String::from_utf8(data).unwrap()
    }

    #[tokio::test]
    async fn send_command_receives_reply() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let sent = read_message(&mut peer).await;
            assert!(sent.starts_with("event plain ALL"));
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK event listener enabled\r\n\r\n")
                .await
                .unwrap();
            peer
        });

        let frame = conn
            .send_command(Command::Event {
                ignore: false,
                format: EventFormat::Plain,
                listen: vec![LISTEN_ALL.to_string()],
            })
            .await
            .unwrap();
        assert!(frame.is_ok());
        assert_eq!(frame.reply_text(), "+OK event listener enabled");

        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn foreground_api_waits_for_api_response() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let sent = read_message(&mut peer).await;
            assert_eq!(sent, "api status\r\n\r\n");
            peer.write_all(
                b"Content-Type: api/response\r\nContent-Length: 11\r\n\r\nUP 0 years,",
            )
            .await
            .unwrap();
            peer
        });

        let frame = conn.api("status", "").await.unwrap();
        assert_eq!(frame.body(), Some("UP 0 years,"));

        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn api_error_response_is_command_failed() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        tokio::spawn(async move {
            let _ = read_message(&mut peer).await;
            peer.write_all(
                b"Content-Type: api/response\r\nContent-Length: 20\r\n\r\n-ERR no such channel",
            )
            .await
            .unwrap();
            peer
        });

        let err = conn.api("uuid_answer", "nope").await.unwrap_err();
        match err {
            EslError::CommandFailed { reply_text } => {
                assert_eq!(reply_text, "-ERR no such channel")
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn event_between_command_and_reply_is_fanned_out() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let (event_tx, mut event_rx) = mpsc::channel(1);
        conn.register_event_listener(LISTEN_ALL, move |event: Event| {
            let _ = event_tx.try_send(event);
        })
        .await;

        tokio::spawn(async move {
            let _ = read_message(&mut peer).await;
            // Unrelated event arrives before the reply.
            peer.write_all(
                b"Content-Type: text/event-plain\r\nContent-Length: 23\r\n\r\nEvent-Name: HEARTBEAT\n\n",
            )
            .await
            .unwrap();
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\r\n")
                .await
                .unwrap();
            peer
        });

        let frame = conn.send_command(Command::DisableEvents).await.unwrap();
        assert!(frame.is_ok());

        let event = event_rx.recv().await.unwrap();
        assert_eq!(event.name(), Some("HEARTBEAT".to_string()));
        conn.close().await;
    }

    #[tokio::test]
    async fn auth_challenge_routed_to_handshake_receiver() {
        let (client, mut peer) = socket_pair().await;
        let (conn, mut handshake) = Connection::start(client, false, Options::default()).unwrap();

        peer.write_all(b"Content-Type: auth/request\r\n\r\n").await.unwrap();

        let frame = handshake.auth.recv().await.unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::AuthRequest));
        conn.close().await;
    }

    #[tokio::test]
    async fn disconnect_notice_routed_to_handshake_receiver() {
        let (client, mut peer) = socket_pair().await;
        let (conn, mut handshake) = Connection::start(client, false, Options::default()).unwrap();

        peer.write_all(b"Content-Type: text/disconnect-notice\r\nContent-Length: 17\r\n\r\nDisconnected, bye")
            .await
            .unwrap();

        let frame = handshake.disconnect.recv().await.unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::Disconnect));
        assert_eq!(frame.body(), Some("Disconnected, bye"));
        conn.close().await;
    }

    #[tokio::test]
    async fn unknown_content_type_is_fatal() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        peer.write_all(b"Content-Type: application/x-unknown\r\n\r\n").await.unwrap();

        // Dispatch treats the desync as fatal and closes the connection.
        tokio::time::timeout(Duration::from_secs(1), conn.wait_closed()).await.unwrap();
        let err = conn.send_command(Command::DisableEvents).await.unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed), "got {err:?}");
    }

    #[tokio::test]
    async fn send_command_after_close_fails() {
        let (client, _peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        conn.close().await;
        let err = conn.send_command(Command::DisableEvents).await.unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed), "got {err:?}");
    }

    #[tokio::test]
    async fn concurrent_close_is_safe() {
        let (client, _peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let a = conn.clone();
        let b = conn.clone();
        tokio::join!(a.close(), b.close());
        conn.close().await;
    }

    #[tokio::test]
    async fn peer_eof_closes_connection() {
        let (client, peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        drop(peer);
        // Dispatch loop notices EOF and closes; commands then fail fast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = conn.send_command(Command::DisableEvents).await.unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed), "got {err:?}");
    }

    #[tokio::test]
    async fn command_timeout_when_peer_silent() {
        let (client, _peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let err = conn
            .send_command_with_timeout(Command::DisableEvents, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Timeout { .. }), "got {err:?}");
        conn.close().await;
    }

    #[tokio::test]
    async fn commands_are_serialized_on_the_wire() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let mut verbs = Vec::new();
            for _ in 0..2 {
                let sent = read_message(&mut peer).await;
                verbs.push(
                    sent.trim_end().to_string(),
                );
                peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\r\n")
                    .await
                    .unwrap();
            }
            (peer, verbs)
        });

        let first = conn.clone();
        let second = conn.clone();
        let (a, b) = tokio::join!(
            first.send_command(Command::DisableEvents),
            second.send_command(Command::Linger {
                enabled: false,
                seconds: None
            }),
        );
        a.unwrap();
        b.unwrap();

        let (_peer, verbs) = peer_task.await.unwrap();
        // Two complete messages, never interleaved.
        assert_eq!(verbs.len(), 2);
        for verb in verbs {
            assert!(verb == "noevents" || verb == "nolinger", "got {verb:?}");
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn late_reply_does_not_answer_next_command() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let first = read_message(&mut peer).await;
            assert_eq!(first, "noevents\r\n\r\n");
            // Reply lands only after the caller has given up waiting.
            tokio::time::sleep(Duration::from_millis(150)).await;
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK events disabled\r\n\r\n")
                .await
                .unwrap();
            let second = read_message(&mut peer).await;
            assert_eq!(second, "nolinger\r\n\r\n");
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK will not linger\r\n\r\n")
                .await
                .unwrap();
            peer
        });

        let err = conn
            .send_command_with_timeout(Command::DisableEvents, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Timeout { .. }), "got {err:?}");

        // Let the late reply reach the delivery channel first.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let frame = conn
            .send_command(Command::Linger {
                enabled: false,
                seconds: None,
            })
            .await
            .unwrap();
        assert_eq!(frame.reply_text(), "+OK will not linger");

        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn reply_racing_peer_close_is_still_delivered() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let _ = read_message(&mut peer).await;
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\r\n")
                .await
                .unwrap();
            // EOF follows right behind the reply.
            drop(peer);
        });

        let frame = conn.send_command(Command::DisableEvents).await.unwrap();
        assert!(frame.is_ok());

        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn playback_runs_checked_execute() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let sent = read_message(&mut peer).await;
            assert!(sent.starts_with("sendmsg u-1\r\n"));
            assert!(sent.contains("call-command: execute"));
            assert!(sent.contains("execute-app-name: playback"));
            assert!(sent.contains("execute-app-arg: tone.wav"));
            assert!(sent.contains("loops: 2"));
            assert!(sent.contains("event-lock: true"));
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\r\n")
                .await
                .unwrap();
            peer
        });

        conn.playback("u-1", "tone.wav", 2, true).await.unwrap();
        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn enterprise_originate_joins_legs() {
        let (client, mut peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let peer_task = tokio::spawn(async move {
            let subscribe = read_message(&mut peer).await;
            assert_eq!(subscribe, "event plain ALL\r\n\r\n");
            peer.write_all(b"Content-Type: command/reply\r\nReply-Text: +OK\r\n\r\n")
                .await
                .unwrap();
            let originate = read_message(&mut peer).await;
            assert_eq!(
                originate,
                "bgapi originate <ignore_early_media=true>[leg_delay_start=2]user/1001:_:user/1002 &park()\r\n\r\n"
            );
            peer.write_all(
                b"Content-Type: command/reply\r\nReply-Text: +OK Job-UUID: j-1\r\nJob-UUID: j-1\r\n\r\n",
            )
            .await
            .unwrap();
            peer
        });

        let mut vars = HashMap::new();
        vars.insert("ignore_early_media".to_string(), "true".to_string());
        // Cannot apply across several legs; must be stripped.
        vars.insert("origination_uuid".to_string(), "u-x".to_string());
        let mut first = Leg::new("user/1001");
        first.vars.insert("leg_delay_start".to_string(), "2".to_string());
        let legs = vec![first, Leg::new("user/1002")];

        let frame = conn.enterprise_originate_call(&vars, &legs, "&park()").await.unwrap();
        assert_eq!(frame.job_uuid(), Some("j-1".to_string()));

        peer_task.await.unwrap();
        conn.close().await;
    }

    #[tokio::test]
    async fn enterprise_originate_requires_a_leg() {
        let (client, _peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let err = conn
            .enterprise_originate_call(&HashMap::new(), &[], "&park()")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
        conn.close().await;
    }

    #[tokio::test]
    async fn debug_output_names_the_peer() {
        let (client, _peer) = socket_pair().await;
        let (conn, _handshake) = Connection::start(client, false, Options::default()).unwrap();

        let rendered = format!("{conn:?}");
        assert!(rendered.contains("Connection"));
        assert!(rendered.contains(
            &conn.remote_addr().to_string()
        ));
        conn.close().await;
    }
}
