//! Outbound role: accept connections the switch opens per call

use crate::command::Command;
use crate::connection::{Connection, HandshakeReceivers, Options};
use crate::constants::{
    DEFAULT_CONNECTION_DELAY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EXIT_TIMEOUT,
};
use crate::error::EslResult;
use crate::frame::Frame;
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

/// Tuning for [`serve`].
#[derive(Debug, Clone)]
pub struct OutboundOptions {
    /// Engine options for each accepted connection.
    pub connection: Options,
    /// Bound on the initial `connect` exchange.
    pub connect_timeout: Duration,
    /// Bound on the `exit` exchange during teardown.
    pub exit_timeout: Duration,
    /// Pause between the handler returning and the `exit` command. Some
    /// peers treat an immediate close as an error while still finishing
    /// their own session setup.
    pub connection_delay: Duration,
}

impl Default for OutboundOptions {
    fn default() -> Self {
        Self {
            connection: Options::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            exit_timeout: DEFAULT_EXIT_TIMEOUT,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }
}

/// Bind `address` and serve switch-initiated connections with `handler`.
///
/// Runs until the listener fails. Each accepted connection gets its own
/// task: the `connect` exchange runs first, then the handler receives the
/// connection together with the connect reply (which carries the calling
/// channel's data), and teardown follows when the handler returns.
pub async fn listen_and_serve<H, Fut>(address: impl ToSocketAddrs, handler: H) -> EslResult<()>
where
    H: Fn(Connection, Frame) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(address).await?;
    serve(listener, OutboundOptions::default(), handler).await
}

/// [`listen_and_serve`] on an already bound listener, with options.
pub async fn serve<H, Fut>(
    listener: TcpListener,
    options: OutboundOptions,
    handler: H,
) -> EslResult<()>
where
    H: Fn(Connection, Frame) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    info!(local = %listener.local_addr()?, "listening for outbound connections");
    loop {
        let (stream, remote) = listener.accept().await?;
        debug!(remote = %remote, "accepted outbound connection");

        let handler = handler.clone();
        let options = options.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_session(stream, options, handler).await {
                warn!(remote = %remote, error = %e, "outbound session failed");
            }
        });
    }
}

async fn handle_session<H, Fut>(
    stream: tokio::net::TcpStream,
    options: OutboundOptions,
    handler: H,
) -> EslResult<()>
where
    H: Fn(Connection, Frame) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (connection, handshake) = Connection::start(stream, true, options.connection)?;
    tokio::spawn(watch_session(connection.clone(), handshake));

    let reply = match connection
        .send_command_with_timeout(Command::Connect, options.connect_timeout)
        .await {
        Ok(reply) => reply,
        Err(e) => {
            // Never authenticated a session; no point in an exit exchange.
            connection.close().await;
            return Err(e);
        }
    };
    debug!(
        remote = %connection.remote_addr(),
        channel = %reply.channel_uuid().unwrap_or_default(),
        "session established"
    );

    handler(connection.clone(), reply).await;

    tokio::time::sleep(options.connection_delay).await;
    connection.exit_and_close_with_timeout(options.exit_timeout).await;
    Ok(())
}

/// Watch the session's handshake channels until it ends.
///
/// A disconnect notice closes the connection; auth challenges are not part
/// of the outbound handshake and are dropped with a warning.
async fn watch_session(connection: Connection, mut handshake: HandshakeReceivers) {
    loop {
        tokio::select! {
            biased;
            _ = connection.wait_closed() => break,
            notice = handshake.disconnect.recv() => match notice {
                Some(frame) => {
                    debug!(
                        remote = %connection.remote_addr(),
                        reason = %frame.body().unwrap_or_default().trim_end(),
                        "disconnect notice received"
                    );
                    connection.close().await;
                    break;
                }
                None => break,
            },
            challenge = handshake.auth.recv() => match challenge {
                Some(_) => {
                    warn!(remote = %connection.remote_addr(), "unexpected auth challenge on outbound connection");
                }
                None => break,
            },
        }
    }
}
