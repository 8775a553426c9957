//! Inbound role: dial the switch and authenticate

use crate::command::{Command, Password};
use crate::connection::{Connection, Options};
use crate::constants::DEFAULT_AUTH_TIMEOUT;
use crate::error::{EslError, EslResult};
use crate::frame::Frame;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Tuning for [`dial_with_options`].
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// Engine options for the resulting connection.
    pub connection: Options,
    /// `user@domain` for user authentication; `None` for plain password
    /// authentication.
    pub user: Option<String>,
    /// Bound on waiting for the initial `auth/request` challenge and on
    /// the auth exchange itself.
    pub auth_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connection: Options::default(),
            user: None,
            auth_timeout: DEFAULT_AUTH_TIMEOUT,
        }
    }
}

/// Callback fired exactly once when the session ends, whether by a
/// disconnect notice, auth failure teardown, or a local close.
type DisconnectHandler = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

/// Connect to the switch at `address` and authenticate with `password`.
///
/// `on_disconnect` fires once when the session ends. Returns the
/// authenticated connection; on auth failure the socket is torn down with
/// an `exit` exchange first.
pub async fn dial(
    address: impl ToSocketAddrs,
    password: impl Into<Password>,
    on_disconnect: impl FnOnce() + Send + 'static,
) -> EslResult<Connection> {
    dial_with_options(address, password, DialOptions::default(), on_disconnect).await
}

/// [`dial`] with explicit options.
pub async fn dial_with_options(
    address: impl ToSocketAddrs,
    password: impl Into<Password>,
    options: DialOptions,
    on_disconnect: impl FnOnce() + Send + 'static,
) -> EslResult<Connection> {
    let stream = TcpStream::connect(address).await?;
    let (connection, mut handshake) = Connection::start(stream, false, options.connection)?;
    let on_disconnect: DisconnectHandler = Arc::new(Mutex::new(Some(Box::new(on_disconnect))));

    let challenge = tokio::time::timeout(options.auth_timeout, handshake.auth.recv()).await;
    match challenge {
        Ok(Some(_)) => {}
        Ok(None) => {
            connection.close().await;
            fire_disconnect(&on_disconnect);
            return Err(EslError::ConnectionClosed);
        }
        Err(_) => {
            connection.close().await;
            fire_disconnect(&on_disconnect);
            return Err(EslError::Timeout {
                timeout: options.auth_timeout,
            });
        }
    }
    debug!(remote = %connection.remote_addr(), "received auth challenge");

    let auth = Command::Auth {
        user: options.user.clone(),
        password: password.into(),
    };
    if let Err(e) = authenticate(&connection, auth.clone(), options.auth_timeout).await {
        connection.exit_and_close().await;
        fire_disconnect(&on_disconnect);
        return Err(e);
    }
    debug!(remote = %connection.remote_addr(), "authenticated");

    tokio::spawn(auth_loop(
        connection.clone(),
        handshake.auth,
        auth,
        options.auth_timeout,
    ));
    tokio::spawn(disconnect_loop(
        connection.clone(),
        handshake.disconnect,
        on_disconnect,
    ));

    Ok(connection)
}

async fn authenticate(
    connection: &Connection,
    auth: Command,
    timeout: Duration,
) -> EslResult<()> {
    let reply = connection.send_command_with_timeout(auth, timeout).await?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(EslError::Auth(reply.reply_text()))
    }
}

/// Re-authenticate whenever the switch issues a fresh challenge.
async fn auth_loop(
    connection: Connection,
    mut challenges: mpsc::Receiver<Frame>,
    auth: Command,
    timeout: Duration,
) {
    while challenges.recv().await.is_some() {
        debug!(remote = %connection.remote_addr(), "re-authenticating");
        match authenticate(&connection, auth.clone(), timeout).await {
            Ok(()) => debug!(remote = %connection.remote_addr(), "re-authenticated"),
            Err(e) => {
                error!(remote = %connection.remote_addr(), error = %e, "re-authentication failed");
                connection.exit_and_close().await;
                return;
            }
        }
    }
}

/// Wait for a disconnect notice or local close, then fire the handler and
/// finish tearing the connection down.
async fn disconnect_loop(
    connection: Connection,
    mut notices: mpsc::Receiver<Frame>,
    on_disconnect: DisconnectHandler,
) {
    tokio::select! {
        notice = notices.recv() => {
            if let Some(frame) = notice {
                debug!(
                    remote = %connection.remote_addr(),
                    reason = %frame.body().unwrap_or_default().trim_end(),
                    "disconnect notice received"
                );
            }
        }
        _ = connection.wait_closed() => {}
    }
    connection.close().await;
    fire_disconnect(&on_disconnect);
}

fn fire_disconnect(handler: &DisconnectHandler) {
    let callback = match handler.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => {
            warn!("disconnect handler mutex poisoned");
            poisoned.into_inner().take()
        }
    };
    if let Some(callback) = callback {
        callback();
    }
}
