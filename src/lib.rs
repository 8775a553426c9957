//! Client and server library for the FreeSWITCH event socket protocol.
//!
//! Two roles share one connection engine:
//!
//! * **Inbound**: [`dial`] the switch's event socket, authenticate, then
//!   issue commands and consume events.
//! * **Outbound**: [`listen_and_serve`] accepts the connection the switch
//!   opens per call and hands each session to your handler.
//!
//! The engine reads MIME-style frames off the socket, routes them by
//! `Content-Type`, correlates command replies by ordering (the protocol
//! has no correlation ids, so commands are serialized per connection),
//! and fans decoded events out to registered listeners.
//!
//! ```no_run
//! use eslkit::constants::LISTEN_ALL;
//! use eslkit::{dial, EventFormat};
//!
//! #[tokio::main]
//! async fn main() -> eslkit::EslResult<()> {
//!     let conn = dial("127.0.0.1:8021", "ClueCon", || println!("disconnected")).await?;
//!     conn.enable_events(EventFormat::Plain)
//!         .await?;
//!     conn.register_event_listener(LISTEN_ALL, |event| {
//!         println!("event: {:?}", event.name());
//!     })
//!     .await;
//!     let status = conn
//!         .api("status", "")
//!         .await?;
//!     println!("{}", status.reply_text());
//!     conn.exit_and_close()
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod connection;
pub mod constants;
pub mod error;
pub mod event;
pub mod frame;
pub mod framer;
pub mod inbound;
pub mod listener;
pub mod outbound;

pub use command::{build_vars, Command, EventFormat, Password};
pub use connection::{Connection, Leg, Options};
pub use error::{EslError, EslResult};
pub use event::Event;
pub use frame::{Frame, FrameKind, Headers};
pub use inbound::{dial, dial_with_options, DialOptions};
pub use listener::{EventListener, ListenerId};
pub use outbound::{listen_and_serve, serve, OutboundOptions};
