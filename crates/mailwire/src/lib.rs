//! # mailwire
//!
//! An async IMAP4rev1 client transport engine: the stateful machinery between
//! a TLS-capable TCP socket and a higher-level IMAP command layer.
//!
//! ## What it does
//!
//! - **Framing**: assembles complete protocol responses from arbitrary TCP
//!   chunks, honoring `{n}` literal syntax, so a response is never split
//!   inside a literal body
//! - **Dispatch**: parses each response and routes it to the in-flight
//!   command's payload, a registered untagged handler, or the command's
//!   completion, normalizing `* 17 EXISTS` style responses and bracketed
//!   response codes on the way
//! - **Send pipeline**: one command on the wire at a time, tagged `W1`,
//!   `W2`, ..., with `+` continuation handshakes releasing literal chunks
//!   one by one
//! - **COMPRESS=DEFLATE**: a transparent compression layer slotted between
//!   the socket and the framer after negotiation
//! - **Timers**: an idle notification when the queue drains and a per-write
//!   socket timeout that scales with the write size
//!
//! The response parser and command compiler are collaborator seams
//! ([`ResponseParser`], [`CommandCompiler`]) with built-in text
//! implementations; the IMAP command set itself (LOGIN, SELECT, FETCH, ...)
//! is out of scope and belongs to the layer above.
//!
//! ## Quick start
//!
//! ```ignore
//! use mailwire::{Client, Config, CommandOptions, LoggingEvents, Request, Value};
//!
//! #[tokio::main]
//! async fn main() -> mailwire::Result<()> {
//!     let config = Config::builder("imap.example.com").secure(true).build();
//!     let client = Client::connect(config, LoggingEvents).await?;
//!
//!     // watch mailbox size changes at any time
//!     client.set_handler("EXISTS", |response| {
//!         println!("mailbox now has {:?} messages", response.nr);
//!     });
//!
//!     let login = Request::new("LOGIN")
//!         .attr(Value::String("user@example.com".into()))
//!         .attr(Value::String("password".into()));
//!     client.enqueue(login).await?;
//!
//!     // collect the untagged LIST responses into the completion payload
//!     let listing = client
//!         .enqueue_with(
//!             Request::new("LIST")
//!                 .attr(Value::String(String::new()))
//!                 .attr(Value::String("*".into())),
//!             ["LIST"],
//!             CommandOptions::default(),
//!         )
//!         .await?;
//!     println!("{} folders", listing.payload["LIST"].len());
//!
//!     client.logout().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod client;
pub mod compiler;
pub mod compress;
pub mod config;
mod error;
pub mod framer;
pub mod handler;
pub mod parser;
pub mod transport;

pub use client::{Client, CommandHandle, CommandOptions, TagGenerator, UntaggedHandler};
pub use compiler::{CommandCompiler, Request, TextCompiler, Value};
pub use config::{Config, ConfigBuilder};
pub use error::{Error, Result};
pub use framer::ResponseFramer;
pub use handler::{ClientEvent, CollectingEvents, EventHandler, LoggingEvents, NoopEvents};
pub use parser::{Attribute, Response, ResponseParser, TextParser};
pub use transport::{ImapStream, Transport, connect, connect_plain, connect_tls};
