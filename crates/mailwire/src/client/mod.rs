//! The client handle.
//!
//! [`Client`] is a cheap-to-clone handle over the connection engine. The
//! engine runs as its own task and owns the transport; the handle enqueues
//! commands and control operations over a channel and hands back completion
//! futures.
//!
//! ```ignore
//! use mailwire::{Client, Config, LoggingEvents};
//!
//! let config = Config::builder("imap.example.com").port(143).build();
//! let client = Client::connect(config, LoggingEvents).await?;
//!
//! let response = client.enqueue("CAPABILITY").await?;
//! println!("server says: {:?}", response.human_readable);
//!
//! client.logout().await?;
//! ```

mod command;
mod engine;

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;

use crate::compiler::{CommandCompiler, Request, TextCompiler};
use crate::config::Config;
use crate::handler::EventHandler;
use crate::parser::{Response, ResponseParser, TextParser};
use crate::transport::{Transport, connect};
use crate::{Error, Result};

pub use command::{CommandOptions, TagGenerator};
pub use engine::UntaggedHandler;

use engine::{Engine, Op};

/// Handle to a running IMAP connection.
///
/// Dropping every clone of the handle closes the connection.
#[derive(Clone)]
pub struct Client {
    ops: mpsc::UnboundedSender<Op>,
}

impl Client {
    /// Opens the transport described by `config` and starts the engine.
    ///
    /// Resolves once the socket (and TLS, when configured) is established;
    /// the server greeting arrives later and fires the handler's `on_ready`.
    ///
    /// # Errors
    ///
    /// Returns the transport open error.
    pub async fn connect(config: Config, events: impl EventHandler) -> Result<Self> {
        let stream = connect(&config).await?;
        Ok(Self::from_stream(stream, config, events))
    }

    /// Starts the engine over an already-open transport.
    ///
    /// Useful for tests and for callers that manage their own sockets.
    pub fn from_stream<S: Transport>(stream: S, config: Config, events: impl EventHandler) -> Self {
        Self::from_parts(
            stream,
            config,
            events,
            Box::new(TextParser),
            Box::new(TextCompiler),
        )
    }

    /// Starts the engine with explicit parser and compiler collaborators.
    pub fn from_parts<S: Transport>(
        stream: S,
        config: Config,
        events: impl EventHandler,
        parser: Box<dyn ResponseParser>,
        compiler: Box<dyn CommandCompiler>,
    ) -> Self {
        let span = tracing::debug_span!(
            "imap",
            session = %config.session_id.as_deref().unwrap_or("-"),
            host = %config.host,
        );
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(stream, config, Box::new(events), parser, compiler, ops_rx);
        tokio::spawn(engine.run().instrument(span));
        Self { ops: ops_tx }
    }

    /// Enqueues a command with no untagged collection and default options.
    ///
    /// A bare string is wrapped into a request with that command name.
    pub fn enqueue(&self, request: impl Into<Request>) -> CommandHandle {
        self.enqueue_with(request, std::iter::empty::<String>(), CommandOptions::default())
    }

    /// Enqueues a command.
    ///
    /// Untagged responses whose name is in `accept_untagged` are collected
    /// into the command's payload and attached to the tagged completion.
    /// The returned handle resolves with the tagged response, or rejects
    /// when the server answers NO or BAD or the connection dies first.
    pub fn enqueue_with(
        &self,
        request: impl Into<Request>,
        accept_untagged: impl IntoIterator<Item = impl Into<String>>,
        options: CommandOptions,
    ) -> CommandHandle {
        let (completion, receiver) = oneshot::channel();
        let accept: BTreeSet<String> = accept_untagged
            .into_iter()
            .map(|name| name.into().to_ascii_uppercase())
            .collect();
        let queued = command::QueuedCommand {
            request: request.into(),
            accept_untagged: accept,
            options,
            completion,
        };
        if let Err(mpsc::error::SendError(op)) = self.ops.send(Op::Enqueue(queued))
            && let Op::Enqueue(queued) = op
        {
            let _ = queued
                .completion
                .send(Err(Error::ConnectionClosed("client is closed".to_string())));
        }
        CommandHandle { receiver }
    }

    /// Registers (or replaces) a handler for untagged responses by name.
    ///
    /// The handler runs on the connection task for every `* <NAME> ...`
    /// response that is not collected by the in-flight command.
    pub fn set_handler(
        &self,
        name: impl Into<String>,
        handler: impl FnMut(&Response) + Send + 'static,
    ) {
        let _ = self
            .ops
            .send(Op::SetHandler(name.into(), Box::new(handler)));
    }

    /// Removes a previously registered untagged handler.
    pub fn clear_handler(&self, name: impl Into<String>) {
        let _ = self.ops.send(Op::ClearHandler(name.into()));
    }

    /// Turns on the DEFLATE layer.
    ///
    /// Call this from the completion of a successful `COMPRESS DEFLATE`
    /// command, before the server sends any compressed byte.
    ///
    /// # Errors
    ///
    /// Returns a compression error if the codec cannot start, or a closed
    /// error if the connection is gone.
    pub async fn enable_compression(&self) -> Result<()> {
        self.round_trip(Op::EnableCompression).await?
    }

    /// Upgrades the transport to TLS in place (STARTTLS).
    ///
    /// The server must already have accepted STARTTLS at the command layer.
    /// No framer state is lost across the upgrade.
    ///
    /// # Errors
    ///
    /// Returns the TLS handshake error; the connection is torn down on
    /// failure.
    pub async fn upgrade(&self) -> Result<()> {
        self.round_trip(Op::Upgrade).await?
    }

    /// Sends LOGOUT and resolves once the server closes the connection.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the connection dies abnormally while
    /// logging out.
    pub async fn logout(&self) -> Result<()> {
        self.round_trip(Op::Logout).await?
    }

    /// Closes the connection. Always resolves, and is idempotent.
    ///
    /// Pending and queued commands are rejected with a connection-closed
    /// error.
    pub async fn close(&self) {
        let (done, receiver) = oneshot::channel();
        if self.ops.send(Op::Close(done)).is_ok() {
            let _ = receiver.await;
        }
    }

    async fn round_trip<T>(&self, op: impl FnOnce(oneshot::Sender<T>) -> Op) -> Result<T> {
        let (done, receiver) = oneshot::channel();
        self.ops
            .send(op(done))
            .map_err(|_| Error::ConnectionClosed("client is closed".to_string()))?;
        receiver
            .await
            .map_err(|_| Error::ConnectionClosed("client is closed".to_string()))
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("closed", &self.ops.is_closed())
            .finish()
    }
}

/// Completion handle for an enqueued command.
///
/// Resolves with the final tagged response (payload attached), or with an
/// error: a server NO/BAD rejection, or the fatal error that closed the
/// connection first.
#[derive(Debug)]
pub struct CommandHandle {
    receiver: oneshot::Receiver<Result<Response>>,
}

impl Future for CommandHandle {
    type Output = Result<Response>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| match received {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::ConnectionClosed("client is closed".to_string())),
            })
    }
}
