//! The connection engine.
//!
//! One task owns the transport, the framer, the command queue, and all
//! connection state. The public [`Client`](super::Client) handle talks to it
//! over a control channel, so every invariant on the in-flight command, the
//! framer, and the send gate holds without locks.
//!
//! Inbound flow: transport read, optional inflate, framer, then dispatch to
//! the in-flight command's payload bucket, a registered untagged handler, or
//! the command's completion. Outbound flow: queue, compiler, send gate, with
//! continuation-request pauses between literal chunks, optional deflate, then
//! the transport. The engine yields between dispatched responses so a burst
//! of framed responses cannot starve the transport.

use std::collections::{HashMap, VecDeque};
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::compiler::CommandCompiler;
use crate::compress::CompressionLayer;
use crate::config::Config;
use crate::framer::ResponseFramer;
use crate::handler::EventHandler;
use crate::parser::{Attribute, Response, ResponseParser, is_status_command};
use crate::transport::Transport;
use crate::{Error, Result};

use super::command::{ActiveCommand, QueuedCommand, TagGenerator};

/// Callback invoked for untagged responses registered by name.
pub type UntaggedHandler = Box<dyn FnMut(&Response) + Send>;

/// Control operations sent from the handle to the engine.
pub(crate) enum Op {
    Enqueue(QueuedCommand),
    SetHandler(String, UntaggedHandler),
    ClearHandler(String),
    EnableCompression(oneshot::Sender<Result<()>>),
    Upgrade(oneshot::Sender<Result<()>>),
    Logout(oneshot::Sender<Result<()>>),
    Close(oneshot::Sender<()>),
}

enum Wake {
    Op(Option<Op>),
    Read(io::Result<usize>),
    IdleTimer,
    SocketTimer,
}

pub(crate) struct Engine<S: Transport> {
    stream: Option<S>,
    framer: ResponseFramer,
    parser: Box<dyn ResponseParser>,
    compiler: Box<dyn CommandCompiler>,
    compression: Option<CompressionLayer>,
    events: Box<dyn EventHandler>,
    handlers: HashMap<String, UntaggedHandler>,
    queue: VecDeque<QueuedCommand>,
    current: Option<ActiveCommand>,
    tags: TagGenerator,
    can_send: bool,
    connection_ready: bool,
    logout_waiter: Option<oneshot::Sender<Result<()>>>,
    idle_deadline: Option<Instant>,
    socket_deadline: Option<(Instant, std::time::Duration)>,
    ops: mpsc::UnboundedReceiver<Op>,
    config: Config,
    closed: bool,
}

impl<S: Transport> Engine<S> {
    pub(crate) fn new(
        stream: S,
        config: Config,
        events: Box<dyn EventHandler>,
        parser: Box<dyn ResponseParser>,
        compiler: Box<dyn CommandCompiler>,
        ops: mpsc::UnboundedReceiver<Op>,
    ) -> Self {
        Self {
            stream: Some(stream),
            framer: ResponseFramer::new(),
            parser,
            compiler,
            compression: None,
            events,
            handlers: HashMap::new(),
            queue: VecDeque::new(),
            current: None,
            tags: TagGenerator::default(),
            can_send: false,
            connection_ready: false,
            logout_waiter: None,
            idle_deadline: None,
            socket_deadline: None,
            ops,
            config,
            closed: false,
        }
    }

    pub(crate) async fn run(mut self) {
        if let Some(der) = self.stream.as_ref().and_then(Transport::peer_certificate) {
            self.events.on_cert(&der);
        }

        let mut buf = vec![0u8; 8 * 1024];
        while !self.closed {
            let wake = tokio::select! {
                biased;
                op = self.ops.recv() => Wake::Op(op),
                result = read_some(&mut self.stream, &mut buf) => Wake::Read(result),
                () = sleep_opt(self.idle_deadline) => Wake::IdleTimer,
                () = sleep_opt(self.socket_deadline.map(|(at, _)| at)) => Wake::SocketTimer,
            };

            match wake {
                Wake::Op(Some(op)) => self.handle_op(op).await,
                // every handle is gone, nobody can drive this connection
                Wake::Op(None) => self.close().await,
                Wake::Read(Ok(0)) => self.on_transport_close().await,
                Wake::Read(Ok(n)) => {
                    if let Err(error) = self.on_data(&buf[..n]).await {
                        self.fail(error).await;
                    }
                }
                Wake::Read(Err(error)) => self.on_transport_error(error).await,
                Wake::IdleTimer => {
                    self.idle_deadline = None;
                    self.events.on_idle();
                }
                Wake::SocketTimer => {
                    let timeout = self
                        .socket_deadline
                        .take()
                        .map(|(_, timeout)| timeout)
                        .unwrap_or_default();
                    self.fail(Error::Timeout(timeout)).await;
                }
            }
        }
    }

    async fn handle_op(&mut self, op: Op) {
        match op {
            Op::Enqueue(command) => {
                if self.closed {
                    let _ = command
                        .completion
                        .send(Err(closed_error("connection is closed")));
                    return;
                }
                self.queue.push_back(command);
                self.maybe_send_next().await;
            }
            Op::SetHandler(name, handler) => {
                self.handlers.insert(name.to_ascii_uppercase(), handler);
            }
            Op::ClearHandler(name) => {
                self.handlers.remove(&name.to_ascii_uppercase());
            }
            Op::EnableCompression(done) => {
                let result = self.enable_compression();
                let _ = done.send(result);
            }
            Op::Upgrade(done) => match self.upgrade().await {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(error) => {
                    let _ = done.send(Err(error));
                    self.fail(closed_error("TLS upgrade failed")).await;
                }
            },
            Op::Logout(done) => {
                if self.closed {
                    let _ = done.send(Ok(()));
                    return;
                }
                self.logout_waiter = Some(done);
                let (completion, _discard) = oneshot::channel();
                self.queue.push_back(QueuedCommand {
                    request: crate::compiler::Request::new("LOGOUT"),
                    accept_untagged: std::collections::BTreeSet::new(),
                    options: super::command::CommandOptions::default(),
                    completion,
                });
                self.maybe_send_next().await;
            }
            Op::Close(done) => {
                self.close().await;
                let _ = done.send(());
            }
        }
    }

    /// Installs the DEFLATE layer.
    ///
    /// Must be called from the completion of a successful COMPRESS DEFLATE
    /// command, before the server sends any compressed byte. The layer is
    /// applied between reads, so the uncompressed tagged OK has already been
    /// framed and everything after it inflates cleanly.
    fn enable_compression(&mut self) -> Result<()> {
        if self.compression.is_some() {
            return Ok(());
        }
        let layer = CompressionLayer::new(self.config.offload_compression)?;
        self.compression = Some(layer);
        tracing::debug!(
            offload = self.config.offload_compression,
            "compression enabled"
        );
        Ok(())
    }

    async fn upgrade(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Err(Error::InvalidState("transport is not open".to_string()));
        };
        let secured = stream
            .upgrade_to_secure(&self.config.host, &self.config.extra_roots)
            .await?;
        if let Some(der) = secured.peer_certificate() {
            self.events.on_cert(&der);
        }
        self.stream = Some(secured);
        tracing::debug!("transport upgraded to TLS");
        Ok(())
    }

    async fn on_data(&mut self, data: &[u8]) -> Result<()> {
        // any inbound byte disarms the write timeout
        self.socket_deadline = None;

        let frames = match self.compression.as_mut() {
            Some(layer) => {
                let plain = layer.inflate(data).await?;
                self.framer.push(&plain)
            }
            None => self.framer.push(data),
        };

        for frame in frames {
            self.dispatch(&frame).await?;
            // give the transport a chance to deliver more bytes
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, frame: &[u8]) -> Result<()> {
        if frame.first() == Some(&b'+') {
            let text = frame.get(2..).unwrap_or_default();
            tracing::trace!(text = %String::from_utf8_lossy(text), "continuation request");
            self.on_continuation().await?;
            self.after_first_response().await;
            return Ok(());
        }

        let mut response = self.parser.parse(frame)?;
        normalize(&mut response);
        tracing::trace!(tag = %response.tag, command = %response.command, "dispatching response");
        self.route(response).await?;
        self.after_first_response().await;
        Ok(())
    }

    /// Sends the next pending chunk of the in-flight command.
    async fn on_continuation(&mut self) -> Result<()> {
        let to_send = match self.current.as_mut() {
            None => None,
            Some(current) => match current.chunks.pop_front() {
                Some(mut chunk) => {
                    if current.chunks.is_empty() {
                        chunk.extend_from_slice(b"\r\n");
                    }
                    Some(chunk)
                }
                None if current.options.empty_line_on_continuation => Some(b"\r\n".to_vec()),
                None => None,
            },
        };
        if let Some(data) = to_send {
            self.send_bytes(&data).await?;
        }
        Ok(())
    }

    async fn route(&mut self, response: Response) -> Result<()> {
        if response.tag == "*" {
            // a global handler fires in addition to payload collection, so a
            // name both accepted by the in-flight command and registered
            // globally reaches both
            let mut handled = false;
            if let Some(handler) = self.handlers.get_mut(&response.command) {
                handler(&response);
                handled = true;
            }
            let accepted = self
                .current
                .as_ref()
                .is_some_and(|current| current.accept_untagged.contains(&response.command));
            if accepted {
                if let Some(current) = self.current.as_mut()
                    && let Some(bucket) = current.payload.get_mut(&response.command)
                {
                    bucket.push(response);
                }
            } else if !handled {
                tracing::trace!(command = %response.command, "untagged response dropped");
            }
            return Ok(());
        }

        if let Some(current) = self.current.take_if(|c| c.tag == response.tag) {
            self.complete_command(current, response);
            self.can_send = true;
            self.maybe_send_next().await;
            return Ok(());
        }

        tracing::trace!(tag = %response.tag, "response for unknown tag dropped");
        Ok(())
    }

    fn complete_command(&mut self, current: ActiveCommand, mut response: Response) {
        // one bucket per accepted name, kept even when it stayed empty; a
        // command that accepted nothing carries no payload at all
        response.payload = current.payload;

        let result = match response.command.as_str() {
            "NO" => Err(Error::No {
                code: response.code.clone(),
                message: human_readable_or_default(&response),
            }),
            "BAD" => Err(Error::Bad {
                code: response.code.clone(),
                message: human_readable_or_default(&response),
            }),
            _ => Ok(response),
        };
        let _ = current.completion.send(result);
    }

    /// The first response of any kind makes the connection ready to send.
    async fn after_first_response(&mut self) {
        if !self.connection_ready {
            self.connection_ready = true;
            self.events.on_ready();
            self.can_send = true;
            self.maybe_send_next().await;
        }
    }

    async fn maybe_send_next(&mut self) {
        if !self.can_send || self.current.is_some() || self.closed {
            return;
        }
        let Some(queued) = self.queue.pop_front() else {
            self.idle_deadline = Some(Instant::now() + self.config.enter_idle_timeout);
            return;
        };
        self.idle_deadline = None;
        self.can_send = false;

        let mut queued = queued;
        queued.request.tag = self.tags.next();

        if let Ok(redacted) = self.compiler.compile(&queued.request, false, true) {
            let line = redacted.concat();
            tracing::debug!(command = %String::from_utf8_lossy(&line), "sending");
        }

        let chunks = match self.compiler.compile(&queued.request, true, false) {
            Ok(chunks) => chunks,
            Err(error) => {
                let message = error.to_string();
                let _ = queued.completion.send(Err(error));
                self.fail(Error::Compile(message)).await;
                return;
            }
        };

        let mut chunks: VecDeque<Vec<u8>> = chunks.into();
        let Some(mut first) = chunks.pop_front() else {
            self.fail(Error::Compile("compiler produced no chunks".to_string()))
                .await;
            return;
        };
        if chunks.is_empty() {
            first.extend_from_slice(b"\r\n");
        }

        let tag = queued.request.tag.clone();
        let mut active = ActiveCommand::new(tag, queued);
        active.chunks = chunks;
        self.current = Some(active);

        if let Err(error) = self.send_bytes(&first).await {
            self.fail(error).await;
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let deflated;
        let wire: &[u8] = match self.compression.as_mut() {
            Some(layer) => {
                deflated = layer.deflate(data).await?;
                &deflated
            }
            None => data,
        };

        // the deadline scales with the plaintext size of the write
        let timeout = self.config.socket_timeout(data.len());
        self.socket_deadline = Some((Instant::now() + timeout, timeout));

        let Some(stream) = self.stream.as_mut() else {
            return Err(closed_error("transport is closed"));
        };
        stream.write_all(wire).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn on_transport_close(&mut self) {
        if let Some(done) = self.logout_waiter.take() {
            self.close().await;
            let _ = done.send(Ok(()));
        } else if !self.closed {
            self.fail(closed_error("connection closed by server")).await;
        } else {
            self.stream = None;
        }
    }

    async fn on_transport_error(&mut self, error: io::Error) {
        if let Some(done) = self.logout_waiter.take() {
            self.close().await;
            let _ = done.send(Err(Error::Io(error)));
        } else {
            self.fail(Error::Io(error)).await;
        }
    }

    /// The funnel for irrecoverable errors.
    ///
    /// Tears the connection down and reports the error once; anything that
    /// arrives after close is silently dropped.
    async fn fail(&mut self, error: Error) {
        if self.closed {
            return;
        }
        tracing::warn!(%error, "connection failed");
        self.close().await;
        self.events.on_error(&error);
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.idle_deadline = None;
        self.socket_deadline = None;

        if let Some(current) = self.current.take() {
            let _ = current
                .completion
                .send(Err(closed_error("connection closed")));
        }
        for queued in self.queue.drain(..) {
            let _ = queued
                .completion
                .send(Err(closed_error("connection closed")));
        }
        self.handlers.clear();
        // dropping the layer ends the codec worker, if one was running
        self.compression = None;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        tracing::debug!("connection closed");
    }
}

fn closed_error(message: &str) -> Error {
    Error::ConnectionClosed(message.to_string())
}

fn human_readable_or_default(response: &Response) -> String {
    response
        .human_readable
        .clone()
        .unwrap_or_else(|| "Error".to_string())
}

/// Normalizes a parsed response in place.
///
/// `* 17 EXISTS` style responses move the atom up into `command` and keep the
/// number as `nr`. Status responses get their bracketed code, the code's
/// arguments, and the trailing human-readable text lifted into dedicated
/// fields.
fn normalize(response: &mut Response) {
    response.command = response.command.trim().to_ascii_uppercase();

    if response.tag == "*"
        && !response.command.is_empty()
        && response.command.bytes().all(|b| b.is_ascii_digit())
        && matches!(response.attributes.first(), Some(Attribute::Atom { .. }))
        && let Ok(nr) = response.command.parse::<u32>()
    {
        if let Attribute::Atom { value, .. } = response.attributes.remove(0) {
            response.command = value.trim().to_ascii_uppercase();
            response.nr = Some(nr);
        }
    }

    if is_status_command(&response.command) {
        if let Some(Attribute::Atom {
            section: Some(section),
            ..
        }) = response.attributes.first()
            && let Some(Attribute::Atom { value, .. }) = section.first()
        {
            response.code = Some(value.to_ascii_uppercase());
            response.code_data = section[1..].to_vec();
        }
        if let Some(Attribute::Text(text)) = response.attributes.last() {
            response.human_readable = Some(text.clone());
        }
    }
}

async fn read_some<S: Transport>(stream: &mut Option<S>, buf: &mut [u8]) -> io::Result<usize> {
    match stream.as_mut() {
        Some(stream) => stream.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

    use super::*;
    use crate::client::{Client, CommandOptions};
    use crate::handler::NoopEvents;
    use crate::parser::TextParser;

    fn parsed(input: &[u8]) -> Response {
        let mut response = TextParser.parse(input).unwrap();
        normalize(&mut response);
        response
    }

    #[test]
    fn test_normalize_numeric_untagged() {
        let response = parsed(b"* 42 EXISTS");
        assert_eq!(response.command, "EXISTS");
        assert_eq!(response.nr, Some(42));
        assert!(response.attributes.is_empty());
    }

    #[test]
    fn test_normalize_numeric_fetch_keeps_attributes() {
        let response = parsed(b"* 1 FETCH (UID 100)");
        assert_eq!(response.command, "FETCH");
        assert_eq!(response.nr, Some(1));
        assert_eq!(response.attributes.len(), 1);
    }

    #[test]
    fn test_normalize_extracts_code() {
        let response = parsed(b"W4 NO [AUTHENTICATIONFAILED] bad creds");
        assert_eq!(response.code.as_deref(), Some("AUTHENTICATIONFAILED"));
        assert!(response.code_data.is_empty());
        assert_eq!(response.human_readable.as_deref(), Some("bad creds"));
    }

    #[test]
    fn test_normalize_code_with_arguments() {
        let response = parsed(b"* OK [UNSEEN 17] first unseen");
        assert_eq!(response.code.as_deref(), Some("UNSEEN"));
        assert_eq!(response.code_data, vec![Attribute::Number(17)]);
        assert_eq!(response.human_readable.as_deref(), Some("first unseen"));
    }

    #[test]
    fn test_normalize_plain_untagged_untouched() {
        let response = parsed(b"* CAPABILITY IMAP4rev1");
        assert_eq!(response.command, "CAPABILITY");
        assert_eq!(response.nr, None);
        assert_eq!(response.attributes.len(), 1);
    }

    #[test]
    fn test_normalize_uppercases_command() {
        let response = parsed(b"* 3 expunge");
        assert_eq!(response.command, "EXPUNGE");
        assert_eq!(response.nr, Some(3));
    }

    /// Scripted transport for exact read/write sequencing.
    struct ScriptedTransport(tokio_test::io::Mock);

    impl AsyncRead for ScriptedTransport {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for ScriptedTransport {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.0).poll_write(cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.0).poll_shutdown(cx)
        }
    }

    impl Transport for ScriptedTransport {
        fn upgrade_to_secure(
            self,
            _host: &str,
            _extra_roots: &[Vec<u8>],
        ) -> impl std::future::Future<Output = Result<Self>> + Send {
            async move { Ok(self) }
        }
    }

    #[tokio::test]
    async fn test_scripted_exchange() {
        let mock = tokio_test::io::Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"W1 CAPABILITY\r\n")
            .read(b"* CAPABILITY IMAP4rev1\r\n")
            .read(b"W1 OK done\r\n")
            .build();

        let client = Client::from_stream(
            ScriptedTransport(mock),
            crate::config::Config::new("scripted.test"),
            NoopEvents,
        );
        let response = client
            .enqueue_with("CAPABILITY", ["CAPABILITY"], CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(response.command, "OK");
        assert_eq!(response.human_readable.as_deref(), Some("done"));
        assert_eq!(response.payload["CAPABILITY"].len(), 1);
    }
}
