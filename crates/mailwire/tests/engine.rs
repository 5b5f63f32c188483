//! End-to-end tests for the connection engine.
//!
//! Each test drives the client against a scripted server over an in-memory
//! duplex pipe. Time is paused, so idle and socket timers fire
//! deterministically via tokio's auto-advance.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use mailwire::compress::DeflateCodec;
use mailwire::{
    Client, ClientEvent, CommandOptions, Config, Error, EventHandler, Request, Response,
    Transport, Value,
};

/// In-memory transport for tests. STARTTLS upgrade is a no-op.
struct TestStream(DuplexStream);

impl AsyncRead for TestStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TestStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

impl Transport for TestStream {
    fn upgrade_to_secure(
        self,
        _host: &str,
        _extra_roots: &[Vec<u8>],
    ) -> impl Future<Output = mailwire::Result<Self>> + Send {
        async move { Ok(self) }
    }
}

/// Event handler that forwards everything into a channel.
struct ChannelEvents(UnboundedSender<ClientEvent>);

impl EventHandler for ChannelEvents {
    fn on_ready(&mut self) {
        let _ = self.0.send(ClientEvent::Ready);
    }

    fn on_idle(&mut self) {
        let _ = self.0.send(ClientEvent::Idle);
    }

    fn on_error(&mut self, error: &Error) {
        let _ = self.0.send(ClientEvent::Error(error.to_string()));
    }

    fn on_cert(&mut self, der: &[u8]) {
        let _ = self.0.send(ClientEvent::Cert(der.to_vec()));
    }
}

fn connect_pair() -> (Client, DuplexStream, UnboundedReceiver<ClientEvent>) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (tx, rx) = unbounded_channel();
    let config = Config::builder("server.test").build();
    let client = Client::from_stream(TestStream(client_io), config, ChannelEvents(tx));
    (client, server_io, rx)
}

async fn read_line(server: &mut DuplexStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        server
            .read_exact(&mut byte)
            .await
            .expect("server side closed early");
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }
    String::from_utf8(line).unwrap()
}

async fn send(server: &mut DuplexStream, data: &[u8]) {
    server.write_all(data).await.unwrap();
    server.flush().await.unwrap();
}

/// Waits for a specific event, skipping idle notifications.
async fn expect_event(rx: &mut UnboundedReceiver<ClientEvent>, expected: &ClientEvent) {
    loop {
        let event = rx.recv().await.expect("event channel closed");
        if &event == expected {
            return;
        }
        assert_eq!(
            event,
            ClientEvent::Idle,
            "unexpected event while waiting for {expected:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn greeting_then_idle() {
    let (_client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK IMAP4rev1 ready\r\n").await;

    assert_eq!(events.recv().await, Some(ClientEvent::Ready));
    // nothing enqueued: the idle notification fires after the grace period
    assert_eq!(events.recv().await, Some(ClientEvent::Idle));
}

#[tokio::test(start_paused = true)]
async fn simple_command_resolves_with_tagged_response() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue("CAPABILITY");
    assert_eq!(read_line(&mut server).await, "W1 CAPABILITY\r\n");

    send(&mut server, b"* CAPABILITY IMAP4rev1 AUTH=PLAIN\r\n").await;
    send(&mut server, b"W1 OK done\r\n").await;

    let response = handle.await.unwrap();
    assert_eq!(response.tag, "W1");
    assert_eq!(response.command, "OK");
    assert_eq!(response.human_readable.as_deref(), Some("done"));
    assert!(response.payload.is_empty());
}

#[tokio::test(start_paused = true)]
async fn untagged_responses_collect_into_payload() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let request = Request::new("LIST")
        .attr(Value::String(String::new()))
        .attr(Value::String("*".to_string()));
    let handle = client.enqueue_with(request, ["LIST"], CommandOptions::default());
    assert_eq!(read_line(&mut server).await, "W1 LIST \"\" \"*\"\r\n");

    send(&mut server, b"* LIST (\\HasChildren) \"/\" INBOX\r\n").await;
    send(&mut server, b"* LIST () \"/\" Sent\r\n").await;
    send(&mut server, b"W1 OK listed\r\n").await;

    let response = handle.await.unwrap();
    let listed = &response.payload["LIST"];
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].command, "LIST");
    assert_eq!(listed[1].command, "LIST");
}

#[tokio::test(start_paused = true)]
async fn accepted_untagged_also_reaches_global_handler() {
    let (client, mut server, mut events) = connect_pair();
    let (seen_tx, mut seen_rx) = unbounded_channel::<Response>();

    // registered for a name the in-flight command is also collecting
    client.set_handler("LIST", move |response| {
        let _ = seen_tx.send(response.clone());
    });

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let request = Request::new("LIST")
        .attr(Value::String(String::new()))
        .attr(Value::String("*".to_string()));
    let handle = client.enqueue_with(request, ["LIST"], CommandOptions::default());
    read_line(&mut server).await;

    send(&mut server, b"* LIST () \"/\" INBOX\r\n").await;
    send(&mut server, b"* LIST () \"/\" Sent\r\n").await;
    send(&mut server, b"W1 OK listed\r\n").await;

    // the payload bucket still collects both responses
    let response = handle.await.unwrap();
    assert_eq!(response.payload["LIST"].len(), 2);

    // and the handler saw each of them too
    let first = seen_rx.recv().await.unwrap();
    let second = seen_rx.recv().await.unwrap();
    assert_eq!(first.command, "LIST");
    assert_eq!(second.command, "LIST");
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn declared_payload_buckets_survive_empty() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let request = Request::new("LIST")
        .attr(Value::String(String::new()))
        .attr(Value::String("*".to_string()));
    let handle = client.enqueue_with(request, ["LIST", "SEARCH"], CommandOptions::default());
    read_line(&mut server).await;

    // only LIST responses arrive; the SEARCH bucket stays declared but empty
    send(&mut server, b"* LIST () \"/\" INBOX\r\n").await;
    send(&mut server, b"W1 OK listed\r\n").await;

    let response = handle.await.unwrap();
    assert_eq!(response.payload.len(), 2);
    assert_eq!(response.payload["LIST"].len(), 1);
    assert!(response.payload["SEARCH"].is_empty());
}

#[tokio::test(start_paused = true)]
async fn numeric_untagged_reaches_global_handler() {
    let (client, mut server, mut events) = connect_pair();
    let (seen_tx, mut seen_rx) = unbounded_channel::<Response>();

    client.set_handler("EXISTS", move |response| {
        let _ = seen_tx.send(response.clone());
    });

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue(Request::new("SELECT").attr(Value::Atom("INBOX".to_string())));
    assert_eq!(read_line(&mut server).await, "W1 SELECT INBOX\r\n");

    send(&mut server, b"* 42 EXISTS\r\n").await;
    send(&mut server, b"W1 OK selected\r\n").await;
    handle.await.unwrap();

    let seen = seen_rx.recv().await.unwrap();
    assert_eq!(seen.command, "EXISTS");
    assert_eq!(seen.nr, Some(42));
}

#[tokio::test(start_paused = true)]
async fn literal_split_across_reads_stays_one_response() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue_with(
        Request::new("FETCH")
            .attr(Value::Atom("1".to_string()))
            .attr(Value::Atom("BODY[]".to_string())),
        ["FETCH"],
        CommandOptions::default(),
    );
    read_line(&mut server).await;

    send(&mut server, b"* 1 FETCH (BODY[] {11}\r\nhello").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    send(&mut server, b" world)\r\nW1 OK fetched\r\n").await;

    let response = handle.await.unwrap();
    assert_eq!(response.command, "OK");

    let fetched = &response.payload["FETCH"];
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].nr, Some(1));
    let mailwire::Attribute::List(items) = &fetched[0].attributes[0] else {
        panic!("expected fetch item list, got {:?}", fetched[0].attributes);
    };
    assert_eq!(
        items[1],
        mailwire::Attribute::Literal(b"hello world".to_vec())
    );
}

#[tokio::test(start_paused = true)]
async fn append_waits_for_continuation() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue(
        Request::new("APPEND")
            .attr(Value::Atom("INBOX".to_string()))
            .attr(Value::literal(b"hello".to_vec())),
    );
    assert_eq!(read_line(&mut server).await, "W1 APPEND INBOX {5}\r\n");

    send(&mut server, b"+ Ready for literal data\r\n").await;
    assert_eq!(read_line(&mut server).await, "hello\r\n");

    send(&mut server, b"W1 OK appended\r\n").await;
    handle.await.unwrap();

    // the send gate reopened exactly once: the next command goes out
    let next = client.enqueue("NOOP");
    assert_eq!(read_line(&mut server).await, "W2 NOOP\r\n");
    send(&mut server, b"W2 OK noop\r\n").await;
    next.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn no_response_rejects_with_code_and_message() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue(
        Request::new("LOGIN")
            .attr(Value::String("user".to_string()))
            .attr(Value::String("wrong".to_string())),
    );
    read_line(&mut server).await;
    send(&mut server, b"W1 NO [AUTHENTICATIONFAILED] bad creds\r\n").await;

    let error = handle.await.unwrap_err();
    match error {
        Error::No { code, message } => {
            assert_eq!(code.as_deref(), Some("AUTHENTICATIONFAILED"));
            assert_eq!(message, "bad creds");
        }
        other => panic!("expected NO rejection, got {other:?}"),
    }

    // a rejected command does not poison the connection
    let next = client.enqueue("NOOP");
    assert_eq!(read_line(&mut server).await, "W2 NOOP\r\n");
    send(&mut server, b"W2 OK noop\r\n").await;
    next.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn queued_commands_run_one_at_a_time() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let first = client.enqueue("NOOP");
    let second = client.enqueue("CAPABILITY");

    // the second command must not hit the wire before the first completes
    assert_eq!(read_line(&mut server).await, "W1 NOOP\r\n");
    send(&mut server, b"W1 OK one\r\n").await;
    first.await.unwrap();

    assert_eq!(read_line(&mut server).await, "W2 CAPABILITY\r\n");
    send(&mut server, b"W2 OK two\r\n").await;
    second.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn sasl_empty_line_after_error_continuation() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue_with(
        Request::new("AUTHENTICATE").attr(Value::Atom("PLAIN".to_string())),
        std::iter::empty::<String>(),
        CommandOptions::new().empty_line_on_continuation(true),
    );
    read_line(&mut server).await;

    // server challenges even though every chunk has been sent
    send(&mut server, b"+ \r\n").await;
    assert_eq!(read_line(&mut server).await, "\r\n");

    send(&mut server, b"W1 NO [AUTHENTICATIONFAILED] nope\r\n").await;
    assert!(handle.await.is_err());
}

#[tokio::test(start_paused = true)]
async fn compressed_session_stays_transparent() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue(
        Request::new("COMPRESS").attr(Value::Atom("DEFLATE".to_string())),
    );
    assert_eq!(read_line(&mut server).await, "W1 COMPRESS DEFLATE\r\n");
    send(&mut server, b"W1 OK compression active\r\n").await;
    handle.await.unwrap();

    // the tagged OK arrived uncompressed; everything after flows deflated
    client.enable_compression().await.unwrap();
    let mut codec = DeflateCodec::new();

    let handle = client.enqueue("NOOP");
    let mut carry = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        if carry.windows(2).any(|w| w == b"\r\n") {
            break;
        }
        let n = server.read(&mut buf).await.unwrap();
        assert!(n > 0, "server saw eof before the command");
        carry.extend(codec.inflate(&buf[..n]).unwrap());
    }
    assert_eq!(carry, b"W2 NOOP\r\n");

    let wire = codec.deflate(b"W2 OK done\r\n").unwrap();
    send(&mut server, &wire).await;

    let response = handle.await.unwrap();
    assert_eq!(response.human_readable.as_deref(), Some("done"));
}

#[tokio::test(start_paused = true)]
async fn logout_resolves_when_server_closes() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let logout = tokio::spawn(async move {
        client.logout().await
    });

    assert_eq!(read_line(&mut server).await, "W1 LOGOUT\r\n");
    send(&mut server, b"* BYE logging out\r\n").await;
    send(&mut server, b"W1 OK bye\r\n").await;
    drop(server);

    logout.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn server_disconnect_funnels_one_error() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let handle = client.enqueue("NOOP");
    read_line(&mut server).await;
    drop(server);

    // the in-flight completion is rejected and exactly one error is reported
    let error = handle.await.unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed(_)));

    loop {
        match events.recv().await {
            Some(ClientEvent::Error(text)) => {
                assert!(text.contains("closed"), "unexpected error text: {text}");
                break;
            }
            Some(ClientEvent::Idle) => {}
            other => panic!("expected error event, got {other:?}"),
        }
    }
    assert!(events.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn socket_timeout_is_fatal() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    // the server never answers; the write deadline fires
    let handle = client.enqueue("NOOP");
    read_line(&mut server).await;

    let error = handle.await.unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed(_)));

    loop {
        match events.recv().await {
            Some(ClientEvent::Error(text)) => {
                assert!(text.contains("timed out"), "unexpected error text: {text}");
                break;
            }
            Some(ClientEvent::Idle) => {}
            other => panic!("expected timeout event, got {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn close_is_idempotent_and_rejects_new_commands() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    client.close().await;
    client.close().await;

    let error = client.enqueue("NOOP").await.unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed(_)));
}

#[tokio::test(start_paused = true)]
async fn pending_commands_rejected_on_close() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    let in_flight = client.enqueue("NOOP");
    let queued = client.enqueue("CAPABILITY");
    read_line(&mut server).await;

    client.close().await;

    assert!(matches!(
        in_flight.await.unwrap_err(),
        Error::ConnectionClosed(_)
    ));
    assert!(matches!(
        queued.await.unwrap_err(),
        Error::ConnectionClosed(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn upgrade_keeps_connection_usable() {
    let (client, mut server, mut events) = connect_pair();

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    client.upgrade().await.unwrap();

    let handle = client.enqueue("NOOP");
    assert_eq!(read_line(&mut server).await, "W1 NOOP\r\n");
    send(&mut server, b"W1 OK noop\r\n").await;
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn handlers_fire_between_commands() {
    let (client, mut server, mut events) = connect_pair();
    let (seen_tx, mut seen_rx) = unbounded_channel::<u32>();

    client.set_handler("EXPUNGE", move |response| {
        if let Some(nr) = response.nr {
            let _ = seen_tx.send(nr);
        }
    });

    send(&mut server, b"* OK ready\r\n").await;
    expect_event(&mut events, &ClientEvent::Ready).await;

    // unsolicited expunge with no command in flight
    send(&mut server, b"* 7 EXPUNGE\r\n").await;
    assert_eq!(seen_rx.recv().await, Some(7));
}
