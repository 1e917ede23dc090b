pub mod pubsub;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error as ThisError;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::command::Command;
use crate::connection::Connection;
use crate::frame::Frame;
use pubsub::{PushMessage, SubscriptionListener};

/// Failures surfaced to callers. Cloneable so a single transport failure can
/// fan out to every request pending on the connection.
#[derive(Clone, Debug, PartialEq, ThisError)]
pub enum ClientError {
    /// The server answered this request with an error reply. Other pending
    /// requests and the connection itself are unaffected.
    #[error("{message} (command: {command})")]
    Redis { message: String, command: String },
    /// The stream carried something the protocol does not allow. Fatal to
    /// the connection.
    #[error("protocol error; {0}")]
    Protocol(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("already subscribed, cannot send this command")]
    Subscribed,
    #[error("unexpected reply type for {command}; expected {expected}, got {actual}")]
    UnexpectedReply {
        command: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("client is closed")]
    Closed,
}

/// The reply shape a caller expects. Used only to fail fast on a mismatch;
/// nil replies are valid bulks and arrays.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReplyKind {
    Simple,
    Integer,
    Bulk,
    Array,
    Any,
}

impl ReplyKind {
    fn matches(&self, frame: &Frame) -> bool {
        match self {
            ReplyKind::Simple => matches!(frame, Frame::Simple(_)),
            ReplyKind::Integer => matches!(frame, Frame::Integer(_)),
            ReplyKind::Bulk => matches!(frame, Frame::Bulk(_) | Frame::NullBulk),
            ReplyKind::Array => matches!(frame, Frame::Array(_) | Frame::NullArray),
            ReplyKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ReplyKind::Simple => "simple string",
            ReplyKind::Integer => "integer",
            ReplyKind::Bulk => "bulk string",
            ReplyKind::Array => "array",
            ReplyKind::Any => "any",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Clone, Debug)]
pub struct ConnectOptions {
    /// Fixed delay between reconnection attempts after the connection drops.
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// A pipelined RESP client.
///
/// Requests are submitted without waiting for earlier replies; the server
/// answers in submission order, so replies are paired with requests strictly
/// FIFO. All handles cloned from one `connect` share a single connection and
/// its FIFO.
#[derive(Clone)]
pub struct Client {
    requests: mpsc::Sender<Request>,
    shared: Arc<Shared>,
}

struct Shared {
    subscribed: AtomicBool,
    closed: watch::Sender<bool>,
    state: watch::Sender<ConnectionState>,
    listeners: Mutex<Vec<Arc<dyn SubscriptionListener>>>,
}

impl Shared {
    fn new() -> Shared {
        Shared {
            subscribed: AtomicBool::new(false),
            closed: watch::channel(false).0,
            state: watch::channel(ConnectionState::Disconnected).0,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// A submitted command waiting for its reply. Fulfilled exactly once, in
/// submission order.
struct PendingRequest {
    command: Command,
    expected: ReplyKind,
    reply: oneshot::Sender<Result<Frame, ClientError>>,
}

enum Request {
    Execute {
        command: Command,
        expected: ReplyKind,
        reply: oneshot::Sender<Result<Frame, ClientError>>,
    },
    /// Subscribe-family commands resolve once written; their confirmations
    /// arrive as push messages, not replies.
    Subscribe {
        command: Command,
        ack: oneshot::Sender<Result<(), ClientError>>,
    },
}

impl Client {
    pub async fn connect(addr: impl Into<String>) -> crate::Result<Client> {
        Self::connect_with(addr, ConnectOptions::default()).await
    }

    /// Connects to a server. The first attempt fails loudly; once connected,
    /// lost connections are retried forever at a fixed delay until
    /// [`Client::close`].
    pub async fn connect_with(
        addr: impl Into<String>,
        options: ConnectOptions,
    ) -> crate::Result<Client> {
        let addr = addr.into();
        let stream = TcpStream::connect(&addr).await?;

        let (requests, inbox) = mpsc::channel(1024);
        let shared = Arc::new(Shared::new());
        shared.set_state(ConnectionState::Connected);

        tokio::spawn(run_client(addr, stream, inbox, shared.clone(), options));

        Ok(Client { requests, shared })
    }

    /// Submits a command and resolves with its paired reply. Non-blocking on
    /// the wire: many callers may have requests in flight at once.
    pub async fn execute(
        &self,
        expected: ReplyKind,
        command: Command,
    ) -> Result<Frame, ClientError> {
        if self.shared.is_subscribed() {
            return Err(ClientError::Subscribed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(Request::Execute {
                command,
                expected,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        reply_rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    /// Closes the connection. Idempotent; pending requests fail and the
    /// connection task exits without reconnecting.
    pub fn close(&self) {
        self.closed_signal().send_replace(true);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// A watch on the connection state, for callers that want to observe
    /// reconnects.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    // Publish/subscribe section

    pub async fn subscribe(
        &self,
        channels: impl IntoIterator<Item = &str>,
    ) -> Result<(), ClientError> {
        self.send_subscription("SUBSCRIBE", channels).await
    }

    pub async fn psubscribe(
        &self,
        patterns: impl IntoIterator<Item = &str>,
    ) -> Result<(), ClientError> {
        self.send_subscription("PSUBSCRIBE", patterns).await
    }

    pub async fn unsubscribe(
        &self,
        channels: impl IntoIterator<Item = &str>,
    ) -> Result<(), ClientError> {
        self.send_subscription("UNSUBSCRIBE", channels).await
    }

    pub async fn punsubscribe(
        &self,
        patterns: impl IntoIterator<Item = &str>,
    ) -> Result<(), ClientError> {
        self.send_subscription("PUNSUBSCRIBE", patterns).await
    }

    /// Entering subscribed mode is one-way for the life of the connection:
    /// from the first subscribe-family call on, ordinary commands are
    /// rejected. Only a disconnect resets the mode.
    async fn send_subscription(
        &self,
        verb: &'static str,
        channels: impl IntoIterator<Item = &str>,
    ) -> Result<(), ClientError> {
        let mut command = Command::new(verb);
        for channel in channels {
            command = command.arg(Bytes::copy_from_slice(channel.as_bytes()));
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.requests
            .send(Request::Subscribe {
                command,
                ack: ack_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        ack_rx.await.map_err(|_| ClientError::ConnectionLost)?
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.shared.listeners.lock().unwrap().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) -> bool {
        let mut listeners = self.shared.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|registered| !Arc::ptr_eq(registered, listener));
        listeners.len() < before
    }

    // Typed command wrappers: thin argument marshalling over `execute`, the
    // same boundary the original's generated methods sit on.

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.execute(ReplyKind::Any, Command::new("PING"))
            .await
            .map(|_| ())
    }

    pub async fn echo(&self, message: &[u8]) -> Result<Bytes, ClientError> {
        let command = Command::new("ECHO").arg(Bytes::copy_from_slice(message));
        match self.execute(ReplyKind::Bulk, command).await? {
            Frame::Bulk(payload) => Ok(payload),
            _ => Ok(Bytes::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, ClientError> {
        let command = Command::new("GET").arg(Bytes::copy_from_slice(key.as_bytes()));
        match self.execute(ReplyKind::Bulk, command).await? {
            Frame::Bulk(value) => Ok(Some(value)),
            _ => Ok(None),
        }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), ClientError> {
        let command = Command::new("SET")
            .arg(Bytes::copy_from_slice(key.as_bytes()))
            .arg(Bytes::copy_from_slice(value));
        self.execute(ReplyKind::Simple, command).await.map(|_| ())
    }

    pub async fn del(&self, key: &str) -> Result<i64, ClientError> {
        let command = Command::new("DEL").arg(Bytes::copy_from_slice(key.as_bytes()));
        match self.execute(ReplyKind::Integer, command).await? {
            Frame::Integer(removed) => Ok(removed),
            _ => Ok(0),
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        let command = Command::new("EXISTS").arg(Bytes::copy_from_slice(key.as_bytes()));
        match self.execute(ReplyKind::Integer, command).await? {
            Frame::Integer(found) => Ok(found != 0),
            _ => Ok(false),
        }
    }

    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<i64, ClientError> {
        let command = Command::new("PUBLISH")
            .arg(Bytes::copy_from_slice(channel.as_bytes()))
            .arg(Bytes::copy_from_slice(payload));
        match self.execute(ReplyKind::Integer, command).await? {
            Frame::Integer(receivers) => Ok(receivers),
            _ => Ok(0),
        }
    }

    fn closed_signal(&self) -> &watch::Sender<bool> {
        &self.shared.closed
    }
}

enum Disconnect {
    /// Owner-initiated; terminal.
    Closed,
    /// Transport or protocol failure; reconnect after the retry delay.
    Lost,
}

async fn run_client(
    addr: String,
    first_stream: TcpStream,
    mut inbox: mpsc::Receiver<Request>,
    shared: Arc<Shared>,
    options: ConnectOptions,
) {
    let mut closed = shared.closed.subscribe();
    let mut stream = Some(first_stream);

    loop {
        let stream = match stream.take() {
            Some(stream) => stream,
            None => match TcpStream::connect(&addr).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(%addr, %err, "reconnect attempt failed");
                    if wait_retry(&mut closed, options.retry_delay).await {
                        break;
                    }
                    continue;
                }
            },
        };

        let connection = Connection::new(stream);
        debug!(%addr, connection_id = %connection.id, "connected");
        shared.set_state(ConnectionState::Connected);

        let outcome = drive(connection, &mut inbox, &shared, &mut closed).await;
        // Subscribed mode does not survive the connection that entered it.
        shared.subscribed.store(false, Ordering::SeqCst);

        match outcome {
            Disconnect::Closed => break,
            Disconnect::Lost => {
                shared.set_state(ConnectionState::Connecting);
                if wait_retry(&mut closed, options.retry_delay).await {
                    break;
                }
            }
        }
    }

    shared.set_state(ConnectionState::Closed);

    // Anything still queued behind the connection task fails too.
    inbox.close();
    while let Ok(request) = inbox.try_recv() {
        fail_request(request, ClientError::Closed);
    }
}

/// Waits out the fixed retry delay; returns true if the client was closed
/// in the meantime.
async fn wait_retry(closed: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = sleep(delay) => false,
        _ = wait_closed(closed) => true,
    }
}

/// Resolves once the owner has called close. The watch guard is dropped in
/// here and never crosses an await in the callers' select arms.
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Drives one live connection: writes submitted commands, decodes inbound
/// frames and pairs them with pending requests. Writes and enqueues happen
/// in one sequential step, so the byte order on the socket always matches
/// the FIFO order replies are matched against.
async fn drive(
    mut connection: Connection,
    inbox: &mut mpsc::Receiver<Request>,
    shared: &Shared,
    closed: &mut watch::Receiver<bool>,
) -> Disconnect {
    let mut pending: VecDeque<PendingRequest> = VecDeque::new();

    loop {
        tokio::select! {
            _ = wait_closed(closed) => {
                fail_all(&mut pending, ClientError::Closed);
                return Disconnect::Closed;
            }
            request = inbox.recv() => match request {
                None => {
                    // Every handle is gone.
                    fail_all(&mut pending, ClientError::Closed);
                    return Disconnect::Closed;
                }
                Some(Request::Execute { command, expected, reply }) => {
                    // Checked again here: a subscribe may have raced the
                    // handle-side check.
                    if shared.is_subscribed() {
                        let _ = reply.send(Err(ClientError::Subscribed));
                        continue;
                    }
                    if let Err(err) = connection.write_command(&command).await {
                        warn!(%err, "write failed");
                        let _ = reply.send(Err(ClientError::ConnectionLost));
                        fail_all(&mut pending, ClientError::ConnectionLost);
                        return Disconnect::Lost;
                    }
                    pending.push_back(PendingRequest { command, expected, reply });
                }
                Some(Request::Subscribe { command, ack }) => {
                    match connection.write_command(&command).await {
                        Ok(()) => {
                            // The mode flips only once the command is on the
                            // wire; a rejected or failed subscribe leaves the
                            // connection in request/reply mode.
                            shared.subscribed.store(true, Ordering::SeqCst);
                            let _ = ack.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(%err, "write failed");
                            let _ = ack.send(Err(ClientError::ConnectionLost));
                            fail_all(&mut pending, ClientError::ConnectionLost);
                            return Disconnect::Lost;
                        }
                    }
                }
            },
            result = connection.read_frame() => match result {
                Ok(Some(frame)) => {
                    if let Err(err) = on_frame(frame, &mut pending, shared) {
                        error!(%err, "protocol violation, tearing down connection");
                        fail_all(&mut pending, err);
                        return Disconnect::Lost;
                    }
                }
                Ok(None) => {
                    debug!("server closed the connection");
                    fail_all(&mut pending, ClientError::ConnectionLost);
                    return Disconnect::Lost;
                }
                Err(err) => {
                    warn!(%err, "read failed");
                    fail_all(&mut pending, ClientError::ConnectionLost);
                    return Disconnect::Lost;
                }
            }
        }
    }
}

/// Pairs one decoded frame with the oldest pending request, or routes it to
/// the push multiplexer when nothing is pending and the connection is
/// subscribed. An unmatched frame otherwise corrupts all subsequent FIFO
/// pairing, so it is fatal.
fn on_frame(
    frame: Frame,
    pending: &mut VecDeque<PendingRequest>,
    shared: &Shared,
) -> Result<(), ClientError> {
    match pending.pop_front() {
        Some(request) => {
            let result = match frame {
                Frame::Error(message) => Err(ClientError::Redis {
                    message,
                    command: request.command.name(),
                }),
                frame if request.expected.matches(&frame) => Ok(frame),
                frame => Err(ClientError::UnexpectedReply {
                    command: request.command.name(),
                    expected: request.expected.name(),
                    actual: frame.kind(),
                }),
            };
            // The caller may have given up on the slot; that does not
            // un-enqueue the request, it just discards the reply.
            let _ = request.reply.send(result);
            Ok(())
        }
        None if shared.is_subscribed() => {
            let message = PushMessage::classify(&frame)
                .map_err(|err| ClientError::Protocol(err.to_string()))?;
            let listeners = shared.listeners.lock().unwrap().clone();
            pubsub::dispatch(&message, &listeners);
            Ok(())
        }
        None => Err(ClientError::Protocol(format!(
            "reply with no pending request: {}",
            frame
        ))),
    }
}

fn fail_all(pending: &mut VecDeque<PendingRequest>, error: ClientError) {
    for request in pending.drain(..) {
        let _ = request.reply.send(Err(error.clone()));
    }
}

fn fail_request(request: Request, error: ClientError) {
    match request {
        Request::Execute { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        Request::Subscribe { ack, .. } => {
            let _ = ack.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn reply_kind_accepts_nil_forms() {
        assert!(ReplyKind::Bulk.matches(&Frame::NullBulk));
        assert!(ReplyKind::Bulk.matches(&Frame::Bulk(Bytes::from("x"))));
        assert!(ReplyKind::Array.matches(&Frame::NullArray));
        assert!(ReplyKind::Array.matches(&Frame::Array(Vec::new())));
    }

    #[test]
    fn reply_kind_rejects_cross_shapes() {
        assert!(!ReplyKind::Integer.matches(&Frame::Simple("OK".to_string())));
        assert!(!ReplyKind::Bulk.matches(&Frame::Integer(1)));
        assert!(ReplyKind::Any.matches(&Frame::Integer(1)));
    }

    fn pending_for(command: Command) -> (PendingRequest, oneshot::Receiver<Result<Frame, ClientError>>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingRequest {
                command,
                expected: ReplyKind::Any,
                reply: tx,
            },
            rx,
        )
    }

    #[test]
    fn frames_fulfill_pending_requests_in_fifo_order() {
        let shared = Shared::new();
        let mut pending = VecDeque::new();

        let (first, mut first_rx) = pending_for(Command::new("GET").arg("a"));
        let (second, mut second_rx) = pending_for(Command::new("GET").arg("b"));
        pending.push_back(first);
        pending.push_back(second);

        on_frame(Frame::Bulk(Bytes::from("1")), &mut pending, &shared).unwrap();
        assert_eq!(
            first_rx.try_recv().unwrap().unwrap(),
            Frame::Bulk(Bytes::from("1"))
        );
        assert!(second_rx.try_recv().is_err());

        on_frame(Frame::Bulk(Bytes::from("2")), &mut pending, &shared).unwrap();
        assert_eq!(
            second_rx.try_recv().unwrap().unwrap(),
            Frame::Bulk(Bytes::from("2"))
        );
    }

    #[test]
    fn error_reply_fails_only_its_own_request() {
        let shared = Shared::new();
        let mut pending = VecDeque::new();

        let (first, mut first_rx) = pending_for(Command::new("INCR").arg("k"));
        let (second, mut second_rx) = pending_for(Command::new("GET").arg("k"));
        pending.push_back(first);
        pending.push_back(second);

        on_frame(
            Frame::Error("ERR not an integer".to_string()),
            &mut pending,
            &shared,
        )
        .unwrap();
        assert_eq!(
            first_rx.try_recv().unwrap(),
            Err(ClientError::Redis {
                message: "ERR not an integer".to_string(),
                command: "INCR".to_string(),
            })
        );

        on_frame(Frame::Bulk(Bytes::from("5")), &mut pending, &shared).unwrap();
        assert!(second_rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn type_mismatch_is_surfaced_not_coerced() {
        let shared = Shared::new();
        let mut pending = VecDeque::new();

        let (tx, mut rx) = oneshot::channel();
        pending.push_back(PendingRequest {
            command: Command::new("STRLEN").arg("k"),
            expected: ReplyKind::Integer,
            reply: tx,
        });

        on_frame(Frame::Simple("OK".to_string()), &mut pending, &shared).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ClientError::UnexpectedReply { .. })
        ));
    }

    /// The connection task must be spawnable onto the multi-threaded
    /// runtime; this only compiles if its future is `Send`.
    #[tokio::test]
    async fn connection_task_runs_on_any_worker() {
        fn assert_send<T: Send>(value: T) -> T {
            value
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();

        let (_requests, inbox) = mpsc::channel(1);
        let shared = Arc::new(Shared::new());
        let task = assert_send(run_client(
            addr.to_string(),
            stream,
            inbox,
            shared,
            ConnectOptions::default(),
        ));
        drop(task);
    }

    #[tokio::test]
    async fn rejected_subscribe_does_not_enter_subscribed_mode() {
        let (requests, inbox) = mpsc::channel(1);
        drop(inbox);
        let client = Client {
            requests,
            shared: Arc::new(Shared::new()),
        };

        assert_eq!(
            client.subscribe(["news"]).await,
            Err(ClientError::Closed)
        );
        assert!(!client.shared.is_subscribed());

        // Later commands report the real condition, not subscribed mode.
        let result = client.execute(ReplyKind::Any, Command::new("PING")).await;
        assert_eq!(result, Err(ClientError::Closed));
    }

    #[test]
    fn unmatched_frame_without_subscription_is_fatal() {
        let shared = Shared::new();
        let mut pending = VecDeque::new();

        let outcome = on_frame(Frame::Integer(1), &mut pending, &shared);
        assert!(matches!(outcome, Err(ClientError::Protocol(_))));
    }

    #[test]
    fn unmatched_frame_while_subscribed_routes_to_listeners() {
        struct Recorder(Mutex<Vec<(Vec<u8>, Vec<u8>)>>);
        impl SubscriptionListener for Recorder {
            fn on_message(&self, channel: &[u8], payload: &[u8]) {
                self.0
                    .lock()
                    .unwrap()
                    .push((channel.to_vec(), payload.to_vec()));
            }
        }

        let shared = Shared::new();
        shared.subscribed.store(true, Ordering::SeqCst);
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        shared.listeners.lock().unwrap().push(recorder.clone());

        let mut pending = VecDeque::new();
        let frame = Frame::Array(vec![
            Frame::Bulk(Bytes::from("message")),
            Frame::Bulk(Bytes::from("news")),
            Frame::Bulk(Bytes::from("hello")),
        ]);
        on_frame(frame, &mut pending, &shared).unwrap();

        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.as_slice(), &[(b"news".to_vec(), b"hello".to_vec())]);
    }
}
