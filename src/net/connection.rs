use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::group::task_queue::TaskPoster;
use crate::net::codec::{Frame, FrameEncoder, FrameError, MessageReassembler};
use crate::protocol::{ClientMessageType, ServerMessageType};

pub const WRITE_QUEUE_SIZE: usize = 100;
pub const INTRODUCTION_TIMEOUT: Duration = Duration::from_secs(15);
/// The introduction is read before the peer has proven anything, so it gets
/// a far smaller budget than regular frames.
pub const MAX_INTRODUCTION_SIZE: u64 = 64 * 1024;
const READ_BUFFER_SIZE: usize = 4096;

/// Any byte stream a connection can run over: TCP, TLS or an in-memory pipe.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

type BoxedStream = Box<dyn AsyncStream>;

/// Owner side of a connection: receives its frames and its disconnect.
///
/// Callbacks never run on the I/O tasks. They are posted to the task queue
/// handed to [`Dispatcher::new`] and run there against its state.
pub trait ConnectionDelegate: Send + Sync + 'static {
    type State: 'static;

    fn process_message(&self, state: &mut Self::State, frame: Frame);
    fn on_disconnected(&self, state: &mut Self::State);
}

/// Sender side of a connection, as seen by whoever it is bound to.
pub trait ClientConnection: Send + Sync {
    fn address(&self) -> &str;
    /// Binds where decoded frames and the final disconnect are delivered.
    fn set_up(&self, dispatcher: Dispatcher);
    /// Starts the reader and writer. Must follow [`set_up`](Self::set_up).
    fn start_handling(&self);
    /// Queues a frame without blocking. Dropped once the connection stopped;
    /// a full queue disconnects the peer.
    fn send_message(&self, id: u64, kind: ServerMessageType, payload: Bytes);
    fn disconnect_and_stop(&self);
}

/// Type-erased route from a connection's reader to its delegate's task queue.
///
/// Posting waits while the queue is full, which suspends only the reader
/// that is posting.
pub struct Dispatcher {
    on_frame: Box<dyn Fn(Frame) -> BoxFuture<'static, ()> + Send + Sync>,
    on_disconnected: Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>,
}

impl Dispatcher {
    pub fn new<D: ConnectionDelegate>(delegate: Arc<D>, tasks: TaskPoster<D::State>) -> Self {
        let frame_delegate = delegate.clone();
        let frame_tasks = tasks.clone();
        Self {
            on_frame: Box::new(move |frame| {
                let delegate = frame_delegate.clone();
                let tasks = frame_tasks.clone();
                Box::pin(async move {
                    tasks
                        .post_task_async(move |state| delegate.process_message(state, frame))
                        .await
                })
            }),
            on_disconnected: Box::new(move || {
                let delegate = delegate.clone();
                let tasks = tasks.clone();
                Box::pin(async move {
                    tasks
                        .post_task_async(move |state| delegate.on_disconnected(state))
                        .await
                })
            }),
        }
    }

    pub async fn dispatch(&self, frame: Frame) {
        (self.on_frame)(frame).await
    }

    pub async fn disconnected(&self) {
        (self.on_disconnected)().await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntroductionError {
    #[error("no introduction within {0:?}")]
    Timeout(Duration),
    #[error("introduction of {0} bytes exceeds the limit of {MAX_INTRODUCTION_SIZE} bytes")]
    TooLarge(u64),
    #[error("introduction of {0} bytes is shorter than the message header")]
    TooShort(u64),
    #[error("got message type {0} instead of an introduction")]
    WrongType(u16),
    #[error("connection was already handed off or closed")]
    Closed,
    #[error("read error: {0}")]
    Io(#[from] std::io::Error),
}

enum Outgoing {
    Frame(Frame),
    /// Wakes a writer parked on an empty queue so it sees the stop flag.
    Wake,
}

struct Shared {
    address: String,
    stopped: AtomicBool,
    closed: CancellationToken,
    write_tx: mpsc::Sender<Outgoing>,
}

impl Shared {
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.closed.cancel();
        let _ = self.write_tx.try_send(Outgoing::Wake);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// One live socket with a reader and a writer task.
///
/// The stream is held here until [`start_handling`](ClientConnection::start_handling)
/// splits it between the two tasks. Outgoing frames go through a bounded
/// queue; the only state shared with the tasks is the stop flag, the queue
/// and a cancellation token standing in for closing the socket.
pub struct Connection {
    shared: Arc<Shared>,
    stream: Mutex<Option<BoxedStream>>,
    write_rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    runtime: Handle,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

impl Connection {
    /// Wraps an accepted stream. Must be called from within a Tokio runtime,
    /// which later hosts the reader and writer tasks.
    pub fn new(stream: impl AsyncStream, address: impl Into<String>) -> Self {
        Self::with_queue_capacity(stream, address, WRITE_QUEUE_SIZE)
    }

    pub fn with_queue_capacity(
        stream: impl AsyncStream,
        address: impl Into<String>,
        capacity: usize,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                address: address.into(),
                stopped: AtomicBool::new(false),
                closed: CancellationToken::new(),
                write_tx,
            }),
            stream: Mutex::new(Some(Box::new(stream))),
            write_rx: Mutex::new(Some(write_rx)),
            dispatcher: Mutex::new(None),
            runtime: Handle::current(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Reads the single introduction frame a client sends before anything
    /// else and returns its payload. Only valid before the connection starts.
    pub async fn read_introduction(&mut self) -> Result<Bytes, IntroductionError> {
        let stream = self
            .stream
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or(IntroductionError::Closed)?;
        tokio::time::timeout(INTRODUCTION_TIMEOUT, read_introduction_frame(stream))
            .await
            .map_err(|_| IntroductionError::Timeout(INTRODUCTION_TIMEOUT))?
    }

    fn close(&self) {
        self.shared.stop();
        // Not started yet: nobody else holds the stream.
        drop(take(&self.stream));
    }
}

impl ClientConnection for Connection {
    fn address(&self) -> &str {
        &self.shared.address
    }

    fn set_up(&self, dispatcher: Dispatcher) {
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
    }

    fn start_handling(&self) {
        let Some(stream) = take(&self.stream) else {
            debug!(address = %self.shared.address, "Connection closed before it started");
            return;
        };
        let Some(dispatcher) = take(&self.dispatcher) else {
            warn!(address = %self.shared.address, "Connection started without a delegate");
            self.shared.stop();
            return;
        };
        let Some(write_rx) = take(&self.write_rx) else {
            return;
        };

        let (reader, writer) = tokio::io::split(stream);
        self.runtime
            .spawn(read_loop(reader, dispatcher, self.shared.clone()));
        self.runtime
            .spawn(write_loop(writer, write_rx, self.shared.clone()));
    }

    fn send_message(&self, id: u64, kind: ServerMessageType, payload: Bytes) {
        if self.shared.is_stopped() {
            return;
        }
        match self
            .shared
            .write_tx
            .try_send(Outgoing::Frame(Frame::new(id, kind, payload)))
        {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(
                    address = %self.shared.address,
                    "Write queue is full, disconnecting slow client"
                );
                self.close();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn disconnect_and_stop(&self) {
        self.close();
    }
}

async fn read_introduction_frame(stream: &mut BoxedStream) -> Result<Bytes, IntroductionError> {
    let declared = stream.read_u64().await?;
    if declared > MAX_INTRODUCTION_SIZE {
        return Err(IntroductionError::TooLarge(declared));
    }
    let mut body = vec![0; declared as usize];
    stream.read_exact(&mut body).await?;

    let frame = Frame::from_body(body.into()).ok_or(IntroductionError::TooShort(declared))?;
    if frame.kind != u16::from(ClientMessageType::ClientIntroduction) {
        return Err(IntroductionError::WrongType(frame.kind));
    }
    Ok(frame.payload)
}

async fn read_loop(reader: ReadHalf<BoxedStream>, dispatcher: Dispatcher, shared: Arc<Shared>) {
    let mut frames =
        FramedRead::with_capacity(reader, MessageReassembler::new(), READ_BUFFER_SIZE);
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(frame)) => {
                debug!(
                    address = %shared.address,
                    id = frame.id,
                    kind = frame.kind,
                    "Received frame"
                );
                dispatcher.dispatch(frame).await;
            }
            Some(Err(FrameError::Oversized(declared))) => {
                warn!(
                    address = %shared.address,
                    declared,
                    "Peer declared an oversized frame, closing connection"
                );
                break;
            }
            Some(Err(FrameError::Io(e))) => {
                info!(address = %shared.address, "Client network error: {}", e);
                break;
            }
            None => {
                debug!(address = %shared.address, "Peer closed the connection");
                break;
            }
        }
    }
    shared.stop();
    dispatcher.disconnected().await;
}

async fn write_loop(
    writer: WriteHalf<BoxedStream>,
    mut queue: mpsc::Receiver<Outgoing>,
    shared: Arc<Shared>,
) {
    let mut sink = FramedWrite::new(writer, FrameEncoder);
    while !shared.is_stopped() {
        let Some(Outgoing::Frame(frame)) = queue.recv().await else {
            break;
        };
        let written = tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            written = sink.send(frame) => written,
        };
        if let Err(e) = written {
            debug!(address = %shared.address, "Write failed: {}", e);
            shared.stop();
            break;
        }
    }
    // Whatever is still queued is discarded without being sent.
    queue.close();
    while queue.try_recv().is_ok() {}
}
