//! Messaging interface multiplexing requests and notifications over the pipes.
//!
//! This module provides `MessagingInterface`, which owns the two stream
//! handles, a reader task that frames and dispatches inbound records, and the
//! correlation table that routes each `*_R` result to the caller waiting on
//! it.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::fifo;
use crate::ipc::framing::{decode_line, write_message, LineDecoder};
use crate::protocol::{
    ClientMessage, CorrelationKey, FunctionHandle, Inbound, Request, Response,
};

/// Size of a single read from the outbound pipe.
const READ_CHUNK_SIZE: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Value>>;

/// Callback invoked for every `POSTMESSAGE` value, inside the read loop.
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Token returned by `on_notification`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// Connection state as seen by the reader task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Ready,
    Closed,
}

// =============================================================================
// Correlation Table
// =============================================================================

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<CorrelationKey, Waiter>,
    /// Set once the session has failed or been closed.
    closed: Option<String>,
}

/// State shared between the interface handle and its reader task.
struct Shared {
    pending: Mutex<PendingTable>,
    subscribers: Mutex<Vec<(Subscription, NotificationHandler)>>,
    next_subscription: AtomicU64,
    link: watch::Sender<LinkState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new() -> Self {
        let (link, _) = watch::channel(LinkState::Connecting);
        Self {
            pending: Mutex::new(PendingTable::default()),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            link,
        }
    }

    fn register(&self, key: CorrelationKey) -> Result<oneshot::Receiver<Result<Value>>> {
        let mut pending = lock(&self.pending);
        if let Some(reason) = &pending.closed {
            return Err(BridgeError::Transport(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        pending.waiters.insert(key, tx);
        Ok(rx)
    }

    fn forget(&self, key: &CorrelationKey) {
        lock(&self.pending).waiters.remove(key);
    }

    fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Mark the session dead and reject every outstanding waiter once.
    fn fail(&self, error: BridgeError) {
        let drained: Vec<Waiter> = {
            let mut pending = lock(&self.pending);
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(error.to_string());
            pending.waiters.drain().map(|(_, waiter)| waiter).collect()
        };

        if !drained.is_empty() {
            warn!("Rejecting {} pending request(s): {}", drained.len(), error);
        }
        for waiter in drained {
            let _ = waiter.send(Err(error.duplicate()));
        }
        self.link.send_replace(LinkState::Closed);
    }

    fn dispatch(&self, inbound: Inbound) {
        match inbound {
            Inbound::Ready => {
                let first = self.link.send_if_modified(|state| {
                    if *state == LinkState::Connecting {
                        *state = LinkState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if first {
                    info!("Server signalled readiness");
                } else {
                    debug!("Ignoring repeated INIT");
                }
            }
            Inbound::Notification(value) => {
                let handlers: Vec<NotificationHandler> = lock(&self.subscribers)
                    .iter()
                    .map(|(_, handler)| Arc::clone(handler))
                    .collect();
                for handler in handlers {
                    handler(&value);
                }
            }
            Inbound::Response(Response { key, outcome }) => {
                let waiter = lock(&self.pending).waiters.remove(&key);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(outcome.into_result());
                    }
                    None => warn!("Dropping response with no pending request: {}", key),
                }
            }
        }
    }
}

// =============================================================================
// Reader Task
// =============================================================================

fn feed(decoder: &mut LineDecoder, chunk: &[u8], shared: &Shared) -> Result<()> {
    for line in decoder.push(chunk)? {
        shared.dispatch(decode_line(&line)?.into());
    }
    Ok(())
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut decoder = LineDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let error = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                if let Some(line) = decoder.finish() {
                    match decode_line(&line) {
                        Ok(message) => shared.dispatch(message.into()),
                        Err(e) => break e,
                    }
                }
                break BridgeError::Transport("Server closed the output stream".to_string());
            }
            Ok(n) => {
                if let Err(e) = feed(&mut decoder, &chunk[..n], &shared) {
                    break e;
                }
            }
            Err(e) => {
                break BridgeError::Transport(format!("Failed to read from server: {}", e));
            }
        }
    };

    info!("Messaging session ended: {}", error);
    shared.fail(error);
}

// =============================================================================
// Messaging Interface
// =============================================================================

/// Request/response multiplexer over one inbound and one outbound stream.
///
/// Requests may be issued concurrently from any task; the correlation key
/// `(result kind, id)` routes each response back to its caller regardless of
/// arrival order. Notifications are fanned out to every subscriber in arrival
/// order.
///
/// # Example
///
/// ```ignore
/// let messaging = MessagingInterface::open(&in_fifo, &out_fifo).await?;
/// messaging.await_ready().await?;
/// let two = messaging.iife("return 1 + 1", &[], vec![]).await?;
/// ```
pub struct MessagingInterface {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MessagingInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingInterface")
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_requests())
            .finish()
    }
}

impl MessagingInterface {
    /// Build an interface over arbitrary streams and start the reader task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared::new());
        let task = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            reader_task: Mutex::new(Some(task)),
        }
    }

    /// Open both FIFOs and build an interface over them.
    ///
    /// `inbound` is the pipe the server reads requests from, `outbound` the
    /// pipe it writes results to. Completes once the server has opened its
    /// ends of both pipes.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Transport` if either FIFO cannot be opened.
    pub async fn open(inbound: &Path, outbound: &Path) -> Result<Self> {
        let (sender, receiver) = fifo::open_pair(inbound, outbound).await?;
        debug!(
            "Opened pipes {} (requests) and {} (results)",
            inbound.display(),
            outbound.display()
        );
        Ok(Self::from_streams(receiver, sender))
    }

    /// Wait until the server has sent `INIT`.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Transport` if the session ends before `INIT`,
    /// or has already ended by the time readiness is observed.
    pub async fn await_ready(&self) -> Result<()> {
        let mut rx = self.shared.link.subscribe();
        let state = *rx
            .wait_for(|state| *state != LinkState::Connecting)
            .await
            .map_err(|_| BridgeError::Transport("Messaging interface dropped".to_string()))?;

        if let Some(reason) = &lock(&self.shared.pending).closed {
            return Err(BridgeError::Transport(reason.clone()));
        }
        match state {
            LinkState::Ready => Ok(()),
            _ => Err(BridgeError::Transport(
                "Session ended before the server signalled readiness".to_string(),
            )),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.link.borrow() == LinkState::Ready
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.pending).closed.is_some()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending_count()
    }

    /// Send a request and wait for its correlated result.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Application` if the server answered with `err`
    /// - `BridgeError::Transport` if the session failed or was closed before
    ///   the response arrived
    pub async fn request(&self, request: Request) -> Result<Value> {
        let message = request.into_message(Uuid::new_v4().to_string());
        let key = CorrelationKey {
            kind: message.response_kind(),
            id: message.id().to_string(),
        };

        let rx = self.shared.register(key.clone())?;
        if let Err(e) = self.send(&message).await {
            self.shared.forget(&key);
            return Err(e);
        }

        rx.await.map_err(|_| {
            BridgeError::Transport(format!("Response channel for {} dropped", key))
        })?
    }

    async fn send(&self, message: &ClientMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Transport("Messaging interface is closed".to_string()))?;

        if let Err(e) = write_message(writer, message).await {
            guard.take();
            self.shared.fail(e.duplicate());
            return Err(e);
        }
        Ok(())
    }

    /// Register `body` as a server function taking `args`.
    pub async fn create_function(&self, body: &str, args: &[String]) -> Result<FunctionHandle> {
        let value = self
            .request(Request::CreateFunction {
                body: body.to_string(),
                args: args.to_vec(),
            })
            .await?;
        serde_json::from_value(value)
            .map_err(|e| BridgeError::Protocol(format!("Invalid function handle: {}", e)))
    }

    pub async fn call_function(&self, function: &FunctionHandle, args: Vec<Value>) -> Result<Value> {
        self.request(Request::CallFunction {
            function: function.clone(),
            args,
        })
        .await
    }

    pub async fn remove_function(&self, function: &FunctionHandle) -> Result<()> {
        self.request(Request::RemoveFunction {
            function: function.clone(),
        })
        .await
        .map(|_| ())
    }

    /// Evaluate `body` once with `args` bound to `arg_names`.
    pub async fn iife(&self, body: &str, arg_names: &[String], args: Vec<Value>) -> Result<Value> {
        self.request(Request::Iife {
            body: body.to_string(),
            arg_names: arg_names.to_vec(),
            args,
        })
        .await
    }

    /// Subscribe to `POSTMESSAGE` values.
    ///
    /// The handler runs on the reader task and must not block.
    pub fn on_notification<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.subscribers).push((subscription, Arc::new(handler)));
        debug!("Added notification subscriber {:?}", subscription);
        subscription
    }

    /// Unsubscribe; returns false if the subscription was unknown.
    pub fn remove_notification(&self, subscription: Subscription) -> bool {
        let mut subscribers = lock(&self.shared.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription);
        before != subscribers.len()
    }

    /// Stop reading, drop both stream handles and reject pending requests.
    ///
    /// Pending writes are not flushed. Calling this again is a no-op.
    pub async fn close(&self) {
        let task = lock(&self.reader_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.writer.lock().await.take();
        self.shared
            .fail(BridgeError::Transport("Messaging interface closed".to_string()));
    }
}

impl Drop for MessagingInterface {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reader_task).take() {
            task.abort();
        }
    }
}
