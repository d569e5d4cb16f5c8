//! Proxy for a function body registered on the server.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::ipc::MessagingInterface;
use crate::protocol::FunctionHandle;

/// Outcome of the single registration attempt, shared with the task making it.
struct Registration {
    /// Errors are kept as text.
    outcome: OnceLock<std::result::Result<FunctionHandle, String>>,
    done: watch::Sender<bool>,
}

impl Registration {
    fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            outcome: OnceLock::new(),
            done,
        }
    }

    fn finish(&self, outcome: std::result::Result<FunctionHandle, String>) {
        let _ = self.outcome.set(outcome);
        self.done.send_replace(true);
    }

    async fn wait(&self) -> Option<&std::result::Result<FunctionHandle, String>> {
        let mut done = self.done.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = done.wait_for(|finished| *finished).await;
        self.outcome.get()
    }
}

/// A server-side function reachable through a [`MessagingInterface`].
///
/// Registration (`CREATE`) happens lazily on the first [`ready`](Self::ready)
/// or [`invoke`](Self::invoke). It runs on its own task and is shared by all
/// callers, so at most one `CREATE` is ever sent, even when the caller that
/// triggered it gives up waiting. After [`dispose`](Self::dispose) the handle
/// is gone and invoking fails locally.
///
/// # Example
///
/// ```ignore
/// let add = RemoteFunction::new(messaging, "return a + b", vec!["a".into(), "b".into()]);
/// let three = add.invoke(vec![json!(1), json!(2)]).await?;
/// add.dispose().await?;
/// ```
pub struct RemoteFunction {
    messaging: Arc<MessagingInterface>,
    body: String,
    args: Vec<String>,
    registration: Arc<Registration>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl RemoteFunction {
    pub fn new(messaging: Arc<MessagingInterface>, body: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            messaging,
            body: body.into(),
            args,
            registration: Arc::new(Registration::new()),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Server handle, once registration has succeeded.
    pub fn handle(&self) -> Option<&FunctionHandle> {
        self.registration.outcome.get().and_then(|outcome| outcome.as_ref().ok())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Register the function if needed and return its handle.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Initialization` with the server's reason if
    /// registration failed, or if the function was disposed. The failure is
    /// memoized; registration is not retried.
    pub async fn ready(&self) -> Result<&FunctionHandle> {
        self.ensure_live()?;
        if !self.started.swap(true, Ordering::SeqCst) {
            self.register();
        }

        match self.registration.wait().await {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(reason)) => Err(BridgeError::Initialization(format!(
                "Remote function was not initialized: {}",
                reason
            ))),
            None => Err(BridgeError::Initialization(
                "Remote function registration was abandoned".to_string(),
            )),
        }
    }

    /// Send the `CREATE` on a detached task.
    fn register(&self) {
        let messaging = Arc::clone(&self.messaging);
        let registration = Arc::clone(&self.registration);
        let body = self.body.clone();
        let args = self.args.clone();

        tokio::spawn(async move {
            debug!("Registering remote function ({})", args.join(", "));
            let outcome = messaging
                .create_function(&body, &args)
                .await
                .map_err(|e| e.to_string());
            registration.finish(outcome);
        });
    }

    /// Call the function with positional `args`.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Initialization` if registration failed or the function
    ///   was disposed (no request is sent)
    /// - `BridgeError::Application` if the server reported an error
    pub async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let handle = self.ready().await?;
        self.ensure_live()?;
        self.messaging.call_function(handle, args).await
    }

    /// Remove the function from the server.
    ///
    /// Only the first call has any effect. A function whose registration
    /// never started, or failed, is disposed without contacting the server.
    /// A registration still in flight is awaited first.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            self.registration
                .finish(Err("disposed before registration".to_string()));
            return Ok(());
        }

        match self.registration.wait().await {
            Some(Ok(handle)) => {
                debug!("Removing remote function {}", handle);
                self.messaging.remove_function(handle).await
            }
            _ => Ok(()),
        }
    }

    /// Source rendering of the function; purely local.
    pub fn describe(&self) -> String {
        format!("function ({})\n{}\nend", self.args.join(", "), self.body)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::Initialization(
                "Remote function was disposed".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl fmt::Debug for RemoteFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFunction")
            .field("args", &self.args)
            .field("handle", &self.handle())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
