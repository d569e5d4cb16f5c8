//! Lifecycle of a yues server child process.
//!
//! A [`Server`] moves forward through
//! `Uninitialized → Starting → Running → Terminating → Terminated`:
//!
//! 1. `start()` creates two FIFOs, spawns `program [args..] <in> <out>`,
//!    opens the messaging interface over the same FIFOs and waits for `INIT`.
//! 2. `exec()`, `create_function()` and the notification methods talk to the
//!    running server.
//! 3. `shutdown()` asks the server to quit, escalates through signals when it
//!    does not, then closes the interface and deletes the FIFOs.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ServerConfig, ShutdownAction, ShutdownPolicy, ShutdownTier};
use crate::error::{BridgeError, Result};
use crate::fifo::PipePair;
use crate::ipc::{MessagingInterface, Subscription};
use crate::remote_func::RemoteFunction;

/// Session state; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Uninitialized,
    /// `start()` is in progress; `INIT` has not arrived yet.
    Starting,
    Running,
    Terminating,
    Terminated,
}

/// Which step of the shutdown made the child exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppedBy {
    /// The child exited while tier `n` (zero-based) was waiting.
    Tier(usize, ShutdownAction),
    /// The final SIGKILL was needed.
    Kill,
}

/// Result of a completed shutdown.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOutcome {
    pub stopped_by: StoppedBy,
    pub status: ExitStatus,
    pub elapsed: Duration,
}

/// Resources owned by a running session.
struct Session {
    pipes: PipePair,
    child: Child,
    messaging: Arc<MessagingInterface>,
}

/// Owner of one server child process and its pipes.
///
/// # Example
///
/// ```ignore
/// let server = Server::new(ServerConfig::from_env());
/// server.start().await?;
/// let answer = server.exec("return 6 * 7", &[], vec![]).await?;
/// server.shutdown().await?;
/// ```
pub struct Server {
    config: ServerConfig,
    state: Mutex<ServerState>,
    session: tokio::sync::Mutex<Option<Session>>,
    /// Kept outside `session` so requests never wait on the lifecycle lock.
    messaging: Mutex<Option<Arc<MessagingInterface>>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ServerState::Uninitialized),
            session: tokio::sync::Mutex::new(None),
            messaging: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Move from `from` to `to`, failing if the session is elsewhere.
    fn transition(&self, from: ServerState, to: ServerState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if *state != from {
            return Err(BridgeError::Lifecycle(format!(
                "Cannot move from {:?} to {:?}: server is {:?}",
                from, to, *state
            )));
        }
        debug!("Server state {:?} -> {:?}", from, to);
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: ServerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    /// Messaging interface of a running session.
    fn running(&self) -> Result<Arc<MessagingInterface>> {
        let state = self.state();
        if state != ServerState::Running {
            return Err(BridgeError::Lifecycle(format!(
                "Server is not running (state: {:?})",
                state
            )));
        }
        self.messaging
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| BridgeError::Lifecycle("Server has no messaging interface".to_string()))
    }

    /// Paths of the session FIFOs while the server is running.
    pub async fn pipe_paths(&self) -> Option<PipePair> {
        self.session.lock().await.as_ref().map(|s| s.pipes.clone())
    }

    /// OS process id of the child, if it has not been reaped.
    pub async fn pid(&self) -> Option<u32> {
        self.session.lock().await.as_ref().and_then(|s| s.child.id())
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Spawn the server and wait until it signals readiness.
    ///
    /// # Errors
    ///
    /// - `BridgeError::Lifecycle` if the server was already started, could
    ///   not be spawned, exited during startup, or missed the startup timeout
    /// - `BridgeError::Io` if the FIFOs could not be created
    /// - `BridgeError::Transport` if the pipes could not be opened
    ///
    /// On any failure the child is killed, the FIFOs are removed and the
    /// server ends up `Terminated`.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.session.lock().await;
        self.transition(ServerState::Uninitialized, ServerState::Starting)?;

        let pipes = match PipePair::create(&self.config.pipe_dir) {
            Ok(pipes) => pipes,
            Err(e) => {
                self.set_state(ServerState::Terminated);
                return Err(e);
            }
        };

        info!(
            "Starting server {:?} with pipes {} / {}",
            self.config.program,
            pipes.inbound.display(),
            pipes.outbound.display()
        );

        let mut child = match self.spawn(&pipes) {
            Ok(child) => child,
            Err(e) => {
                self.abort_startup(&pipes, None, None).await;
                return Err(e);
            }
        };

        match self.connect(&pipes, &mut child).await {
            Ok(messaging) => {
                let messaging = Arc::new(messaging);
                *self.messaging.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::clone(&messaging));
                *slot = Some(Session {
                    pipes,
                    child,
                    messaging,
                });
                self.set_state(ServerState::Running);
                info!("Server ready");
                Ok(())
            }
            Err((e, messaging)) => {
                error!("Server startup failed: {}", e);
                self.abort_startup(&pipes, Some(child), messaging).await;
                Err(e)
            }
        }
    }

    fn spawn(&self, pipes: &PipePair) -> Result<Child> {
        Command::new(&self.config.program)
            .args(&self.config.args)
            .arg(&pipes.inbound)
            .arg(&pipes.outbound)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Lifecycle(format!(
                    "Failed to spawn {:?}: {}",
                    self.config.program, e
                ))
            })
    }

    /// Open the pipes and wait for `INIT`, racing the child's exit and the
    /// startup timeout. On failure the interface, if it got that far, is
    /// handed back for cleanup.
    async fn connect(
        &self,
        pipes: &PipePair,
        child: &mut Child,
    ) -> std::result::Result<MessagingInterface, (BridgeError, Option<MessagingInterface>)> {
        let deadline = self.config.startup_timeout.map(|t| Instant::now() + t);

        let opened = tokio::select! {
            opened = MessagingInterface::open(&pipes.inbound, &pipes.outbound) => opened,
            status = child.wait() => Err(exited_early(status)),
            _ = sleep_until(deadline) => Err(startup_timed_out(self.config.startup_timeout)),
        };
        let messaging = opened.map_err(|e| (e, None))?;

        let ready = tokio::select! {
            ready = messaging.await_ready() => ready,
            status = child.wait() => Err(exited_early(status)),
            _ = sleep_until(deadline) => Err(startup_timed_out(self.config.startup_timeout)),
        };
        match ready {
            Ok(()) => Ok(messaging),
            Err(e) => Err((e, Some(messaging))),
        }
    }

    async fn abort_startup(
        &self,
        pipes: &PipePair,
        child: Option<Child>,
        messaging: Option<MessagingInterface>,
    ) {
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!("Kill during startup cleanup failed: {}", e);
            }
            let _ = child.wait().await;
        }
        match messaging {
            Some(messaging) => messaging.close().await,
            None => pipes.release_blocked_opens(),
        }
        if let Err(e) = pipes.remove().await {
            warn!("Failed to remove pipes after startup failure: {}", e);
        }
        self.set_state(ServerState::Terminated);
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Evaluate `body` once on the server with `args` bound to `arg_names`.
    ///
    /// # Errors
    ///
    /// `BridgeError::Lifecycle` if the server is not running, otherwise the
    /// errors of [`MessagingInterface::iife`].
    pub async fn exec(&self, body: &str, arg_names: &[String], args: Vec<Value>) -> Result<Value> {
        self.running()?.iife(body, arg_names, args).await
    }

    /// Register a function and return its proxy once it is ready.
    ///
    /// # Errors
    ///
    /// `BridgeError::Lifecycle` if the server is not running;
    /// `BridgeError::Initialization` if the server rejected the function.
    pub async fn create_function(&self, body: &str, args: &[String]) -> Result<RemoteFunction> {
        let function = RemoteFunction::new(self.running()?, body, args.to_vec());
        function.ready().await?;
        Ok(function)
    }

    pub fn on_notification<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Ok(self.running()?.on_notification(handler))
    }

    pub fn remove_notification(&self, subscription: Subscription) -> Result<bool> {
        Ok(self.running()?.remove_notification(subscription))
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop the server using the configured escalation policy.
    pub async fn shutdown(&self) -> Result<Option<ShutdownOutcome>> {
        self.shutdown_with(&self.config.shutdown.tiers).await
    }

    /// Stop the server within `total`: quit request and SIGTERM each get half.
    pub async fn shutdown_with_timeout(&self, total: Duration) -> Result<Option<ShutdownOutcome>> {
        let policy = ShutdownPolicy::split(total);
        self.shutdown_with(&policy.tiers).await
    }

    /// Run the escalation tiers, then SIGKILL, then release the pipes.
    ///
    /// Returns `Ok(None)` if the server was already terminated.
    ///
    /// # Errors
    ///
    /// `BridgeError::Lifecycle` if the server was never started or another
    /// shutdown is in progress. Removal failures of the FIFOs surface as
    /// `BridgeError::Io` after the child is gone.
    async fn shutdown_with(
        &self,
        tiers: &[ShutdownTier],
    ) -> Result<Option<ShutdownOutcome>> {
        if self.state() == ServerState::Terminated {
            return Ok(None);
        }
        let mut slot = self.session.lock().await;
        if self.state() == ServerState::Terminated {
            return Ok(None);
        }
        self.transition(ServerState::Running, ServerState::Terminating)?;

        let Some(mut session) = slot.take() else {
            self.set_state(ServerState::Terminated);
            return Ok(None);
        };

        let started = Instant::now();
        let escalation = self.escalate(&mut session, tiers).await;
        let elapsed = started.elapsed();

        // The child is gone (or unreapable); nothing more is written to the pipes.
        session.messaging.close().await;
        self.messaging.lock().unwrap_or_else(|p| p.into_inner()).take();
        let removed = session.pipes.remove().await;
        self.set_state(ServerState::Terminated);

        let (stopped_by, status) = escalation?;
        removed?;
        info!("Server exited ({}) after {:?} via {:?}", status, elapsed, stopped_by);

        Ok(Some(ShutdownOutcome {
            stopped_by,
            status,
            elapsed,
        }))
    }

    async fn escalate(
        &self,
        session: &mut Session,
        tiers: &[ShutdownTier],
    ) -> Result<(StoppedBy, ExitStatus)> {
        for (index, tier) in tiers.iter().enumerate() {
            match tier.action {
                ShutdownAction::Quit => self.request_quit(&session.messaging),
                ShutdownAction::Signal(signal) => signal_child(&session.child, signal),
            }
            match timeout(tier.timeout, session.child.wait()).await {
                Ok(Ok(status)) => return Ok((StoppedBy::Tier(index, tier.action), status)),
                Ok(Err(e)) => {
                    warn!("Waiting for server exit failed: {}", e);
                    break;
                }
                Err(_) => debug!("Server still running after {:?} ({:?})", tier.timeout, tier.action),
            }
        }

        warn!("Server did not exit, sending SIGKILL");
        if let Err(e) = session.child.start_kill() {
            debug!("SIGKILL delivery failed: {}", e);
        }
        let status = session.child.wait().await.map_err(|e| {
            BridgeError::Lifecycle(format!("Failed to reap server process: {}", e))
        })?;
        Ok((StoppedBy::Kill, status))
    }

    /// Send the quit script without waiting for its result.
    fn request_quit(&self, messaging: &Arc<MessagingInterface>) {
        let messaging = Arc::clone(messaging);
        let script = self.config.quit_script.clone();
        tokio::spawn(async move {
            match messaging.iife(&script, &[], Vec::new()).await {
                Ok(_) => debug!("Quit request acknowledged"),
                Err(e) => debug!("Quit request ended: {}", e),
            }
        });
    }
}

fn signal_child(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    debug!("Sending {} to server process {}", signal, pid);
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        warn!("Failed to send {} to {}: {}", signal, pid, e);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn exited_early(status: std::io::Result<ExitStatus>) -> BridgeError {
    match status {
        Ok(status) => BridgeError::Lifecycle(format!("Server exited during startup ({})", status)),
        Err(e) => BridgeError::Lifecycle(format!("Failed to wait for server: {}", e)),
    }
}

fn startup_timed_out(limit: Option<Duration>) -> BridgeError {
    BridgeError::Lifecycle(format!(
        "Server did not become ready within {:?}",
        limit.unwrap_or_default()
    ))
}
