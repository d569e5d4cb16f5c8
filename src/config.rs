//! Session configuration.
//!
//! Defaults suit a `yues` binary on `PATH`; every field can be overridden
//! through the builder methods, and the common ones through environment
//! variables via [`ServerConfig::from_env`].

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::fifo::default_pipe_dir;

/// Default server executable.
pub const DEFAULT_PROGRAM: &str = "yues";

/// Default time allowed for the server to open its pipes and send `INIT`.
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Default total budget for the escalating shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5000;

/// Script evaluated to ask the server to leave its message loop.
pub const DEFAULT_QUIT_SCRIPT: &str = "gui.MessageLoop.quit()";

/// What a shutdown tier does before waiting for the child to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownAction {
    /// Evaluate the quit script without waiting for its result.
    Quit,
    /// Deliver a signal to the child.
    Signal(Signal),
}

/// One escalation step: act, then wait up to `timeout` for the child to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownTier {
    pub action: ShutdownAction,
    pub timeout: Duration,
}

/// Ordered escalation tiers tried before the final SIGKILL.
///
/// After the last tier times out the child is killed and awaited with no
/// further timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub tiers: Vec<ShutdownTier>,
}

impl ShutdownPolicy {
    /// Quit request then SIGTERM, each given half of `total`.
    pub fn split(total: Duration) -> Self {
        let half = total / 2;
        Self {
            tiers: vec![
                ShutdownTier {
                    action: ShutdownAction::Quit,
                    timeout: half,
                },
                ShutdownTier {
                    action: ShutdownAction::Signal(Signal::SIGTERM),
                    timeout: half,
                },
            ],
        }
    }

    /// Sum of the tier timeouts; the bound on shutdown before SIGKILL.
    pub fn budget(&self) -> Duration {
        self.tiers.iter().map(|tier| tier.timeout).sum()
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::split(Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS))
    }
}

/// How to launch and stop a server session.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Executable to spawn.
    pub program: OsString,
    /// Arguments placed before the two pipe paths.
    pub args: Vec<OsString>,
    /// Directory the FIFOs are created in.
    pub pipe_dir: PathBuf,
    /// Limit on pipe opening plus `INIT`; `None` waits forever.
    pub startup_timeout: Option<Duration>,
    pub shutdown: ShutdownPolicy,
    pub quit_script: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            program: OsString::from(DEFAULT_PROGRAM),
            args: Vec::new(),
            pipe_dir: default_pipe_dir(),
            startup_timeout: Some(Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS)),
            shutdown: ShutdownPolicy::default(),
            quit_script: DEFAULT_QUIT_SCRIPT.to_string(),
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", name, raw, e);
            None
        }
    }
}

impl ServerConfig {
    /// Defaults with environment overrides applied.
    ///
    /// - `YUES_BIN` - server executable
    /// - `YUES_PIPE_DIR` - directory for the FIFOs
    /// - `YUES_STARTUP_TIMEOUT_MS` - startup limit (`0` disables it)
    /// - `YUES_SHUTDOWN_TIMEOUT_MS` - total shutdown budget
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(program) = std::env::var_os("YUES_BIN") {
            info!("Using server from YUES_BIN: {:?}", program);
            config.program = program;
        }
        if let Some(dir) = std::env::var_os("YUES_PIPE_DIR") {
            config.pipe_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = env_millis("YUES_STARTUP_TIMEOUT_MS") {
            config.startup_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(timeout) = env_millis("YUES_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown = ShutdownPolicy::split(timeout);
        }

        config
    }

    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pipe_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipe_dir = dir.into();
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.shutdown = policy;
        self
    }

    pub fn with_quit_script(mut self, script: impl Into<String>) -> Self {
        self.quit_script = script.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_policy_halves_budget() {
        let policy = ShutdownPolicy::split(Duration::from_millis(1000));
        assert_eq!(
            policy.tiers,
            vec![
                ShutdownTier {
                    action: ShutdownAction::Quit,
                    timeout: Duration::from_millis(500),
                },
                ShutdownTier {
                    action: ShutdownAction::Signal(Signal::SIGTERM),
                    timeout: Duration::from_millis(500),
                },
            ]
        );
        assert_eq!(policy.budget(), Duration::from_millis(1000));
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.program, OsString::from("yues"));
        assert!(config.args.is_empty());
        assert_eq!(config.quit_script, "gui.MessageLoop.quit()");
        assert_eq!(config.shutdown.budget(), Duration::from_secs(5));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServerConfig::default()
            .with_program("/bin/sh")
            .with_args(["-c", "exit 0", "sh"])
            .with_pipe_dir("/tmp/pipes")
            .with_startup_timeout(None)
            .with_quit_script("os.exit()");

        assert_eq!(config.program, OsString::from("/bin/sh"));
        assert_eq!(config.args.len(), 3);
        assert_eq!(config.pipe_dir, PathBuf::from("/tmp/pipes"));
        assert_eq!(config.startup_timeout, None);
        assert_eq!(config.quit_script, "os.exit()");
    }
}
