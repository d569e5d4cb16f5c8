//! Named pipe allocation, creation, opening and removal.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tokio::net::unix::pipe;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BridgeError, Result};

/// Attempts at finding an unused pipe name before giving up.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Directory where session pipes are created.
///
/// Resolution order:
/// 1. `$XDG_RUNTIME_DIR` (per-user, Linux)
/// 2. The system temporary directory
pub fn default_pipe_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Pick a pipe path under `dir` that does not exist yet.
///
/// # Errors
///
/// Returns `BridgeError::Io` with `AlreadyExists` if every candidate name was
/// taken.
pub fn allocate_unique_pipe_path(dir: &Path, suffix: &str) -> Result<PathBuf> {
    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let candidate = dir.join(format!("yues-{}.{}", Uuid::new_v4().simple(), suffix));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(BridgeError::Io(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("No unused pipe name found in {}", dir.display()),
    )))
}

/// Create a FIFO readable and writable by the current user only.
pub fn create_fifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .map_err(|errno| BridgeError::Io(io::Error::from(errno)))?;
    debug!("Created FIFO {}", path.display());
    Ok(())
}

/// Delete a pipe file; a missing file is not an error.
pub async fn remove_pipe(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed FIFO {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BridgeError::Io(e)),
    }
}

/// The two FIFOs backing one server session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePair {
    /// Requests flow client → server through this pipe.
    pub inbound: PathBuf,
    /// Results and notifications flow server → client through this pipe.
    pub outbound: PathBuf,
}

impl PipePair {
    /// Allocate and create both FIFOs under `dir`.
    ///
    /// If the second FIFO cannot be created the first one is removed again.
    pub fn create(dir: &Path) -> Result<Self> {
        let inbound = allocate_unique_pipe_path(dir, "in")?;
        create_fifo(&inbound)?;

        let outbound = match allocate_unique_pipe_path(dir, "out").and_then(|path| {
            create_fifo(&path)?;
            Ok(path)
        }) {
            Ok(path) => path,
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_file(&inbound) {
                    warn!("Failed to remove {}: {}", inbound.display(), cleanup);
                }
                return Err(e);
            }
        };

        Ok(Self { inbound, outbound })
    }

    /// Wake any thread still blocked opening either pipe.
    ///
    /// A blocking FIFO open only returns once the other end is opened. When
    /// the server dies before opening its ends, opening each pipe read-write
    /// here satisfies the waiting open so its thread can finish.
    pub fn release_blocked_opens(&self) {
        for path in [&self.inbound, &self.outbound] {
            let opened = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(OFlag::O_NONBLOCK.bits())
                .open(path);
            if let Err(e) = opened {
                debug!("Could not open {} to release waiters: {}", path.display(), e);
            }
        }
    }

    /// Delete both FIFOs.
    pub async fn remove(&self) -> Result<()> {
        let (a, b) = tokio::join!(remove_pipe(&self.inbound), remove_pipe(&self.outbound));
        a.and(b)
    }

    pub fn exists(&self) -> bool {
        self.inbound.exists() || self.outbound.exists()
    }
}

async fn open_blocking<F>(path: &Path, open: F) -> Result<File>
where
    F: FnOnce(&Path) -> io::Result<File> + Send + 'static,
{
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || open(&owned))
        .await
        .map_err(|e| BridgeError::Transport(format!("Pipe open task failed: {}", e)))?
        .map_err(|e| BridgeError::Transport(format!("Failed to open {}: {}", path.display(), e)))
}

/// Open the client ends of a session's pipes.
///
/// Both opens run concurrently on blocking threads, so the server may open
/// its ends in either order. Returns the request sender and result receiver.
///
/// # Errors
///
/// Returns `BridgeError::Transport` if either path cannot be opened or is not
/// a FIFO.
pub async fn open_pair(inbound: &Path, outbound: &Path) -> Result<(pipe::Sender, pipe::Receiver)> {
    let (write_end, read_end) = tokio::try_join!(
        open_blocking(inbound, |path| OpenOptions::new().write(true).open(path)),
        open_blocking(outbound, |path| File::open(path)),
    )?;

    let sender = pipe::Sender::from_file(write_end)
        .map_err(|e| BridgeError::Transport(format!("{} is not a writable FIFO: {}", inbound.display(), e)))?;
    let receiver = pipe::Receiver::from_file(read_end)
        .map_err(|e| BridgeError::Transport(format!("{} is not a readable FIFO: {}", outbound.display(), e)))?;

    Ok((sender, receiver))
}
