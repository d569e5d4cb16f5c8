//! Newline-delimited JSON framing for the yues pipes.
//!
//! Each record is a single line of compact JSON terminated by `\n`:
//!
//! ```text
//! {"type":"CREATE","id":"5f0c…","body":"return 1+1","args":[]}\n
//! ```
//!
//! Read events on a pipe are not aligned with record boundaries, so the
//! decoder keeps the trailing partial line between calls and only hands out
//! complete lines. Empty lines are skipped and a trailing `\r` is tolerated.

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{BridgeError, Result};
use crate::protocol::ServerMessage;

/// Maximum buffered line size (100MB) to prevent OOM from a runaway server.
pub const MAX_LINE_SIZE: usize = 100 * 1024 * 1024;

/// Serialize a record into one newline-terminated line.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)
        .map_err(|e| BridgeError::Protocol(format!("Failed to serialize message: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Parse one complete line into a server record.
///
/// # Errors
///
/// Returns `BridgeError::Protocol` if the line is not valid UTF-8, not valid
/// JSON, or carries an unknown `type` discriminant.
pub fn decode_line(line: &[u8]) -> Result<ServerMessage> {
    let text = std::str::from_utf8(line)
        .map_err(|e| BridgeError::Protocol(format!("Line is not valid UTF-8: {}", e)))?;
    serde_json::from_str(text)
        .map_err(|e| BridgeError::Protocol(format!("Failed to parse message {:?}: {}", text, e)))
}

/// Write one record to the stream and flush it.
///
/// # Errors
///
/// Returns `BridgeError::Transport` if the write or flush fails (typically a
/// broken pipe after the server died).
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let line = encode_line(message)?;

    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to write message: {}", e)))?;

    writer
        .flush()
        .await
        .map_err(|e| BridgeError::Transport(format!("Failed to flush message: {}", e)))?;

    Ok(())
}

/// Splits a byte stream into complete lines, carrying partial lines over.
#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Protocol` if the pending partial line grows past
    /// `MAX_LINE_SIZE`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            let line = std::mem::take(&mut self.partial);
            if let Some(line) = Self::trim(line) {
                lines.push(line);
            }
        }

        self.partial.extend_from_slice(rest);
        if self.partial.len() > MAX_LINE_SIZE {
            return Err(BridgeError::Protocol(format!(
                "Line exceeds maximum {} bytes",
                MAX_LINE_SIZE
            )));
        }

        Ok(lines)
    }

    /// Take the unterminated trailing fragment at end of stream, if any.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        Self::trim(std::mem::take(&mut self.partial))
    }

    /// Number of bytes waiting for a line terminator.
    pub fn pending_len(&self) -> usize {
        self.partial.len()
    }

    fn trim(mut line: Vec<u8>) -> Option<Vec<u8>> {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            None
        } else {
            Some(line)
        }
    }
}
