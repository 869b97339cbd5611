//! Output Capture and Channel Separation
//!
//! Each child stream is drained into a [`BoundedBuffer`] that keeps at most
//! `limit` bytes and keeps reading (and discarding) past it so the child
//! never blocks on a full pipe. Buffers are shared handles: if a reader has
//! to be aborted, whatever it already captured is still available.
//!
//! [`demultiplex`] turns raw stdout/stderr into the protocol and diagnostic
//! channels. In protocol mode only well-formed JSON reaches the protocol
//! channel; everything else is moved to diagnostics.

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Prefix for stdout lines moved to the diagnostic channel
pub const REDIRECTED_PREFIX: &str = "[redirected] ";

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Default)]
struct BufferState {
    data: Vec<u8>,
    seen: usize,
    truncated: bool,
}

/// Shared byte buffer with a hard size limit
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
    state: Arc<Mutex<BufferState>>,
    limit: usize,
}

/// Captured bytes of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub data: Vec<u8>,
    /// Total bytes the child wrote, including discarded ones
    pub seen: usize,
    pub truncated: bool,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BufferState::default())),
            limit,
        }
    }

    pub fn push(&self, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.seen += bytes.len();
        let room = self.limit.saturating_sub(state.data.len());
        if bytes.len() > room {
            state.data.extend_from_slice(&bytes[..room]);
            state.truncated = true;
        } else {
            state.data.extend_from_slice(bytes);
        }
    }

    /// Read `reader` to EOF into the buffer
    pub async fn fill<R>(self, mut reader: R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            self.push(&chunk[..n]);
        }
    }

    /// Copy out what has been captured so far
    pub fn snapshot(&self) -> Captured {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        Captured {
            data: state.data.clone(),
            seen: state.seen,
            truncated: state.truncated,
        }
    }
}

/// Output split into its two channels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channels {
    /// Structured result data
    pub protocol: String,
    /// Human-readable status and log text
    pub diagnostics: String,
}

/// Marker appended when a stream hit its limit
pub fn truncation_marker(stream: &str, captured: &Captured) -> String {
    format!(
        "[{} truncated: kept {} of {} bytes]",
        stream,
        captured.data.len(),
        captured.seen
    )
}

/// Marker appended when the process was stopped before it finished writing
pub fn interruption_marker(cause: &str) -> String {
    format!("[output incomplete: {}]", cause)
}

impl Channels {
    /// Append one diagnostic line
    pub fn note(&mut self, line: &str) {
        if !self.diagnostics.is_empty() && !self.diagnostics.ends_with('\n') {
            self.diagnostics.push('\n');
        }
        self.diagnostics.push_str(line);
        self.diagnostics.push('\n');
    }
}

/// Split captured streams into protocol and diagnostic channels
///
/// Raw mode passes stdout and stderr through unchanged. Truncation markers
/// are diagnostic in both modes. Protocol mode keeps
/// stdout only if it is one JSON document, or else keeps the individual lines
/// that are JSON objects/arrays; all other stdout lines go to diagnostics
/// with [`REDIRECTED_PREFIX`]. stderr is always diagnostic.
pub fn demultiplex(stdout: &Captured, stderr: &Captured, protocol_mode: bool) -> Channels {
    let out = String::from_utf8_lossy(&stdout.data);
    let err = String::from_utf8_lossy(&stderr.data);

    let mut diagnostics: Vec<String> = Vec::new();
    if !err.is_empty() {
        diagnostics.push(err.trim_end_matches('\n').to_string());
    }

    let protocol = if protocol_mode {
        split_protocol(&out, &mut diagnostics)
    } else {
        out.into_owned()
    };

    if stdout.truncated {
        diagnostics.push(truncation_marker("stdout", stdout));
    }
    if stderr.truncated {
        diagnostics.push(truncation_marker("stderr", stderr));
    }

    let mut diagnostics = diagnostics.join("\n");
    if !diagnostics.is_empty() {
        diagnostics.push('\n');
    }
    Channels {
        protocol,
        diagnostics,
    }
}

fn split_protocol(stdout: &str, diagnostics: &mut Vec<String>) -> String {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return format!("{}\n", trimmed);
    }

    let mut protocol = String::new();
    for line in stdout.lines() {
        let candidate = line.trim();
        if candidate.is_empty() {
            continue;
        }
        if is_json_line(candidate) {
            protocol.push_str(candidate);
            protocol.push('\n');
        } else {
            diagnostics.push(format!("{}{}", REDIRECTED_PREFIX, line));
        }
    }
    protocol
}

fn is_json_line(line: &str) -> bool {
    (line.starts_with('{') || line.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(line).is_ok()
}
