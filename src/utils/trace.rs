//! Wire message tracing.
//!
//! When a trace directory is configured, every envelope the proxy sends or
//! receives is dumped as two files: header plus annotations, and payload.
//! Files are named `{seq:05}-a-send-header.dat`, `{seq:05}-a-send-message.dat`,
//! `{seq:05}-b-recv-header.dat` and `{seq:05}-b-recv-message.dat`.

use crate::core::packet::Message;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    fn prefix(self) -> &'static str {
        match self {
            Direction::Send => "a-send",
            Direction::Recv => "b-recv",
        }
    }
}

/// File paths for one traced message.
pub fn trace_paths(dir: &Path, seq: u32, direction: Direction) -> (PathBuf, PathBuf) {
    let prefix = direction.prefix();
    (
        dir.join(format!("{seq:05}-{prefix}-header.dat")),
        dir.join(format!("{seq:05}-{prefix}-message.dat")),
    )
}

/// Write the trace files for `message`.
pub async fn write_trace(dir: &Path, message: &Message, direction: Direction) -> Result<()> {
    let (header_path, payload_path) = trace_paths(dir, message.seq, direction);
    let mut header = message.header_bytes().to_vec();
    header.extend_from_slice(&message.annotation_bytes());
    tokio::fs::write(header_path, header).await?;
    tokio::fs::write(payload_path, &message.data).await?;
    Ok(())
}

/// Trace `message` if a directory is configured; failures are logged, never raised.
pub async fn maybe_trace(dir: Option<&Path>, message: &Message, direction: Direction) {
    if let Some(dir) = dir {
        if let Err(e) = write_trace(dir, message, direction).await {
            warn!(error = %e, dir = %dir.display(), "Failed to write message trace");
        }
    }
}
