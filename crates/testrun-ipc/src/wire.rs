//! Newline-delimited JSON framing for process control connections.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::TransportError;

/// Environment variable carrying the coordinator's control address.
pub const CONTROL_ADDR_ENV: &str = "TESTRUN_CONTROL_ADDR";

/// Environment variable carrying the worker id.
pub const WORKER_ID_ENV: &str = "TESTRUN_WORKER_ID";

/// Environment variable carrying the absolute path of the unit's test file.
pub const TEST_FILE_ENV: &str = "TESTRUN_TEST_FILE";

/// Serialize `message` as one line and flush it.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    trace!(bytes = json.len(), "Writing control message");
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message. Returns `Ok(None)` at EOF; skips blank and malformed lines.
///
/// Cancel safe: a line is either consumed whole or left in the reader.
pub async fn next_message<R, T>(lines: &mut Lines<R>) -> Result<Option<T>, TransportError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<T>(trimmed) {
            Ok(message) => return Ok(Some(message)),
            Err(e) => {
                // Log first 200 chars of raw message for debugging
                let preview: String = trimmed.chars().take(200).collect();
                warn!(error = %e, preview = %preview, "Failed to parse control message");
            }
        }
    }
    Ok(None)
}

/// Drain `rx` into `writer` until every sender is gone or a write fails.
pub async fn write_loop<W, T>(mut writer: W, mut rx: mpsc::Receiver<T>) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    while let Some(message) = rx.recv().await {
        write_message(&mut writer, &message).await?;
    }
    writer.shutdown().await?;
    Ok(())
}
