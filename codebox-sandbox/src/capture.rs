//! Output capture
//!
//! stdout and stderr are recorded into separate bounded buffers. One pump
//! drives both streams, the process exit, the deadline and cancellation, so
//! whatever was read before a timeout is kept.

use crate::backend::{ExitOutcome, ProcessControl, RunningProcess};
use crate::error::RunError;
use futures::StreamExt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded capture of one output stream
#[derive(Debug, Clone)]
pub struct StreamCapture {
    buf: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl StreamCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(64 * 1024)),
            limit,
            truncated: false,
        }
    }

    /// Append a chunk. Bytes past the limit are discarded.
    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit - self.buf.len();
        if chunk.len() > room {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Decode as UTF-8, replacing invalid sequences with U+FFFD. A character
    /// cut in half by truncation is dropped.
    pub fn into_string(self) -> String {
        let bytes = if self.truncated {
            complete_prefix(&self.buf)
        } else {
            &self.buf[..]
        };
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// `bytes` without an incomplete UTF-8 sequence at its end
fn complete_prefix(bytes: &[u8]) -> &[u8] {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        if bytes[i] & 0xC0 == 0x80 {
            continue;
        }
        return match std::str::from_utf8(&bytes[i..]) {
            Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => &bytes[..i],
            _ => bytes,
        };
    }
    bytes
}

/// How the process phase ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The process ended on its own (or by a limit the kernel enforced)
    Exited(ExitOutcome),
    /// The wall-clock deadline passed and the process was killed
    DeadlineExceeded,
    /// The caller cancelled and the process was stopped
    Cancelled,
    /// The backend lost track of the process
    Failed(RunError),
}

/// Everything the pump recorded
#[derive(Debug, Clone)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub termination: Termination,
}

/// Timing knobs for the pump
#[derive(Debug, Clone, Copy)]
pub struct PumpOptions {
    pub max_output_bytes: usize,
    /// Time between terminate and kill on cancellation, and the bound for
    /// waiting on a killed process
    pub cancel_grace: Duration,
    /// How long to keep reading pipes after the process exited
    pub drain_grace: Duration,
}

/// Drive `process` until it exits, `deadline` passes or `cancel` fires
pub async fn pump(
    process: RunningProcess,
    deadline: Instant,
    cancel: &CancellationToken,
    options: PumpOptions,
) -> Captured {
    let RunningProcess {
        mut stdout,
        mut stderr,
        mut control,
    } = process;
    let mut out = StreamCapture::new(options.max_output_bytes);
    let mut err = StreamCapture::new(options.max_output_bytes);
    let mut stdout_open = true;
    let mut stderr_open = true;

    let timer = tokio::time::sleep_until(deadline);
    tokio::pin!(timer);

    let termination = loop {
        tokio::select! {
            chunk = stdout.next(), if stdout_open => {
                stdout_open = record(&mut out, chunk, "stdout");
            }
            chunk = stderr.next(), if stderr_open => {
                stderr_open = record(&mut err, chunk, "stderr");
            }
            status = control.wait() => {
                break match status {
                    Ok(outcome) => Termination::Exited(outcome),
                    Err(e) => Termination::Failed(e),
                };
            }
            _ = &mut timer => {
                debug!("deadline reached, killing process");
                control.kill().await;
                reap(control.as_mut(), options.cancel_grace).await;
                break Termination::DeadlineExceeded;
            }
            _ = cancel.cancelled() => {
                debug!("cancelled, terminating process");
                control.terminate().await;
                if !reap(control.as_mut(), options.cancel_grace).await {
                    control.kill().await;
                    reap(control.as_mut(), options.cancel_grace).await;
                }
                break Termination::Cancelled;
            }
        }
    };

    // Pipes may still hold output, or be kept open by a grandchild.
    let drain_until = Instant::now() + options.drain_grace;
    while stdout_open || stderr_open {
        tokio::select! {
            chunk = stdout.next(), if stdout_open => {
                stdout_open = record(&mut out, chunk, "stdout");
            }
            chunk = stderr.next(), if stderr_open => {
                stderr_open = record(&mut err, chunk, "stderr");
            }
            _ = tokio::time::sleep_until(drain_until) => {
                debug!("output drain grace elapsed with pipes still open");
                break;
            }
        }
    }

    let truncated = out.is_truncated() || err.is_truncated();
    Captured {
        stdout: out.into_string(),
        stderr: err.into_string(),
        truncated,
        termination,
    }
}

/// Record one stream item; returns whether the stream is still open
fn record(
    capture: &mut StreamCapture,
    item: Option<std::io::Result<bytes::Bytes>>,
    stream: &'static str,
) -> bool {
    match item {
        Some(Ok(chunk)) => {
            capture.push(&chunk);
            true
        }
        Some(Err(e)) => {
            warn!(stream, error = %e, "output stream failed");
            false
        }
        None => false,
    }
}

/// Wait up to `grace` for the process to end
async fn reap(control: &mut dyn ProcessControl, grace: Duration) -> bool {
    matches!(tokio::time::timeout(grace, control.wait()).await, Ok(Ok(_)))
}
