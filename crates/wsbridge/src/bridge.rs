//! Stdio bridge between the server and an external consumer.
//!
//! Events leave as one JSON object per line on stdout; commands arrive the
//! same way on stdin:
//!
//! ```text
//! stdout: {"action":"onMessage","uuid":"…","msg":"hello"}
//! stdin:  {"action":"send","uuid":"…","msg":"hi back"}
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wsbridge_server::{Command, Delivery, EventSink, ServerCore, ServerEvent, SinkError};

/// Event sink writing newline-delimited JSON.
pub struct JsonLineSink<W> {
    writer: Mutex<W>,
}

impl JsonLineSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> EventSink for JsonLineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&self, event: ServerEvent, delivery: Delivery) -> Result<(), SinkError> {
        let mut line = event.to_json()?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Closed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SinkError::Closed(e.to_string()))?;

        if delivery == Delivery::Final {
            debug!("📤 Final event written");
        }
        Ok(())
    }
}

/// Reads commands line by line and applies them to the server.
///
/// Blank and malformed lines are skipped. Returns the number of commands
/// applied once the input ends.
pub async fn run_commands<R>(reader: R, core: Arc<ServerCore>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match Command::from_json(line) {
                    Ok(command) => {
                        core.dispatch(command).await;
                        applied += 1;
                    }
                    Err(e) => warn!("⚠️ Ignoring malformed command {:?}: {}", line, e),
                }
            }
            Ok(None) => {
                debug!("Command input closed");
                break;
            }
            Err(e) => {
                warn!("Failed to read command input: {}", e);
                break;
            }
        }
    }

    applied
}
