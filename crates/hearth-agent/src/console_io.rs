use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// Tracing target carrying raw game console lines. The binary routes it to
/// its own rolling file.
pub const CONSOLE_LOG_TARGET: &str = "game_console";

/// Longest line a reader buffers. Longer output is emitted in pieces of at
/// most this many bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// The reader and writer tasks bridging one child process's stdio.
#[derive(Debug)]
pub struct ConsoleWorkers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl ConsoleWorkers {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Waits up to `grace` for every worker to finish on its own (readers at
    /// EOF, writer with a closed queue), then cancels the rest.
    pub async fn drain(self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        for mut handle in self.handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                self.cancel.cancel();
                let _ = handle.await;
            }
        }
        self.cancel.cancel();
    }
}

fn trim_line_ending(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Streams `stream` line by line into `sink` until EOF, a read error, or
/// cancellation. A pending read is abandoned as soon as `cancel` fires.
///
/// Non-UTF-8 output is decoded lossily; game servers occasionally emit it.
/// Lines longer than [`MAX_LINE_BYTES`] are split.
pub fn spawn_line_reader<R, F>(
    stream: R,
    stream_name: &'static str,
    cancel: CancellationToken,
    sink: F,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    F: Fn(String) + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = limited.read_until(b'\n', &mut buf) => match read {
                    Ok(0) => break,
                    Ok(n) => {
                        if n == MAX_LINE_BYTES && !buf.ends_with(b"\n") {
                            tracing::debug!(stream = stream_name, "console line exceeds {MAX_LINE_BYTES} bytes, splitting");
                        }
                        sink(String::from_utf8_lossy(trim_line_ending(&buf)).into_owned());
                    }
                    Err(e) => {
                        tracing::warn!(stream = stream_name, error = %e, "console read failed");
                        break;
                    }
                },
            }
        }
        tracing::debug!(stream = stream_name, "console reader finished");
    })
}

/// Drains `queue` into `stdin`, one newline-terminated line per entry.
///
/// Write failures are logged and the line dropped; the process keeps running.
pub fn spawn_stdin_writer<W>(
    mut stdin: W,
    mut queue: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(line) => line,
                    None => break,
                },
            };

            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            let res = async {
                stdin.write_all(&bytes).await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = res {
                tracing::warn!(error = %e, "console write failed");
            }
        }
        tracing::debug!("console writer finished");
    })
}
