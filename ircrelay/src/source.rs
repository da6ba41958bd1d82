//! Input line sources: stdin or a named pipe.
//!
//! A [`LineSource`] owns a producer task that turns the underlying reader
//! into a queue of trimmed lines plus a terminal signal distinguishing EOF
//! from I/O errors. The source outlives any single connection generation;
//! the current generation's sender is its only consumer and hands it back
//! by value when the generation ends.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;

use crate::error::StartupError;

/// How the input source was requested on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSpec {
    /// Read standard input.
    Stdin,
    /// A pipe named after the nick, in the temp directory.
    NickDerived,
    /// A pipe at an explicit path.
    Path(PathBuf),
}

impl InputSpec {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "-" => InputSpec::Stdin,
            "nick" => InputSpec::NickDerived,
            other => InputSpec::Path(PathBuf::from(other)),
        }
    }

    /// Resolve to a concrete target. Nick-derived pipes are the only ones
    /// removed at process exit.
    pub fn resolve(&self, nick: &str) -> SourceTarget {
        match self {
            InputSpec::Stdin => SourceTarget::Stdin,
            InputSpec::NickDerived => SourceTarget::Pipe {
                path: std::env::temp_dir().join(nick),
                remove_on_exit: true,
            },
            InputSpec::Path(path) => SourceTarget::Pipe {
                path: path.clone(),
                remove_on_exit: false,
            },
        }
    }
}

/// A resolved input target.
#[derive(Debug, Clone)]
pub enum SourceTarget {
    Stdin,
    Pipe { path: PathBuf, remove_on_exit: bool },
}

/// Why the producer stopped. Terminal for the producer task; the pipe
/// variants may be recovered by reopening the source.
#[derive(Debug)]
pub enum SourceEnd {
    Eof,
    Io(std::io::Error),
}

/// What the consumer sees next: a line, or the terminal signal. Buffered
/// lines are always drained before the terminal signal is surfaced.
#[derive(Debug)]
pub enum SourceEvent {
    Line(String),
    End(SourceEnd),
}

#[derive(Debug)]
pub struct LineSource {
    target: SourceTarget,
    lines: mpsc::Receiver<String>,
    end: mpsc::Receiver<SourceEnd>,
}

impl LineSource {
    /// Open the input source. For pipes this creates the FIFO when absent,
    /// optionally discards stale buffered data, and reopens the pipe
    /// read-write so an external writer closing its end never produces EOF.
    pub async fn open(
        target: &SourceTarget,
        flush_stale: bool,
        flush_window: Duration,
    ) -> Result<LineSource, StartupError> {
        let (lines_tx, lines_rx) = mpsc::channel(64);
        let (end_tx, end_rx) = mpsc::channel(1);

        match target {
            SourceTarget::Stdin => {
                spawn_reader(tokio::io::stdin(), lines_tx, end_tx);
            }
            SourceTarget::Pipe { path, .. } => {
                let preexisting = ensure_fifo(path)?;
                if flush_stale && preexisting {
                    flush_pipe(path, flush_window)
                        .await
                        .map_err(|e| StartupError::PipeFlush {
                            path: path.clone(),
                            source: e,
                        })?;
                }
                let rx = pipe::OpenOptions::new()
                    .read_write(true)
                    .open_receiver(path)
                    .map_err(|e| StartupError::PipeOpen {
                        path: path.clone(),
                        source: e,
                    })?;
                tracing::debug!(path = %path.display(), "opened pipe read-write");
                spawn_reader(rx, lines_tx, end_tx);
            }
        }

        Ok(LineSource {
            target: target.clone(),
            lines: lines_rx,
            end: end_rx,
        })
    }

    /// Build a source from pre-wired channels. Tests drive the producer side
    /// directly instead of going through a file descriptor.
    #[cfg(test)]
    pub(crate) fn from_parts(
        target: SourceTarget,
        lines: mpsc::Receiver<String>,
        end: mpsc::Receiver<SourceEnd>,
    ) -> Self {
        Self {
            target,
            lines,
            end,
        }
    }

    pub fn is_stdin(&self) -> bool {
        matches!(self.target, SourceTarget::Stdin)
    }

    /// Next line or terminal signal. Lines queued before the producer
    /// stopped are yielded first.
    pub async fn next_event(&mut self) -> SourceEvent {
        tokio::select! {
            biased;
            Some(line) = self.lines.recv() => SourceEvent::Line(line),
            end = self.end.recv() => match end {
                Some(end) => SourceEvent::End(end),
                // Producer gone without a signal; treat as an I/O failure.
                None => SourceEvent::End(SourceEnd::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "line producer stopped",
                ))),
            },
        }
    }
}

/// Make sure `path` is a FIFO, creating it when absent. Returns whether it
/// already existed.
fn ensure_fifo(path: &Path) -> Result<bool, StartupError> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(md) if md.file_type().is_fifo() => Ok(true),
        Ok(_) => Err(StartupError::PipeOpen {
            path: path.to_owned(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "exists but is not a pipe",
            ),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "creating pipe");
            nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o660)).map_err(
                |errno| StartupError::PipeCreate {
                    path: path.to_owned(),
                    source: std::io::Error::from_raw_os_error(errno as i32),
                },
            )?;
            Ok(false)
        }
        Err(e) => Err(StartupError::PipeOpen {
            path: path.to_owned(),
            source: e,
        }),
    }
}

/// Discard everything already buffered on a pre-existing pipe. A sentinel
/// payload is written first so the flushing read cannot block forever on an
/// empty pipe with no writer; each read is bounded by `window`.
async fn flush_pipe(path: &Path, window: Duration) -> std::io::Result<()> {
    // Reader first: opening the write end requires a reader to exist.
    let mut rx = pipe::OpenOptions::new().open_receiver(path)?;
    let mut tx = pipe::OpenOptions::new().open_sender(path)?;
    tx.write_all(b"\n").await?;
    drop(tx);

    let mut buf = [0u8; 4096];
    let mut total = 0usize;
    loop {
        match tokio::time::timeout(window, rx.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                tracing::debug!(path = %path.display(), "flush read timed out");
                break;
            }
        }
    }
    tracing::debug!(path = %path.display(), bytes = total, "pipe flushed");
    Ok(())
}

/// Producer: read lines, strip trailing whitespace, forward until the
/// consumer goes away or the reader ends.
fn spawn_reader<R>(reader: R, lines_tx: mpsc::Sender<String>, end_tx: mpsc::Sender<SourceEnd>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end().to_string();
                    if lines_tx.send(line).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = end_tx.send(SourceEnd::Eof).await;
                    return;
                }
                Err(e) => {
                    let _ = end_tx.send(SourceEnd::Io(e)).await;
                    return;
                }
            }
        }
    });
}
