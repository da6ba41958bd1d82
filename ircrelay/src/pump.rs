//! The per-generation message pump.
//!
//! Two workers share one connection generation. The receive loop owns both
//! transport halves: it reacts to inbound lines (PING, nick collision, join
//! confirmation) and executes outbound commands arriving over an mpsc
//! channel, acknowledging each write so the sender knows its fate. The send
//! loop is gated on the join confirmation, drains the pending buffer before
//! the line source, splits oversized lines, and enforces the flood-protection
//! delay between every chunk.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::handshake::HandshakeEngine;
use crate::proto::{self, Inbound};
use crate::source::{LineSource, SourceEnd, SourceEvent};

/// One outbound payload chunk, acknowledged once its write completes.
pub struct Outbound {
    pub text: String,
    pub ack: oneshot::Sender<bool>,
}

/// Why the receive loop stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// Orderly close of the server connection.
    TransportClosed,
    TransportError(io::Error),
    /// Nothing heard from the server within the idle timeout.
    IdleTimeout,
    Cancelled,
}

/// Why the send loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderEnd {
    /// EOF on the primary standard input: orderly process shutdown.
    Shutdown,
    /// The input source failed; it may be reopened by the supervisor.
    SourceError,
    /// The receive loop (and with it the transport) went away.
    Disconnected,
    Cancelled,
}

/// Everything the sender hands back to the supervisor: the line source it
/// was lent, and the line whose delivery is still unconfirmed.
pub struct SenderOutcome {
    pub end: SenderEnd,
    pub source: LineSource,
    pub pending: Option<String>,
}

async fn write_line<W>(writer: &mut W, line: &str, tx_proto: bool) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if tx_proto {
        tracing::info!(line = %line.trim_end(), "tx");
    }
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Receive loop. Owns the transport; runs until the connection ends, the
/// server goes silent past the idle timeout, or the generation is cancelled
/// (in which case a best-effort QUIT goes out first).
pub async fn run_pump<R, W>(
    mut reader: R,
    mut writer: W,
    mut engine: HandshakeEngine,
    config: RelayConfig,
    mut outbound: mpsc::Receiver<Outbound>,
    mut ready: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
) -> PumpEnd
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let idle_timeout = config.idle_timeout();
    let mut last_activity = tokio::time::Instant::now();
    let mut line_buf = String::new();
    let mut sender_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write_line(&mut writer, &proto::quit(&config.quit_msg), config.tx_proto).await;
                return PumpEnd::Cancelled;
            }
            result = reader.read_line(&mut line_buf) => {
                match result {
                    Ok(0) => return PumpEnd::TransportClosed,
                    Ok(_) => {}
                    Err(e) => return PumpEnd::TransportError(e),
                }
                last_activity = tokio::time::Instant::now();
                let raw = line_buf.trim_end();
                if config.rx_proto {
                    tracing::info!(line = %raw, "rx");
                }
                match proto::classify(raw, &config.channel) {
                    Inbound::Ping { token } => {
                        if let Err(e) = write_line(&mut writer, &proto::pong(&token), config.tx_proto).await {
                            return PumpEnd::TransportError(e);
                        }
                    }
                    Inbound::NickCollision => {
                        tracing::debug!(nick = %engine.nick(), "nick in use, trying a new one");
                        if let Err(e) = engine.retry_collision(&mut writer).await {
                            return PumpEnd::TransportError(e);
                        }
                    }
                    Inbound::ChannelJoined => {
                        if let Some(tx) = ready.take() {
                            tracing::info!(channel = %config.channel, nick = %engine.nick(), "joined, relaying enabled");
                            let _ = tx.send(());
                        }
                    }
                    Inbound::Other => {}
                }
                line_buf.clear();
            }
            cmd = outbound.recv(), if sender_open => {
                match cmd {
                    Some(Outbound { text, ack }) => {
                        let result = write_line(
                            &mut writer,
                            &proto::privmsg(&config.channel, &text),
                            config.tx_proto,
                        )
                        .await;
                        let ok = result.is_ok();
                        let _ = ack.send(ok);
                        if let Err(e) = result {
                            return PumpEnd::TransportError(e);
                        }
                    }
                    None => sender_open = false,
                }
            }
            _ = tokio::time::sleep_until(last_activity + idle_timeout) => {
                return PumpEnd::IdleTimeout;
            }
        }
    }
}

/// Send loop. Transmits nothing until the join confirmation arrives; after
/// that the pending buffer is always retried before the next source line.
pub async fn run_sender(
    mut source: LineSource,
    mut pending: Option<String>,
    outbound: mpsc::Sender<Outbound>,
    ready: oneshot::Receiver<()>,
    cancel: CancellationToken,
    config: RelayConfig,
) -> SenderOutcome {
    tokio::select! {
        _ = cancel.cancelled() => {
            return SenderOutcome { end: SenderEnd::Cancelled, source, pending };
        }
        result = ready => {
            if result.is_err() {
                // The receive loop went away before the join was confirmed.
                return SenderOutcome { end: SenderEnd::Disconnected, source, pending };
            }
        }
    }

    let max = proto::max_payload(&config.channel);
    let delay = config.send_delay();

    loop {
        let line = match pending.take() {
            Some(line) => {
                tracing::debug!(line = %line, "retrying buffered line");
                line
            }
            None => tokio::select! {
                _ = cancel.cancelled() => {
                    return SenderOutcome { end: SenderEnd::Cancelled, source, pending: None };
                }
                event = source.next_event() => match event {
                    SourceEvent::Line(line) => line,
                    SourceEvent::End(SourceEnd::Eof) if source.is_stdin() => {
                        tracing::info!("input finished, shutting down");
                        return SenderOutcome { end: SenderEnd::Shutdown, source, pending: None };
                    }
                    SourceEvent::End(SourceEnd::Eof) => {
                        tracing::warn!("input source closed");
                        return SenderOutcome { end: SenderEnd::SourceError, source, pending: None };
                    }
                    SourceEvent::End(SourceEnd::Io(e)) => {
                        tracing::warn!(error = %e, "input source failed");
                        return SenderOutcome { end: SenderEnd::SourceError, source, pending: None };
                    }
                },
            },
        };

        // Hold the whole line until every chunk is confirmed written, so a
        // failure retries the original line on the next connection.
        pending = Some(line.clone());
        for chunk in proto::split_payload(&line, max) {
            let (ack_tx, ack_rx) = oneshot::channel();
            if outbound
                .send(Outbound {
                    text: chunk,
                    ack: ack_tx,
                })
                .await
                .is_err()
            {
                return SenderOutcome { end: SenderEnd::Disconnected, source, pending };
            }
            match ack_rx.await {
                Ok(true) => {}
                _ => {
                    return SenderOutcome { end: SenderEnd::Disconnected, source, pending };
                }
            }
            // Flood protection: delay between every chunk, not just lines.
            tokio::select! {
                _ = cancel.cancelled() => {
                    return SenderOutcome { end: SenderEnd::Cancelled, source, pending };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        pending = None;
    }
}
