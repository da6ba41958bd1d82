//! The reconnect loop.
//!
//! Each connection generation gets a fresh transport, handshake and pair of
//! pump workers under its own child cancellation token. The supervisor is
//! the single authority deciding retry versus exit: transport trouble always
//! retries after the configured wait, an input-source failure additionally
//! reopens the source, and only stdin EOF or an operator interrupt end the
//! process.

use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::handshake::HandshakeEngine;
use crate::pump::{self, PumpEnd, SenderEnd, SenderOutcome};
use crate::source::{LineSource, SourceTarget};
use crate::transport::{self, Transport};

/// Why the supervisor stopped. Both are clean exits.
#[derive(Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The primary standard input reached EOF.
    InputFinished,
    /// Operator-requested shutdown.
    Interrupted,
}

enum GenerationEnd {
    Shutdown,
    Interrupted,
    SourceError,
    Retry,
}

struct GenerationOutcome {
    end: GenerationEnd,
    source: Option<LineSource>,
    pending: Option<String>,
}

/// Run the relay until the input finishes or the process is interrupted.
pub async fn run(
    config: RelayConfig,
    target: SourceTarget,
    source: LineSource,
    cancel: CancellationToken,
) -> ExitReason {
    let mut source = Some(source);
    let mut pending: Option<String> = None;

    loop {
        if cancel.is_cancelled() {
            return ExitReason::Interrupted;
        }

        let src = match source.take() {
            Some(src) => src,
            None => match LineSource::open(&target, false, config.reconnect_wait()).await {
                Ok(src) => src,
                Err(e) => {
                    tracing::warn!(error = %e, "reopening input source failed, retrying");
                    if !wait_before_reconnect(&config, &cancel).await {
                        return ExitReason::Interrupted;
                    }
                    continue;
                }
            },
        };

        let transport = match transport::connect(&config).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::warn!(error = %e, wait_secs = config.wait_secs, "connection failed, retrying");
                source = Some(src);
                if !wait_before_reconnect(&config, &cancel).await {
                    return ExitReason::Interrupted;
                }
                continue;
            }
        };
        tracing::info!(addr = %config.addr(), "connected");

        let outcome = match transport {
            Transport::Plain(stream) => {
                let (r, w) = tokio::io::split(stream);
                run_generation(BufReader::new(r), w, &config, src, pending.take(), &cancel).await
            }
            Transport::Tls(stream) => {
                let (r, w) = tokio::io::split(stream);
                run_generation(BufReader::new(r), w, &config, src, pending.take(), &cancel).await
            }
        };

        source = outcome.source;
        pending = outcome.pending;

        match outcome.end {
            GenerationEnd::Shutdown => return ExitReason::InputFinished,
            GenerationEnd::Interrupted => return ExitReason::Interrupted,
            GenerationEnd::SourceError => {
                // The producer behind this source is gone; reopen it fresh.
                source = None;
                if !wait_before_reconnect(&config, &cancel).await {
                    return ExitReason::Interrupted;
                }
            }
            GenerationEnd::Retry => {
                if !wait_before_reconnect(&config, &cancel).await {
                    return ExitReason::Interrupted;
                }
            }
        }
    }
}

/// One generation: handshake, then both workers until either stops, then a
/// full wind-down so nothing from this generation outlives it.
async fn run_generation<R, W>(
    reader: R,
    mut writer: W,
    config: &RelayConfig,
    source: LineSource,
    pending: Option<String>,
    cancel: &CancellationToken,
) -> GenerationOutcome
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut engine = HandshakeEngine::new(config);
    if let Err(e) = engine.register(&mut writer).await {
        tracing::warn!(error = %e, "registration write failed");
        return GenerationOutcome {
            end: GenerationEnd::Retry,
            source: Some(source),
            pending,
        };
    }
    tracing::info!(nick = %engine.nick(), channel = %config.channel, "registration sent");

    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let (ready_tx, ready_rx) = oneshot::channel();
    let gen_cancel = cancel.child_token();

    let mut pump_task = tokio::spawn(pump::run_pump(
        reader,
        writer,
        engine,
        config.clone(),
        outbound_rx,
        Some(ready_tx),
        gen_cancel.clone(),
    ));
    let mut sender_task = tokio::spawn(pump::run_sender(
        source,
        pending,
        outbound_tx,
        ready_rx,
        gen_cancel.clone(),
        config.clone(),
    ));

    enum First {
        Pump(Result<PumpEnd, tokio::task::JoinError>),
        Sender(Result<SenderOutcome, tokio::task::JoinError>),
    }

    // Whichever worker stops first ends the generation; cancel and join the
    // other so everything is wound down before the supervisor moves on.
    let first = tokio::select! {
        p = &mut pump_task => First::Pump(p),
        s = &mut sender_task => First::Sender(s),
    };
    gen_cancel.cancel();
    let (pump_end, sender_out) = match first {
        First::Pump(p) => (p, sender_task.await),
        First::Sender(s) => (pump_task.await, s),
    };

    let pump_end = pump_end.unwrap_or_else(|e| {
        tracing::error!(error = %e, "receive worker failed");
        PumpEnd::TransportClosed
    });
    let (source, pending, sender_end) = match sender_out {
        Ok(SenderOutcome {
            end,
            source,
            pending,
        }) => (Some(source), pending, Some(end)),
        Err(e) => {
            tracing::error!(error = %e, "send worker failed");
            (None, None, None)
        }
    };

    let end = if matches!(sender_end, Some(SenderEnd::Shutdown)) {
        GenerationEnd::Shutdown
    } else if cancel.is_cancelled() {
        GenerationEnd::Interrupted
    } else if matches!(sender_end, Some(SenderEnd::SourceError)) {
        GenerationEnd::SourceError
    } else {
        match pump_end {
            PumpEnd::TransportClosed => tracing::warn!("connection closed"),
            PumpEnd::TransportError(ref e) => tracing::warn!(error = %e, "connection failed"),
            PumpEnd::IdleTimeout => tracing::warn!("server went silent, reconnecting"),
            PumpEnd::Cancelled => {}
        }
        GenerationEnd::Retry
    };

    GenerationOutcome {
        end,
        source,
        pending,
    }
}

async fn wait_before_reconnect(config: &RelayConfig, cancel: &CancellationToken) -> bool {
    tracing::info!(wait_secs = config.wait_secs, "sleeping before reconnect");
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(config.reconnect_wait()) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceEnd;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(port: u16) -> RelayConfig {
        RelayConfig {
            host: "127.0.0.1".into(),
            port,
            no_tls: true,
            nick: Some("host".into()),
            channel: "#chan".into(),
            send_delay_ms: 1,
            wait_secs: 0,
            ..Default::default()
        }
    }

    fn test_source(
        target: SourceTarget,
    ) -> (
        mpsc::Sender<String>,
        mpsc::Sender<SourceEnd>,
        LineSource,
    ) {
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let (end_tx, end_rx) = mpsc::channel(1);
        (
            lines_tx,
            end_tx,
            LineSource::from_parts(target, lines_rx, end_rx),
        )
    }

    async fn accept_registration(
        listener: &TcpListener,
    ) -> (
        tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::net::TcpStream>>>,
        tokio::io::WriteHalf<tokio::net::TcpStream>,
        String,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let (r, w) = tokio::io::split(stream);
        let mut lines = BufReader::new(r).lines();
        let nick_line = lines.next_line().await.unwrap().unwrap();
        let nick = nick_line.strip_prefix("NICK ").unwrap().to_string();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("USER "));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "JOIN #chan");
        (lines, w, nick)
    }

    #[tokio::test]
    async fn collision_retry_then_join_then_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (lines_tx, _end_tx, source) = test_source(SourceTarget::Stdin);
        lines_tx.send("all systems go".into()).await.unwrap();

        let cancel = CancellationToken::new();
        let sup = tokio::spawn(run(
            test_config(port),
            SourceTarget::Stdin,
            source,
            cancel.clone(),
        ));

        let (mut lines, mut w, first_nick) = accept_registration(&listener).await;
        assert!(first_nick.starts_with("host-"));

        // Reject the nick: the full registration must be resent with a
        // fresh suffix.
        w.write_all(
            format!(":irc.test 433 * {first_nick} :Nickname is already in use\r\n").as_bytes(),
        )
        .await
        .unwrap();
        let nick_line = lines.next_line().await.unwrap().unwrap();
        let second_nick = nick_line.strip_prefix("NICK ").unwrap().to_string();
        assert!(second_nick.starts_with("host-"));
        assert_ne!(first_nick, second_nick);
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("USER "));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "JOIN #chan");

        // Confirm the join: the queued line must now be relayed.
        w.write_all(format!(":irc.test 353 {second_nick} = #chan :{second_nick}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "PRIVMSG #chan :all systems go"
        );

        cancel.cancel();
        assert_eq!(sup.await.unwrap(), ExitReason::Interrupted);
        // graceful teardown sent a QUIT before the connection dropped
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "QUIT :ircrelay exiting"
        );
    }

    #[tokio::test]
    async fn stdin_eof_exits_cleanly_without_reconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (lines_tx, end_tx, source) = test_source(SourceTarget::Stdin);
        lines_tx.send("last report".into()).await.unwrap();
        end_tx.send(SourceEnd::Eof).await.unwrap();

        let cancel = CancellationToken::new();
        let sup = tokio::spawn(run(
            test_config(port),
            SourceTarget::Stdin,
            source,
            cancel,
        ));

        let (mut lines, mut w, nick) = accept_registration(&listener).await;
        w.write_all(format!(":irc.test 353 {nick} = #chan :{nick}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "PRIVMSG #chan :last report"
        );

        assert_eq!(sup.await.unwrap(), ExitReason::InputFinished);
    }

    #[tokio::test]
    async fn server_close_triggers_reconnect_and_lines_keep_flowing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (lines_tx, _end_tx, source) = test_source(SourceTarget::Stdin);
        lines_tx.send("before the drop".into()).await.unwrap();

        let cancel = CancellationToken::new();
        let sup = tokio::spawn(run(
            test_config(port),
            SourceTarget::Stdin,
            source,
            cancel.clone(),
        ));

        // First generation: confirm the join, take one line, then die.
        let (mut lines, mut w, nick) = accept_registration(&listener).await;
        w.write_all(format!(":irc.test 353 {nick} = #chan :{nick}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "PRIVMSG #chan :before the drop"
        );
        drop(w);
        drop(lines);

        // Second generation: a fresh registration arrives, and a line queued
        // meanwhile is relayed once the join is confirmed.
        lines_tx.send("after the drop".into()).await.unwrap();
        let (mut lines, mut w, nick) = accept_registration(&listener).await;
        w.write_all(format!(":irc.test 353 {nick} = #chan :{nick}\r\n").as_bytes())
            .await
            .unwrap();
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            "PRIVMSG #chan :after the drop"
        );

        cancel.cancel();
        assert_eq!(sup.await.unwrap(), ExitReason::Interrupted);
    }
}
