//! Live-server acceptance test.
//!
//! Connects to a real IRC server and verifies registration, collision-free
//! nick selection and channel join. Run with:
//!
//!   IRCRELAY_SERVER=localhost:6667 cargo test -p ircrelay --test acceptance -- --nocapture
//!
//! Add IRCRELAY_TLS=1 for a TLS server (port 6697 etc.). If the environment
//! variable isn't set, the test is skipped.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;

use ircrelay::config::RelayConfig;
use ircrelay::handshake::HandshakeEngine;
use ircrelay::proto::{self, Inbound};
use ircrelay::transport::{self, Transport};

const TIMEOUT: Duration = Duration::from_secs(15);

fn live_config() -> Option<RelayConfig> {
    let server = std::env::var("IRCRELAY_SERVER").ok()?;
    let (host, port) = server.split_once(':')?;
    Some(RelayConfig {
        host: host.to_string(),
        port: port.parse().ok()?,
        no_tls: std::env::var("IRCRELAY_TLS").unwrap_or_default() != "1",
        nick: Some(format!(
            "relaytest{}",
            std::process::id() % 10_000
        )),
        channel: format!("#_relaytest_{}", std::process::id()),
        ..RelayConfig::default()
    })
}

#[tokio::test]
async fn registers_and_joins_a_channel() {
    let Some(config) = live_config() else {
        eprintln!("IRCRELAY_SERVER not set, skipping");
        return;
    };
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let transport = transport::connect(&config).await.expect("connect");
    let joined = match transport {
        Transport::Plain(stream) => {
            let (r, w) = tokio::io::split(stream);
            register_and_wait(BufReader::new(r), w, &config).await
        }
        Transport::Tls(stream) => {
            let (r, w) = tokio::io::split(stream);
            register_and_wait(BufReader::new(r), w, &config).await
        }
    };
    assert!(joined, "never saw the member list for {}", config.channel);
}

async fn register_and_wait<R, W>(mut reader: R, mut writer: W, config: &RelayConfig) -> bool
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut engine = HandshakeEngine::new(config);
    engine.register(&mut writer).await.expect("register");

    let result = timeout(TIMEOUT, async {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return false;
            }
            match proto::classify(line.trim_end(), &config.channel) {
                Inbound::ChannelJoined => return true,
                Inbound::NickCollision => {
                    engine.retry_collision(&mut writer).await.expect("retry");
                }
                Inbound::Ping { token } => {
                    use tokio::io::AsyncWriteExt;
                    writer
                        .write_all(proto::pong(&token).as_bytes())
                        .await
                        .expect("pong");
                }
                Inbound::Other => {}
            }
        }
    })
    .await;

    result.unwrap_or(false)
}
