//! Nick registration and channel join.
//!
//! The engine drives the NICK/USER/(identify)/JOIN sequence against a
//! transport write half. It never waits for server acknowledgement: join
//! confirmation is observed by the receive loop, which calls back into
//! [`HandshakeEngine::retry_collision`] when the server rejects the nick.

use std::io;

use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::RelayConfig;
use crate::proto;

pub struct HandshakeEngine {
    base_nick: String,
    nick: String,
    suffix_always: bool,
    uname: String,
    rname: String,
    auth: Option<(String, String)>,
    channel: String,
    chan_key: Option<String>,
}

impl HandshakeEngine {
    pub fn new(config: &RelayConfig) -> Self {
        let base_nick = config.base_nick();
        Self {
            nick: base_nick.clone(),
            base_nick,
            suffix_always: config.nick_suffix(),
            uname: config.uname.clone(),
            rname: config.rname.clone(),
            auth: config.auth(),
            channel: config.channel.clone(),
            chan_key: config.chan_key.clone(),
        }
    }

    /// The nick most recently sent to the server.
    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Derive the next nick from the base nick. `force` appends a random
    /// suffix even when the suffix policy is off (used on collisions).
    fn next_nick(&mut self, force: bool) {
        if self.suffix_always || force {
            let n: u64 = rand::thread_rng().r#gen::<u64>() >> 1;
            self.nick = format!("{}-{}", self.base_nick, n);
        } else {
            self.nick = self.base_nick.clone();
        }
    }

    /// Send the full registration sequence. Identify is fire-and-forget;
    /// nothing waits for a services reply before the JOIN goes out.
    pub async fn register<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.next_nick(false);
        self.send_registration(writer).await
    }

    /// The server reported our nick in use: pick a fresh suffixed nick and
    /// restart the sequence from the top. Retries are unbounded.
    pub async fn retry_collision<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.next_nick(true);
        self.send_registration(writer).await
    }

    async fn send_registration<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::debug!(nick = %self.nick, "sending registration");
        writer.write_all(proto::nick(&self.nick).as_bytes()).await?;
        writer
            .write_all(proto::user(&self.uname, &self.rname).as_bytes())
            .await?;
        if let Some((id_nick, id_pass)) = &self.auth {
            tracing::debug!(auth_nick = %id_nick, "authenticating to services");
            writer
                .write_all(proto::identify(id_nick, id_pass).as_bytes())
                .await?;
        }
        writer
            .write_all(proto::join(&self.channel, self.chan_key.as_deref()).as_bytes())
            .await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn config() -> RelayConfig {
        RelayConfig {
            nick: Some("host".into()),
            channel: "#chan".into(),
            ..Default::default()
        }
    }

    async fn written(rx: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = rx.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn registration_sequence_without_suffix() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&RelayConfig {
            no_nums: true,
            ..config()
        });
        engine.register(&mut tx).await.unwrap();

        let out = written(&mut rx).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["NICK host", "USER ircrelay x x :Status over IRC", "JOIN #chan"]);
    }

    #[tokio::test]
    async fn suffix_policy_appends_random_digits() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&config());
        engine.register(&mut tx).await.unwrap();

        let out = written(&mut rx).await;
        let nick_line = out.lines().next().unwrap();
        let suffix = nick_line.strip_prefix("NICK host-").unwrap();
        assert!(!suffix.is_empty());
        assert!(suffix.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn collision_forces_a_fresh_nick_and_resends_everything() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&config());
        engine.register(&mut tx).await.unwrap();
        let first = engine.nick().to_string();
        let _ = written(&mut rx).await;

        engine.retry_collision(&mut tx).await.unwrap();
        let second = engine.nick().to_string();
        assert_ne!(first, second);
        assert!(second.starts_with("host-"));

        let out = written(&mut rx).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], format!("NICK {second}"));
        assert!(lines[1].starts_with("USER "));
        assert_eq!(lines[2], "JOIN #chan");
    }

    #[tokio::test]
    async fn collision_suffixes_even_when_policy_is_off() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&RelayConfig {
            no_nums: true,
            ..config()
        });
        engine.register(&mut tx).await.unwrap();
        assert_eq!(engine.nick(), "host");
        let _ = written(&mut rx).await;

        engine.retry_collision(&mut tx).await.unwrap();
        assert!(engine.nick().starts_with("host-"));
    }

    #[tokio::test]
    async fn identify_sent_between_user_and_join() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&RelayConfig {
            id_nick: Some("svc".into()),
            id_pass: Some("hunter2".into()),
            no_nums: true,
            ..config()
        });
        engine.register(&mut tx).await.unwrap();

        let out = written(&mut rx).await;
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[1], "USER ircrelay x x :Status over IRC");
        assert_eq!(lines[2], "PRIVMSG nickserv :identify svc hunter2");
        assert_eq!(lines[3], "JOIN #chan");
    }

    #[tokio::test]
    async fn join_carries_the_channel_key() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        let mut engine = HandshakeEngine::new(&RelayConfig {
            chan_key: Some("sekrit".into()),
            no_nums: true,
            ..config()
        });
        engine.register(&mut tx).await.unwrap();
        let out = written(&mut rx).await;
        assert!(out.lines().any(|l| l == "JOIN #chan sekrit"));
    }
}
