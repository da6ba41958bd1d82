//! Relay configuration.
//!
//! Parsed once at startup and passed by reference into every component;
//! nothing mutates it after [`RelayConfig::resolve`] has run.

use std::io::BufRead;
use std::time::Duration;

use clap::Parser;

use crate::error::StartupError;

/// Nick used when no flag is given and the local hostname is unavailable.
pub const FALLBACK_NICK: &str = "ircrelay";

/// Relay lines from stdin or a named pipe to an IRC channel.
#[derive(Parser, Debug, Clone)]
#[command(name = "ircrelay", version, about)]
pub struct RelayConfig {
    /// IRC server hostname.
    #[arg(long, default_value = "irc.libera.chat")]
    pub host: String,

    /// IRC server port.
    #[arg(long, default_value = "6697")]
    pub port: u16,

    /// Connect without TLS.
    #[arg(long)]
    pub no_tls: bool,

    /// Expected TLS certificate hostname. Defaults to the server hostname.
    #[arg(long)]
    pub tls_hostname: Option<String>,

    /// Skip TLS certificate verification (for self-signed certs).
    #[arg(long)]
    pub tls_insecure: bool,

    /// IRC nickname. Defaults to the local hostname up to the first dot.
    #[arg(long)]
    pub nick: Option<String>,

    /// Do not append random numbers to the nick. Numbers are still added
    /// when the server reports a nick collision.
    #[arg(long)]
    pub no_nums: bool,

    /// Username.
    #[arg(long, default_value = "ircrelay")]
    pub uname: String,

    /// Real name.
    #[arg(long, default_value = "Status over IRC")]
    pub rname: String,

    /// Nick to use to auth to services. If unset while --id-pass is given,
    /// the base nick is used.
    #[arg(long)]
    pub id_nick: Option<String>,

    /// Password to use to auth to services. If unset while --id-nick is
    /// given, the password is read from standard input.
    #[arg(long, env = "IRCRELAY_ID_PASS")]
    pub id_pass: Option<String>,

    /// Channel to join.
    #[arg(long, default_value = "#ircrelay")]
    pub channel: String,

    /// Channel key, if the channel requires one.
    #[arg(long)]
    pub chan_key: Option<String>,

    /// Quit message sent on shutdown.
    #[arg(long, default_value = "ircrelay exiting")]
    pub quit_msg: String,

    /// Input to read. "-" for stdin, "nick" for a pipe named after the nick
    /// in the temp directory, or a path where a pipe is created if none
    /// exists. Data is buffered until a newline; lines longer than IRC
    /// allows are split across multiple messages.
    #[arg(long, default_value = "-")]
    pub pipe: String,

    /// Keep data that was already buffered on the pipe before startup
    /// instead of discarding it. Ignored for stdin.
    #[arg(long)]
    pub no_flush: bool,

    /// Seconds to wait between reconnection attempts.
    #[arg(long, default_value = "10")]
    pub wait_secs: u64,

    /// Milliseconds to delay between sent lines to avoid flooding.
    #[arg(long, default_value = "1000")]
    pub send_delay_ms: u64,

    /// Seconds of server silence before forcing a reconnect.
    #[arg(long, default_value = "300")]
    pub idle_timeout_secs: u64,

    /// Print some non-error output.
    #[arg(long, short)]
    pub verbose: bool,

    /// Print more non-error output. Implies --verbose.
    #[arg(long)]
    pub debug: bool,

    /// Log received IRC protocol lines.
    #[arg(long)]
    pub rx_proto: bool,

    /// Log sent IRC protocol lines.
    #[arg(long)]
    pub tx_proto: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "irc.libera.chat".to_string(),
            port: 6697,
            no_tls: false,
            tls_hostname: None,
            tls_insecure: false,
            nick: None,
            no_nums: false,
            uname: "ircrelay".to_string(),
            rname: "Status over IRC".to_string(),
            id_nick: None,
            id_pass: None,
            channel: "#ircrelay".to_string(),
            chan_key: None,
            quit_msg: "ircrelay exiting".to_string(),
            pipe: "-".to_string(),
            no_flush: false,
            wait_secs: 10,
            send_delay_ms: 1000,
            idle_timeout_secs: 300,
            verbose: false,
            debug: false,
            rx_proto: false,
            tx_proto: false,
        }
    }
}

impl RelayConfig {
    /// Joined host:port.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tls(&self) -> bool {
        !self.no_tls
    }

    /// Whether a random suffix is appended to the nick on every handshake.
    pub fn nick_suffix(&self) -> bool {
        !self.no_nums
    }

    pub fn flush_stale(&self) -> bool {
        !self.no_flush
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Base nick: the --nick flag, or the local hostname up to the first dot.
    pub fn base_nick(&self) -> String {
        if let Some(ref nick) = self.nick {
            return nick.clone();
        }
        match nix::unistd::gethostname() {
            Ok(name) => {
                let name = name.to_string_lossy();
                let short = name.split('.').next().unwrap_or(FALLBACK_NICK);
                if short.is_empty() {
                    FALLBACK_NICK.to_string()
                } else {
                    short.to_string()
                }
            }
            Err(_) => FALLBACK_NICK.to_string(),
        }
    }

    /// Default tracing filter when RUST_LOG is not set.
    pub fn filter_directive(&self) -> &'static str {
        if self.debug {
            "ircrelay=trace"
        } else if self.verbose {
            "ircrelay=debug"
        } else {
            "ircrelay=info"
        }
    }

    /// Services credentials, once both halves are known.
    pub fn auth(&self) -> Option<(String, String)> {
        match (&self.id_nick, &self.id_pass) {
            (Some(n), Some(p)) => Some((n.clone(), p.clone())),
            _ => None,
        }
    }

    /// Fill in the half-specified services credentials: a missing auth nick
    /// falls back to the base nick, a missing password is read from stdin.
    pub fn resolve_auth(&mut self) -> Result<(), StartupError> {
        if self.id_nick.is_none() && self.id_pass.is_none() {
            return Ok(());
        }
        if self.id_nick.is_none() {
            self.id_nick = Some(self.base_nick());
        }
        if self.id_pass.is_none() {
            let mut pass = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut pass)
                .map_err(|e| {
                    StartupError::InvalidConfig(format!(
                        "unable to read services password from stdin: {e}"
                    ))
                })?;
            let pass = pass.trim_end_matches(['\r', '\n']);
            if pass.is_empty() {
                return Err(StartupError::InvalidConfig(
                    "empty services password".to_string(),
                ));
            }
            self.id_pass = Some(pass.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_joins_host_and_port() {
        let cfg = RelayConfig {
            host: "irc.example.net".into(),
            port: 6667,
            ..Default::default()
        };
        assert_eq!(cfg.addr(), "irc.example.net:6667");
    }

    #[test]
    fn tls_and_suffix_default_on() {
        let cfg = RelayConfig::default();
        assert!(cfg.tls());
        assert!(cfg.nick_suffix());
        assert!(cfg.flush_stale());
    }

    #[test]
    fn explicit_nick_wins_over_hostname() {
        let cfg = RelayConfig {
            nick: Some("statusbot".into()),
            ..Default::default()
        };
        assert_eq!(cfg.base_nick(), "statusbot");
    }

    #[test]
    fn hostname_nick_has_no_dots() {
        let cfg = RelayConfig::default();
        assert!(!cfg.base_nick().contains('.'));
        assert!(!cfg.base_nick().is_empty());
    }

    #[test]
    fn auth_requires_both_halves() {
        let mut cfg = RelayConfig::default();
        assert!(cfg.auth().is_none());
        cfg.id_nick = Some("svc".into());
        cfg.id_pass = Some("secret".into());
        assert_eq!(cfg.auth(), Some(("svc".into(), "secret".into())));
    }

    #[test]
    fn missing_auth_nick_falls_back_to_base_nick() {
        let mut cfg = RelayConfig {
            nick: Some("host1".into()),
            id_pass: Some("secret".into()),
            ..Default::default()
        };
        cfg.resolve_auth().unwrap();
        assert_eq!(cfg.id_nick.as_deref(), Some("host1"));
    }

    #[test]
    fn filter_directive_tracks_verbosity() {
        let mut cfg = RelayConfig::default();
        assert_eq!(cfg.filter_directive(), "ircrelay=info");
        cfg.verbose = true;
        assert_eq!(cfg.filter_directive(), "ircrelay=debug");
        cfg.debug = true;
        assert_eq!(cfg.filter_directive(), "ircrelay=trace");
    }
}
