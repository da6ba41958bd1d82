//! IRC line parsing and formatting for the relay.
//!
//! This is a minimal codec: inbound lines are classified into the handful of
//! events the session state machine reacts to, everything else passes through
//! as [`Inbound::Other`]. Outbound commands are formatted here so the rest of
//! the code never builds protocol strings by hand. All formatting is pure —
//! no I/O.

use std::borrow::Cow;
use std::fmt;

/// Maximum IRC line length in bytes, excluding the trailing CRLF.
pub const MAX_LINE: usize = 510;

/// A parsed IRC message: `:prefix COMMAND params... :trailing`.
#[derive(Debug, Clone)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let mut rest = line;

        // Parse prefix: :server or :nick!user@host
        let prefix = if rest.starts_with(':') {
            let end = rest.find(' ')?;
            let pfx = rest[1..end].to_string();
            rest = &rest[end + 1..];
            Some(pfx)
        } else {
            None
        };

        let mut params = Vec::new();
        let command;

        if let Some(space) = rest.find(' ') {
            command = rest[..space].to_ascii_uppercase();
            rest = &rest[space + 1..];

            while !rest.is_empty() {
                if let Some(trailing) = rest.strip_prefix(':') {
                    params.push(trailing.to_string());
                    break;
                }
                if let Some(space) = rest.find(' ') {
                    params.push(rest[..space].to_string());
                    rest = &rest[space + 1..];
                } else {
                    params.push(rest.to_string());
                    break;
                }
            }
        } else {
            command = rest.to_ascii_uppercase();
        }

        Some(Message {
            prefix,
            command,
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// The inbound events the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Server PING; must be answered with a PONG carrying the same token.
    Ping { token: String },
    /// ERR_NICKNAMEINUSE (433) — our nick was rejected.
    NickCollision,
    /// RPL_NAMREPLY (353) for our channel — the join succeeded.
    ChannelJoined,
    /// Anything else; ignored by the state machine.
    Other,
}

/// Classify a raw server line. `channel` is the channel whose join we are
/// waiting to confirm.
pub fn classify(line: &str, channel: &str) -> Inbound {
    let Some(msg) = Message::parse(line) else {
        return Inbound::Other;
    };
    match msg.command.as_str() {
        "PING" => Inbound::Ping {
            token: msg.params.first().cloned().unwrap_or_default(),
        },
        // ERR_NICKNAMEINUSE
        "433" => Inbound::NickCollision,
        // RPL_NAMREPLY — the member list that follows a successful JOIN
        "353" => {
            if msg.params.iter().any(|p| p.eq_ignore_ascii_case(channel)) {
                Inbound::ChannelJoined
            } else {
                Inbound::Other
            }
        }
        _ => Inbound::Other,
    }
}

/// Strip embedded line breaks so an interpolated field can never smuggle a
/// second command onto the wire.
fn no_breaks(s: &str) -> Cow<'_, str> {
    if s.contains(['\r', '\n']) {
        Cow::Owned(s.replace(['\r', '\n'], " "))
    } else {
        Cow::Borrowed(s)
    }
}

pub fn nick(nick: &str) -> String {
    format!("NICK {}\r\n", no_breaks(nick))
}

pub fn user(uname: &str, rname: &str) -> String {
    format!("USER {} x x :{}\r\n", no_breaks(uname), no_breaks(rname))
}

pub fn join(channel: &str, key: Option<&str>) -> String {
    match key {
        Some(k) if !k.is_empty() => {
            format!("JOIN {} {}\r\n", no_breaks(channel), no_breaks(k))
        }
        _ => format!("JOIN {}\r\n", no_breaks(channel)),
    }
}

pub fn privmsg(target: &str, text: &str) -> String {
    format!("PRIVMSG {} :{}\r\n", no_breaks(target), no_breaks(text))
}

pub fn identify(nick: &str, pass: &str) -> String {
    format!(
        "PRIVMSG nickserv :identify {} {}\r\n",
        no_breaks(nick),
        no_breaks(pass)
    )
}

pub fn pong(token: &str) -> String {
    format!("PONG :{}\r\n", no_breaks(token))
}

pub fn quit(message: &str) -> String {
    format!("QUIT :{}\r\n", no_breaks(message))
}

/// Largest PRIVMSG payload that fits on one wire line for `channel`,
/// accounting for the command, target and framing overhead.
pub fn max_payload(channel: &str) -> usize {
    MAX_LINE.saturating_sub("PRIVMSG ".len() + channel.len() + " :".len())
}

/// Split `text` into the fewest chunks of at most `max` bytes, breaking only
/// at character boundaries. A single character wider than the whole budget is
/// replaced with `?` rather than corrupting its encoding.
pub fn split_payload(text: &str, max: usize) -> Vec<String> {
    if text.len() <= max {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut cur = String::new();
    for ch in text.chars() {
        let (ch, len) = if ch.len_utf8() > max {
            ('?', 1)
        } else {
            (ch, ch.len_utf8())
        };
        if cur.len() + len > max && !cur.is_empty() {
            chunks.push(std::mem::take(&mut cur));
        }
        cur.push(ch);
    }
    if !cur.is_empty() {
        chunks.push(cur);
    }
    chunks
}
