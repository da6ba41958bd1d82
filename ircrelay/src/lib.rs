//! ircrelay: relay lines from stdin or a named pipe onto an IRC channel.
//!
//! The supervisor owns a reconnect loop; every connection generation runs a
//! handshake and a pair of pump workers against a fresh transport, sharing
//! the long-lived line source. Delivery is at-least-once across reconnects:
//! the last unconfirmed line is carried into the next generation.

pub mod config;
pub mod error;
pub mod handshake;
pub mod proto;
pub mod pump;
pub mod source;
pub mod supervisor;
pub mod transport;
