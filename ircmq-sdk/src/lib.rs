//! Client side of the chat protocol for ircmq.
//!
//! - [`irc`]: the [`Message`](irc::Message) model, parser and wire rendering
//! - [`session`]: a connected stream split into a decoder and a locked writer
//! - [`client`]: TCP/TLS dialing and the chat service constants

pub mod client;
pub mod irc;
pub mod session;
