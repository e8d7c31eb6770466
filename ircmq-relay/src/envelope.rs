//! Broker payloads that become chat messages.
//!
//! A delivery on the subscribe topic is a JSON object
//! `{"channel": "...", "message": "..."}`. It is a different shape from what
//! the relay publishes outward (a whole serialized [`Message`]).

use ircmq_sdk::irc::{self, Message};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Envelope {
    #[serde(alias = "Channel")]
    pub channel: String,
    #[serde(alias = "Message")]
    pub message: String,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("bad payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty channel")]
    EmptyChannel,
    #[error("empty message")]
    EmptyMessage,
}

/// Turn a subscribe delivery into the `PRIVMSG` it asks for.
pub fn to_privmsg(payload: &[u8]) -> Result<Message, EnvelopeError> {
    let envelope: Envelope = serde_json::from_slice(payload)?;
    if envelope.channel.is_empty() {
        return Err(EnvelopeError::EmptyChannel);
    }
    if envelope.message.is_empty() {
        return Err(EnvelopeError::EmptyMessage);
    }
    Ok(irc::privmsg(&envelope.channel, &envelope.message))
}
