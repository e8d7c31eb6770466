//! Process arguments and the per-connection config file.
//!
//! Config file lives at `config.toml` unless `--config`/`CONFIG` says otherwise:
//!
//! ```toml
//! [[connections]]
//! nick = "relaybot"
//! pass = "oauth:0123456789abcdef"
//!
//! [connections.publish]
//! topic = "chat/in"
//! qos = 1
//! channels = ["somechannel", "#another"]
//!
//! [connections.subscribe]
//! topic = "chat/out"
//! qos = 1
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ircmq_sdk::client::{CREDENTIAL_PREFIX, DEFAULT_SERVER_ADDR};
use serde::Deserialize;
use thiserror::Error;

#[derive(Parser, Debug, Clone)]
#[command(name = "ircmq-relay", about = "Relay chat channels to MQTT topics and back")]
pub struct Args {
    /// MQTT broker URL (tcp://host:1883, ssl://host:8883)
    #[arg(long, env = "MQTT_BROKER")]
    pub mqtt_broker: String,

    /// Connection config file
    #[arg(long = "config", env = "CONFIG", default_value = "config.toml")]
    pub config_path: PathBuf,

    /// Log every raw line received and every message relayed to chat
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Chat server address (host:port)
    #[arg(long, env = "IRC_SERVER", default_value = DEFAULT_SERVER_ADDR)]
    pub irc_server: String,

    /// Skip TLS certificate verification for the chat server
    #[arg(long)]
    pub irc_insecure: bool,
}

/// Load `KEY=value` pairs from `path` into the environment, without
/// overriding variables already set. A missing file is fine; returns
/// whether one was loaded.
pub fn load_env_file(path: &Path) -> Result<bool> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(true),
        Err(e) if e.not_found() => Ok(false),
        Err(e) => Err(e).with_context(|| format!("can't load {}", path.display())),
    }
}

/// The whole config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connections: Vec<Connection>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("can't read config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("bad config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// One chat login and the topics it relays to and from.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub nick: String,
    pub pass: String,
    pub publish: Publish,
    pub subscribe: Subscribe,
}

/// Chat → broker direction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Publish {
    pub topic: String,
    pub qos: u8,
    pub channels: Vec<String>,
}

/// Broker → chat direction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Subscribe {
    pub topic: String,
    pub qos: u8,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("nick", &self.nick)
            .field("pass", &"<redacted>")
            .field("publish", &self.publish)
            .field("subscribe", &self.subscribe)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("empty nick")]
    EmptyNick,
    #[error("empty pass")]
    EmptyPass,
    #[error("pass did not start with oauth:")]
    NonOauthPass,
    #[error("pub and sub topics are the same or empty")]
    BadTopics,
    #[error("channels provided without publish topic")]
    ChannelsNoTopic,
    #[error("invalid QOS")]
    BadQos,
    #[error("empty channel name")]
    EmptyChannel,
}

impl Connection {
    /// Check well-formedness. Pure; reports the first failure found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nick.is_empty() {
            return Err(ConfigError::EmptyNick);
        }
        if self.pass.is_empty() {
            return Err(ConfigError::EmptyPass);
        }
        if !self.pass.starts_with(CREDENTIAL_PREFIX) {
            return Err(ConfigError::NonOauthPass);
        }
        if self.publish.topic == self.subscribe.topic {
            return Err(ConfigError::BadTopics);
        }
        if !self.publish.channels.is_empty() && self.publish.topic.is_empty() {
            return Err(ConfigError::ChannelsNoTopic);
        }
        if self.publish.qos > 2 || self.subscribe.qos > 2 {
            return Err(ConfigError::BadQos);
        }
        if self.publish.channels.iter().any(String::is_empty) {
            return Err(ConfigError::EmptyChannel);
        }
        Ok(())
    }
}

/// Validate every connection, collecting `(index, error)` for each failure.
pub fn validate_all(connections: &[Connection]) -> Result<(), Vec<(usize, ConfigError)>> {
    let failures: Vec<_> = connections
        .iter()
        .enumerate()
        .filter_map(|(i, c)| c.validate().err().map(|e| (i, e)))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}
