//! Per-connection relay loop.
//!
//! One [`Relay`] per configured connection. It moves through
//! [`RelayState`]s in one direction only:
//!
//! ```text
//! Starting ──(logged in, joined)──▶ Running ──(stop signal)──▶ Draining
//!     │                                │                         │
//!     └──(setup failed)──▶ Closed ◀────┴──(EOF / RECONNECT)──────┘
//! ```
//!
//! While running, three activities share the session's writer:
//! - the read loop (this task): answers `PING`, forwards everything else
//!   to the publish topic, escalates `RECONNECT` and stream faults;
//! - the subscribe handler: turns broker deliveries into `PRIVMSG`s;
//! - the quit waiter: on the stop signal sends `QUIT` and closes the write
//!   side, which makes the far end close the stream and ends the read loop.
//!
//! [`SessionWriter`] serializes their writes.

use std::sync::Arc;

use ircmq_sdk::client::{self, ConnectConfig, DEFAULT_CAPS};
use ircmq_sdk::irc::Message;
use ircmq_sdk::session::{SessionError, SessionReader, SessionWriter};
use rumqttc::QoS;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::broker::{self, Broker};
use crate::config::Connection;
use crate::envelope;
use crate::supervisor::{Escalation, SupervisorHandle, signalled};

/// High-volume commands that are only logged in debug mode.
const QUIET_COMMANDS: &[&str] = &[
    "PRIVMSG",
    "NOTICE",
    "USERNOTICE",
    "PING",
    "CLEARCHAT",
    "HOSTTARGET",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Starting,
    Running,
    Draining,
    Closed,
}

/// Why a relay reached [`RelayState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Connecting, logging in, joining or subscribing failed. Other
    /// connections are unaffected.
    Abandoned,
    /// The far end closed the stream.
    Closed,
    /// The chat service sent `RECONNECT`; a restart was requested.
    Reconnect,
    /// The supervisor halted all relays.
    Halted,
    /// The read stream failed; escalated as fatal.
    Failed,
}

pub fn is_quiet(command: &str) -> bool {
    QUIET_COMMANDS.contains(&command)
}

pub struct Relay<B> {
    conn: Connection,
    broker: Arc<B>,
    caps: Vec<String>,
    debug: bool,
    state: watch::Sender<RelayState>,
}

impl<B: Broker> Relay<B> {
    pub fn new(conn: Connection, broker: Arc<B>) -> Self {
        let (state, _) = watch::channel(RelayState::Starting);
        Self {
            conn,
            broker,
            caps: DEFAULT_CAPS.iter().map(|c| c.to_string()).collect(),
            debug: false,
            state,
        }
    }

    /// Log every raw inbound line and every outbound relayed message.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Override the capabilities requested at login.
    pub fn with_caps(mut self, caps: Vec<String>) -> Self {
        self.caps = caps;
        self
    }

    /// Follow state transitions.
    pub fn state(&self) -> watch::Receiver<RelayState> {
        self.state.subscribe()
    }

    fn nick(&self) -> &str {
        &self.conn.nick
    }

    fn set_state(&self, next: RelayState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(connection = %self.nick(), from = ?prev, to = ?next, "relay state");
        }
    }

    fn close(&self, exit: RelayExit) -> RelayExit {
        self.set_state(RelayState::Closed);
        tracing::info!(connection = %self.nick(), ?exit, "relay closed");
        exit
    }

    /// Dial the chat service and run the relay until it closes.
    pub async fn run(
        self,
        dial: ConnectConfig,
        stop: watch::Receiver<bool>,
        supervisor: SupervisorHandle,
    ) -> RelayExit {
        match client::establish_connection(&dial).await {
            Ok(conn) => {
                let (reader, writer) = conn.into_session();
                self.run_session(reader, writer, stop, supervisor).await
            }
            Err(e) => {
                tracing::error!(
                    connection = %self.nick(),
                    error = %e,
                    "connect failed, abandoning connection",
                );
                self.close(RelayExit::Abandoned)
            }
        }
    }

    /// Run over an already connected session: log in, join, then relay.
    pub async fn run_session(
        self,
        mut reader: SessionReader,
        writer: SessionWriter,
        mut stop: watch::Receiver<bool>,
        mut supervisor: SupervisorHandle,
    ) -> RelayExit {
        let (publish_qos, subscribe_qos) =
            match (broker::qos(self.conn.publish.qos), broker::qos(self.conn.subscribe.qos)) {
                (Ok(p), Ok(s)) => (p, s),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(connection = %self.nick(), error = %e, "abandoning connection");
                    return self.close(RelayExit::Abandoned);
                }
            };

        if let Err(e) = self.establish(&writer).await {
            tracing::error!(
                connection = %self.nick(),
                error = %e,
                "login failed, abandoning connection",
            );
            return self.close(RelayExit::Abandoned);
        }
        self.set_state(RelayState::Running);

        let handler = match self.subscribe(&writer, subscribe_qos).await {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(
                    connection = %self.nick(),
                    error = %e,
                    "subscribe failed, abandoning connection",
                );
                if let Err(e) = writer.quit().await {
                    tracing::warn!(connection = %self.nick(), error = %e, "quit failed");
                }
                return self.close(RelayExit::Abandoned);
            }
        };

        let quit_waiter = tokio::spawn(wait_and_quit(
            stop.clone(),
            writer.clone(),
            self.nick().to_string(),
        ));

        if !self.conn.publish.topic.is_empty() {
            tracing::info!(
                connection = %self.nick(),
                "publishing to {} at QOS {}",
                self.conn.publish.topic,
                self.conn.publish.qos
            );
        }

        let mut draining = false;
        let exit = loop {
            let decoded = tokio::select! {
                biased;
                _ = supervisor.halted() => break RelayExit::Halted,
                _ = signalled(&mut stop), if !draining => {
                    draining = true;
                    self.set_state(RelayState::Draining);
                    continue;
                }
                decoded = reader.decode() => decoded,
            };

            let msg = match decoded {
                Ok(Some(msg)) => msg,
                Ok(None) => break RelayExit::Closed,
                Err(e) => {
                    tracing::error!(connection = %self.nick(), error = %e, "read failed");
                    supervisor.escalate(Escalation::Fatal {
                        nick: self.nick().to_string(),
                        reason: e.to_string(),
                    });
                    break RelayExit::Failed;
                }
            };

            self.log_inbound(&msg);

            if msg.command == "PING" {
                if let Err(e) = writer.encode(&msg.to_pong()).await {
                    tracing::warn!(connection = %self.nick(), error = %e, "PONG failed");
                }
                continue;
            }

            if !self.conn.publish.topic.is_empty() {
                self.forward(&msg, publish_qos).await;
            }

            if msg.command == "RECONNECT" {
                tracing::warn!(
                    connection = %self.nick(),
                    "server sent RECONNECT, restarting process",
                );
                supervisor.escalate(Escalation::Restart {
                    nick: self.nick().to_string(),
                });
                break RelayExit::Reconnect;
            }
        };

        if let Some(handler) = handler {
            handler.abort();
        }
        if draining {
            // The quit line is already on its way; let it finish.
            let _ = quit_waiter.await;
        } else {
            quit_waiter.abort();
        }
        self.close(exit)
    }

    async fn establish(&self, writer: &SessionWriter) -> Result<(), SessionError> {
        writer.login(&self.conn.nick, &self.conn.pass).await?;
        writer.cap_req(&self.caps).await?;
        writer.join(&self.conn.publish.channels).await
    }

    async fn subscribe(
        &self,
        writer: &SessionWriter,
        qos: QoS,
    ) -> anyhow::Result<Option<JoinHandle<()>>> {
        let topic = &self.conn.subscribe.topic;
        if topic.is_empty() {
            return Ok(None);
        }
        tracing::info!(
            connection = %self.nick(),
            "subscribing to {topic} at QOS {}",
            self.conn.subscribe.qos
        );
        let deliveries = self.broker.subscribe(topic, qos).await?;
        Ok(Some(tokio::spawn(relay_to_chat(
            deliveries,
            writer.clone(),
            self.nick().to_string(),
            self.debug,
        ))))
    }

    async fn forward(&self, msg: &Message, qos: QoS) {
        let payload = match serde_json::to_vec(msg) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(connection = %self.nick(), error = %e, "can't serialize message");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .publish(&self.conn.publish.topic, qos, payload)
            .await
        {
            tracing::warn!(connection = %self.nick(), error = %e, "publish failed");
        }
    }

    fn log_inbound(&self, msg: &Message) {
        if self.debug || !is_quiet(&msg.command) {
            tracing::info!(connection = %self.nick(), "> {}", msg.raw);
        }
    }
}

/// Subscribe handler: each delivery becomes one `PRIVMSG`.
async fn relay_to_chat(
    mut deliveries: mpsc::UnboundedReceiver<Vec<u8>>,
    writer: SessionWriter,
    nick: String,
    debug: bool,
) {
    while let Some(payload) = deliveries.recv().await {
        let msg = match envelope::to_privmsg(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(connection = %nick, error = %e, "dropping delivery");
                continue;
            }
        };
        if debug {
            tracing::info!(connection = %nick, "< {msg}");
        }
        if let Err(e) = writer.encode(&msg).await {
            tracing::warn!(connection = %nick, error = %e, "relay to chat failed");
        }
    }
}

/// Quit waiter: on the stop signal, send `QUIT` and close the write side.
async fn wait_and_quit(mut stop: watch::Receiver<bool>, writer: SessionWriter, nick: String) {
    signalled(&mut stop).await;
    tracing::info!(connection = %nick, "quitting");
    if let Err(e) = writer.quit().await {
        tracing::warn!(connection = %nick, error = %e, "quit failed");
    }
}
