//! Shared fixtures: an in-memory broker and a scripted chat server.

#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use anyhow::{Result, bail};
use ircmq_relay::broker::Broker;
use ircmq_relay::config::{Connection, Publish, Subscribe};
use ircmq_sdk::session::{Session, SessionReader, SessionWriter};
use parking_lot::Mutex;
use rumqttc::QoS;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Fail the test if `fut` takes longer than [`TIMEOUT`].
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(TIMEOUT, fut)
        .await
        .expect("timed out")
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub topic: String,
    pub qos: QoS,
    pub payload: Vec<u8>,
}

impl Published {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap()
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    published: Mutex<Vec<Published>>,
    subscribers: Mutex<Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>>,
    fail_publish: bool,
    fail_subscribe: bool,
}

impl MemoryBroker {
    /// Every publish fails.
    pub fn failing_publish() -> Self {
        Self {
            fail_publish: true,
            ..Default::default()
        }
    }

    /// Every subscribe fails.
    pub fn failing_subscribe() -> Self {
        Self {
            fail_subscribe: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Push a payload to every subscriber of `topic`.
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        for (t, tx) in self.subscribers.lock().iter() {
            if t == topic {
                let _ = tx.send(payload.to_vec());
            }
        }
    }

    pub async fn wait_published(&self, n: usize) -> Vec<Published> {
        within(async {
            loop {
                let published = self.published();
                if published.len() >= n {
                    return published;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }

    pub async fn wait_subscribers(&self, n: usize) {
        within(async {
            while self.subscriber_count() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
    }
}

impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        if self.fail_publish {
            bail!("broker unavailable");
        }
        self.published.lock().push(Published {
            topic: topic.to_string(),
            qos,
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        _qos: QoS,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>> {
        if self.fail_subscribe {
            bail!("subscribe refused");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((topic.to_string(), tx));
        Ok(rx)
    }
}

/// The chat service's end of an in-memory session.
pub struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    pub async fn send(&mut self, line: &str) {
        self.send_bytes(format!("{line}\r\n").as_bytes()).await;
    }

    /// Write raw bytes, with no line ending added.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Next line the relay wrote, or `None` once it closed its write side.
    pub async fn next_line(&mut self) -> Option<String> {
        within(self.lines.next_line()).await.unwrap()
    }

    pub async fn expect_line(&mut self) -> String {
        self.next_line().await.expect("relay closed its write side")
    }

    /// Read the login sequence and return it.
    pub async fn read_login(&mut self, with_join: bool) -> Vec<String> {
        let n = if with_join { 4 } else { 3 };
        let mut lines = Vec::with_capacity(n);
        for _ in 0..n {
            lines.push(self.expect_line().await);
        }
        lines
    }

    /// Read until `QUIT`, returning whether it was seen before EOF.
    pub async fn read_until_quit(&mut self) -> bool {
        while let Some(line) = self.next_line().await {
            if line == "QUIT" {
                return true;
            }
        }
        false
    }
}

pub fn session() -> (SessionReader, SessionWriter, FakeServer) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = Session::new(client);
    let (server_read, server_write) = tokio::io::split(server);
    (
        reader,
        writer,
        FakeServer {
            lines: BufReader::new(server_read).lines(),
            writer: server_write,
        },
    )
}

pub fn connection(
    nick: &str,
    publish_topic: &str,
    channels: &[&str],
    subscribe_topic: &str,
) -> Connection {
    Connection {
        nick: nick.to_string(),
        pass: format!("oauth:{nick}-token"),
        publish: Publish {
            topic: publish_topic.to_string(),
            qos: 1,
            channels: channels.iter().map(|c| c.to_string()).collect(),
        },
        subscribe: Subscribe {
            topic: subscribe_topic.to_string(),
            qos: 0,
        },
    }
}
