//! A live chat session split into a line decoder and a shared writer.
//!
//! The read half is owned by whoever drives the session. The write half
//! is a cloneable [`SessionWriter`] that keeps the raw stream behind a
//! single mutex, so every encoded line (replies, relayed messages, the
//! final quit) goes out whole and never interleaves with another writer.

use std::io::ErrorKind;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::irc::{self, EncodeError, Message, ParseError};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed line: {0}")]
    Parse(#[from] ParseError),
    #[error("refusing to send: {0}")]
    Encode(#[from] EncodeError),
}

pub struct Session;

impl Session {
    /// Split a connected stream into its two halves.
    pub fn new<S>(stream: S) -> (SessionReader, SessionWriter)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        (
            SessionReader {
                inner: BufReader::new(Box::new(reader)),
                line: Vec::new(),
            },
            SessionWriter {
                inner: Arc::new(Mutex::new(Box::new(writer))),
            },
        )
    }
}

pub struct SessionReader {
    inner: BufReader<BoxedReader>,
    line: Vec<u8>,
}

impl SessionReader {
    /// Read the next message.
    ///
    /// `Ok(None)` means the far end closed the stream. A TLS peer that
    /// drops TCP without `close_notify` counts as closed too. Blank lines
    /// are skipped and bytes that are not UTF-8 are replaced, so only a
    /// failing stream or a line without a command is an error.
    ///
    /// Cancel safe: bytes of a partially read line stay in `self.line`
    /// for the next call.
    pub async fn decode(&mut self) -> Result<Option<Message>, SessionError> {
        loop {
            let n = match self.inner.read_until(b'\n', &mut self.line).await {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    tracing::debug!(
                        buffered = self.line.len(),
                        "stream ended without close_notify"
                    );
                    self.line.clear();
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };
            if n == 0 && self.line.is_empty() {
                return Ok(None);
            }
            let bytes = std::mem::take(&mut self.line);
            if let Some(msg) = Message::parse(&String::from_utf8_lossy(&bytes))? {
                return Ok(Some(msg));
            }
        }
    }
}

#[derive(Clone)]
pub struct SessionWriter {
    inner: Arc<Mutex<BoxedWriter>>,
}

impl SessionWriter {
    /// Write one message as a full line and flush it.
    pub async fn encode(&self, msg: &Message) -> Result<(), SessionError> {
        msg.validate()?;
        let line = format!("{msg}\r\n");
        let mut w = self.inner.lock().await;
        w.write_all(line.as_bytes()).await?;
        w.flush().await?;
        Ok(())
    }

    /// Send `QUIT` and shut the write half down, both under one lock hold.
    pub async fn quit(&self) -> Result<(), SessionError> {
        let line = format!("{}\r\n", irc::quit());
        let mut w = self.inner.lock().await;
        let sent = match w.write_all(line.as_bytes()).await {
            Ok(()) => w.flush().await,
            Err(e) => Err(e),
        };
        // Shut down even if the quit line failed, so the reader sees the close.
        let shut = w.shutdown().await;
        sent?;
        shut?;
        Ok(())
    }

    /// Credential then identity.
    pub async fn login(&self, nick: &str, pass: &str) -> Result<(), SessionError> {
        self.encode(&irc::pass(pass)).await?;
        self.encode(&irc::nick(nick)).await
    }

    /// Request extended capabilities; a no-op for an empty list.
    pub async fn cap_req<S: AsRef<str>>(&self, caps: &[S]) -> Result<(), SessionError> {
        match irc::cap_req(caps) {
            Some(msg) => self.encode(&msg).await,
            None => Ok(()),
        }
    }

    /// Join all channels in one message; a no-op for an empty list.
    pub async fn join<S: AsRef<str>>(&self, channels: &[S]) -> Result<(), SessionError> {
        match irc::join(channels) {
            Some(msg) => self.encode(&msg).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, ReadBuf};

    #[tokio::test]
    async fn decode_skips_blank_lines_and_reports_eof() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Session::new(client);

        server
            .write_all(b"\r\nPING :tmi.twitch.tv\r\n:a!a@a PRIVMSG #c :x\r\n")
            .await
            .unwrap();
        drop(server);

        let ping = reader.decode().await.unwrap().unwrap();
        assert_eq!(ping.command, "PING");
        let privmsg = reader.decode().await.unwrap().unwrap();
        assert_eq!(privmsg.trailing, "x");
        assert!(reader.decode().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_decode_keeps_partial_line() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Session::new(client);

        server.write_all(b"PING :tmi.tw").await.unwrap();
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), reader.decode()).await;
        assert!(cancelled.is_err());

        server.write_all(b"itch.tv\r\n").await.unwrap();
        let msg = reader.decode().await.unwrap().unwrap();
        assert_eq!(msg.trailing, "tmi.twitch.tv");
    }

    #[tokio::test]
    async fn cancelled_decode_mid_message_keeps_every_byte() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Session::new(client);

        server.write_all(b":a!a@a PRIVMSG #foo :hello").await.unwrap();
        for _ in 0..3 {
            let cancelled =
                tokio::time::timeout(std::time::Duration::from_millis(10), reader.decode()).await;
            assert!(cancelled.is_err());
        }
        server.write_all(b" world\r\n").await.unwrap();

        let msg = reader.decode().await.unwrap().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.trailing, "hello world");
        assert_eq!(msg.raw, ":a!a@a PRIVMSG #foo :hello world");
    }

    #[tokio::test]
    async fn non_utf8_bytes_are_replaced_not_fatal() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Session::new(client);

        server
            .write_all(b"PRIVMSG #foo :caf\xe9 latin1\r\nPING :next\r\n")
            .await
            .unwrap();

        let msg = reader.decode().await.unwrap().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.trailing, "caf\u{FFFD} latin1");
        let ping = reader.decode().await.unwrap().unwrap();
        assert_eq!(ping.trailing, "next");
    }

    /// Reads `data`, then fails the way a TLS stream does when the peer
    /// drops TCP without `close_notify`.
    struct TruncatedTls {
        data: &'static [u8],
    }

    impl AsyncRead for TruncatedTls {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            if self.data.is_empty() {
                return Poll::Ready(Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed connection without sending TLS close_notify",
                )));
            }
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for TruncatedTls {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn missing_close_notify_is_a_clean_close() {
        let (mut reader, _writer) = Session::new(TruncatedTls {
            data: b"PING :tmi.twitch.tv\r\n",
        });
        let ping = reader.decode().await.unwrap().unwrap();
        assert_eq!(ping.command, "PING");
        assert!(reader.decode().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn other_read_errors_are_reported() {
        struct Broken;
        impl AsyncRead for Broken {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Err(ErrorKind::ConnectionReset.into()))
            }
        }
        impl AsyncWrite for Broken {
            fn poll_write(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let (mut reader, _writer) = Session::new(Broken);
        assert!(matches!(reader.decode().await, Err(SessionError::Io(_))));
    }

    #[tokio::test]
    async fn decode_malformed_line_is_error() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Session::new(client);
        server.write_all(b":only.a.prefix\r\n").await.unwrap();
        assert!(matches!(
            reader.decode().await,
            Err(SessionError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn login_sequence_on_the_wire() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (_reader, writer) = Session::new(client);

        writer.login("bot", "oauth:secret").await.unwrap();
        writer
            .cap_req(&["twitch.tv/tags", "twitch.tv/commands"])
            .await
            .unwrap();
        writer.join(&["foo", "#bar"]).await.unwrap();
        writer.quit().await.unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "PASS oauth:secret\r\nNICK bot\r\nCAP REQ :twitch.tv/tags twitch.tv/commands\r\nJOIN #foo,#bar\r\nQUIT\r\n"
        );
    }

    #[tokio::test]
    async fn invalid_message_writes_nothing() {
        let (client, mut server) = tokio::io::duplex(1024);
        let (_reader, writer) = Session::new(client);

        let err = writer
            .encode(&irc::privmsg("foo", "a\nb"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Encode(EncodeError::LineBreak)));
        writer.quit().await.unwrap();

        let mut out = String::new();
        server.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "QUIT\r\n");
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (client, mut server) = tokio::io::duplex(64);
        let (_reader, writer) = Session::new(client);

        let collector = tokio::spawn(async move {
            let mut out = String::new();
            server.read_to_string(&mut out).await.unwrap();
            out
        });

        let mut tasks = Vec::new();
        for w in 0..8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let text = format!("writer{w}-").repeat(40);
                for _ in 0..25 {
                    writer.encode(&irc::privmsg("chan", &text)).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        writer.quit().await.unwrap();

        let out = collector.await.unwrap();
        let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 8 * 25 + 1);
        for line in &lines[..lines.len() - 1] {
            let text = line.strip_prefix("PRIVMSG #chan :").unwrap();
            let unit = &text[..text.find('-').unwrap() + 1];
            assert_eq!(text, unit.repeat(40), "interleaved line: {line}");
        }
        assert_eq!(*lines.last().unwrap(), "QUIT");
    }
}
