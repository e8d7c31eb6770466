//! Chat protocol message model.
//!
//! One [`Message`] per protocol line:
//! `[@tags] [:prefix] COMMAND [params...] [:trailing]`.
//!
//! The same struct is used in both directions: lines decoded from the
//! chat service (with `raw` populated) and lines we build and encode
//! (where `raw` is left empty and [`fmt::Display`] renders the wire form).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sigil every channel name carries on the wire.
pub const CHANNEL_SIGIL: char = '#';

/// Source of a message (`nick!user@host` or a bare server name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefix {
    pub name: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    pub fn parse(s: &str) -> Self {
        let (rest, host) = match s.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_string())),
            None => (s, None),
        };
        let (name, user) = match rest.split_once('!') {
            Some((name, user)) => (name.to_string(), Some(user.to_string())),
            None => (rest.to_string(), None),
        };
        Self { name, user, host }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(ref user) = self.user {
            write!(f, "!{user}")?;
        }
        if let Some(ref host) = self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// A single parsed protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The original line as received, without CR/LF. Empty for messages we build.
    pub raw: String,
    /// IRCv3 message tags with escapes already resolved.
    pub tags: HashMap<String, String>,
    pub prefix: Option<Prefix>,
    pub command: String,
    /// Middle parameters, in order.
    pub params: Vec<String>,
    /// Free-text final argument (after ` :`). Empty when absent.
    pub trailing: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no command in line {0:?}")]
    MissingCommand(String),
}

/// Reasons a message is refused before anything reaches the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
    #[error("message has no command")]
    EmptyCommand,
    #[error("invalid command {0:?}")]
    InvalidCommand(String),
    #[error("invalid middle parameter {0:?}")]
    InvalidParam(String),
    #[error("message contains CR, LF or NUL")]
    LineBreak,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trailing(mut self, trailing: impl Into<String>) -> Self {
        self.trailing = trailing.into();
        self
    }

    /// Parse one line, with or without its CR/LF terminator.
    ///
    /// Returns `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> Result<Option<Self>, ParseError> {
        let raw = line.trim_end_matches(['\r', '\n']);
        if raw.trim().is_empty() {
            return Ok(None);
        }

        let mut rest = raw;

        let mut tags = HashMap::new();
        if let Some(r) = rest.strip_prefix('@') {
            let (t, r) = r.split_once(' ').unwrap_or((r, ""));
            tags = parse_tags(t);
            rest = r.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(r) = rest.strip_prefix(':') {
            let (p, r) = r.split_once(' ').unwrap_or((r, ""));
            prefix = Some(Prefix::parse(p));
            rest = r.trim_start_matches(' ');
        }

        let (head, trailing) = match rest.find(" :") {
            Some(i) => (&rest[..i], rest[i + 2..].to_string()),
            None => (rest, String::new()),
        };

        let mut words = head.split(' ').filter(|w| !w.is_empty());
        let command = words
            .next()
            .ok_or_else(|| ParseError::MissingCommand(raw.to_string()))?
            .to_string();
        let params = words.map(str::to_string).collect();

        Ok(Some(Self {
            raw: raw.to_string(),
            tags,
            prefix,
            command,
            params,
            trailing,
        }))
    }

    /// Check that the rendered form is exactly one well-formed line.
    pub fn validate(&self) -> Result<(), EncodeError> {
        if self.command.is_empty() {
            return Err(EncodeError::EmptyCommand);
        }
        if self.command.contains(' ') || self.command.starts_with(':') {
            return Err(EncodeError::InvalidCommand(self.command.clone()));
        }

        let has_break = |s: &str| s.contains(['\r', '\n', '\0']);
        if has_break(&self.command) || has_break(&self.trailing) {
            return Err(EncodeError::LineBreak);
        }
        if self.prefix.as_ref().is_some_and(|p| has_break(&p.to_string())) {
            return Err(EncodeError::LineBreak);
        }

        for p in &self.params {
            if has_break(p) {
                return Err(EncodeError::LineBreak);
            }
            if p.is_empty() || p.contains(' ') || p.starts_with(':') {
                return Err(EncodeError::InvalidParam(p.clone()));
            }
        }
        Ok(())
    }

    /// Keepalive reply carrying the same parameters and trailing text.
    pub fn to_pong(&self) -> Self {
        Self::new("PONG")
            .with_params(self.params.iter().cloned())
            .with_trailing(self.trailing.clone())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut tags: Vec<_> = self.tags.iter().collect();
            tags.sort();
            f.write_str("@")?;
            for (i, (k, v)) in tags.into_iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                if v.is_empty() {
                    f.write_str(k)?;
                } else {
                    write!(f, "{k}={}", escape_tag_value(v))?;
                }
            }
            f.write_str(" ")?;
        }
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        for p in &self.params {
            write!(f, " {p}")?;
        }
        if !self.trailing.is_empty() {
            write!(f, " :{}", self.trailing)?;
        }
        Ok(())
    }
}

fn parse_tags(s: &str) -> HashMap<String, String> {
    s.split(';')
        .filter(|t| !t.is_empty())
        .map(|t| match t.split_once('=') {
            Some((k, v)) => (k.to_string(), unescape_tag_value(v)),
            None => (t.to_string(), String::new()),
        })
        .collect()
}

fn unescape_tag_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    let mut chars = v.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            // A lone trailing backslash is dropped.
            None => {}
        }
    }
    out
}

fn escape_tag_value(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Prefix a channel name with `#` unless it already has it.
pub fn normalize_channel(name: &str) -> String {
    if name.starts_with(CHANNEL_SIGIL) {
        name.to_string()
    } else {
        format!("{CHANNEL_SIGIL}{name}")
    }
}

pub fn pass(credential: &str) -> Message {
    Message::new("PASS").with_params([credential])
}

pub fn nick(nick: &str) -> Message {
    Message::new("NICK").with_params([nick])
}

/// `CAP REQ :<caps>`, or `None` when there is nothing to request.
pub fn cap_req<S: AsRef<str>>(caps: &[S]) -> Option<Message> {
    if caps.is_empty() {
        return None;
    }
    let caps: Vec<&str> = caps.iter().map(AsRef::as_ref).collect();
    Some(Message::new("CAP").with_params(["REQ"]).with_trailing(caps.join(" ")))
}

/// Single comma-joined `JOIN`, or `None` for an empty channel list.
pub fn join<S: AsRef<str>>(channels: &[S]) -> Option<Message> {
    if channels.is_empty() {
        return None;
    }
    let channels: Vec<String> = channels
        .iter()
        .map(|c| normalize_channel(c.as_ref()))
        .collect();
    Some(Message::new("JOIN").with_params([channels.join(",")]))
}

pub fn privmsg(channel: &str, text: &str) -> Message {
    Message::new("PRIVMSG")
        .with_params([normalize_channel(channel)])
        .with_trailing(text)
}

pub fn quit() -> Message {
    Message::new("QUIT")
}
