//! Control messages and their line-oriented text codec.
//!
//! One message per line:
//!
//! ```text
//! [<from>'>'<to> ]COMMAND[ key=value;key=value…]
//! ```
//!
//! `from` and `to` are `server:service` pairs; either side of the `>` may
//! be empty. The command is `[A-Z0-9_]+`. Parameter values escape `\`,
//! `;`, `=` and line breaks so a message always fits on one line. The
//! framing itself (newline-delimited) is supplied by the transport.

use crate::ModelError;
use std::collections::BTreeMap;
use std::fmt;

/// A `server:service` pair naming a message origin or destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Address {
    pub server: String,
    pub service: String,
}

impl Address {
    pub fn new(server: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            service: service.into(),
        }
    }

    /// Address a service on whichever server runs it.
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            server: String::new(),
            service: service.into(),
        }
    }

    fn parse(text: &str) -> Result<Self, ModelError> {
        let (server, service) = text
            .split_once(':')
            .ok_or_else(|| ModelError::MalformedAddress(text.to_string()))?;
        Ok(Self::new(server, service))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server, self.service)
    }
}

/// One framed control message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub command: String,
    pub from: Option<Address>,
    pub to: Option<Address>,
    params: BTreeMap<String, String>,
}

impl Message {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    /// Start a reply: the original sender becomes the destination.
    pub fn reply_to(msg: &Message, command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            from: msg.to.clone(),
            to: msg.from.clone(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn set_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn has_param(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Encode to the one-line wire form (without the trailing newline).
    pub fn to_line(&self) -> String {
        let mut line = String::new();
        if self.from.is_some() || self.to.is_some() {
            if let Some(from) = &self.from {
                line.push_str(&from.to_string());
            }
            line.push('>');
            if let Some(to) = &self.to {
                line.push_str(&to.to_string());
            }
            line.push(' ');
        }
        line.push_str(&self.command);
        if !self.params.is_empty() {
            line.push(' ');
            let mut first = true;
            for (key, value) in &self.params {
                if !first {
                    line.push(';');
                }
                first = false;
                line.push_str(key);
                line.push('=');
                line.push_str(&escape_param(value));
            }
        }
        line
    }

    /// Decode a single line.
    pub fn from_line(line: &str) -> Result<Self, ModelError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ModelError::EmptyMessage);
        }

        let (first, rest) = match line.split_once(' ') {
            Some((first, rest)) => (first, Some(rest)),
            None => (line, None),
        };

        let (envelope, command, params_text) = if first.contains('>') {
            let rest = rest.ok_or_else(|| ModelError::InvalidCommand(String::new()))?;
            let (command, params_text) = match rest.split_once(' ') {
                Some((command, params_text)) => (command, Some(params_text)),
                None => (rest, None),
            };
            (Some(first), command, params_text)
        } else {
            (None, first, rest)
        };

        if command.is_empty()
            || !command
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(ModelError::InvalidCommand(command.to_string()));
        }

        let mut msg = Message::new(command);
        if let Some(envelope) = envelope {
            // split is total: `first.contains('>')` held above
            let (from, to) = envelope.split_once('>').unwrap_or((envelope, ""));
            if !from.is_empty() {
                msg.from = Some(Address::parse(from)?);
            }
            if !to.is_empty() {
                msg.to = Some(Address::parse(to)?);
            }
        }

        if let Some(params_text) = params_text {
            for piece in split_unescaped(params_text, ';') {
                if piece.is_empty() {
                    continue;
                }
                let (key, value) = piece
                    .split_once('=')
                    .ok_or_else(|| ModelError::MalformedParameter(piece.clone()))?;
                if key.is_empty() {
                    return Err(ModelError::MalformedParameter(piece.clone()));
                }
                msg.params
                    .insert(key.to_string(), unescape_param(value));
            }
        }

        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

fn escape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ';' => out.push_str("\\;"),
            '=' => out.push_str("\\="),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_param(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some(';') => out.push(';'),
            Some('=') => out.push('='),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split on `sep` at positions not preceded by a backslash, keeping the
/// escapes intact for later unescaping.
fn split_unescaped(text: &str, sep: char) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            current.push(c);
            escaped = true;
        } else if c == sep {
            pieces.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    pieces.push(current);
    pieces
}
