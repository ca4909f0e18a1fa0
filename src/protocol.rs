//! Wire protocol: one whitespace-separated request line in, one response line out
//!
//! Requests are `COMMAND arg1 [arg2]` with case-sensitive keywords. Extra
//! tokens are ignored and values cannot contain whitespace. Nodes append
//! `LOCAL` when forwarding so the receiver answers without routing again.

use crate::error::{MeshKvError, Result};
use nom::{
    bytes::complete::{take_while, take_while1},
    multi::many0,
    sequence::preceded,
    IResult,
};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Commands supported by the MeshKV protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Put { key: String, value: String },
    Get { key: String },
    Remove { key: String },
    Range { start: String, end: String },
    Prefix { prefix: String },
}

impl Command {
    /// Request line without the trailing newline, as forwarded to peers
    pub fn to_line(&self) -> String {
        match self {
            Command::Put { key, value } => format!("PUT {} {}", key, value),
            Command::Get { key } => format!("GET {}", key),
            Command::Remove { key } => format!("REMOVE {}", key),
            Command::Range { start, end } => format!("RANGE {} {}", start, end),
            Command::Prefix { prefix } => format!("PREFIX {}", prefix),
        }
    }
}

/// Response types from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Value(String),
    NotFound,
    /// Multi-key result; empty renders as `NONE`
    Keys(Vec<String>),
    /// Bare `ERROR`, used when a forwarded write fails
    Failed,
    /// `ERROR: <reason>`
    Error(String),
    InvalidCommand,
}

impl Response {
    /// Response line without the trailing newline
    pub fn to_line(&self) -> String {
        match self {
            Response::Ok => "OK".to_string(),
            Response::Value(v) => v.clone(),
            Response::NotFound => "NOT_FOUND".to_string(),
            Response::Keys(keys) if keys.is_empty() => "NONE".to_string(),
            Response::Keys(keys) => keys.iter().map(|k| format!("{} ", k)).collect(),
            Response::Failed => "ERROR".to_string(),
            Response::Error(reason) => format!("ERROR: {}", reason),
            Response::InvalidCommand => "INVALID_COMMAND".to_string(),
        }
    }

    /// Serialize response to bytes for network transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut line = self.to_line();
        line.push('\n');
        line.into_bytes()
    }
}

/// Trailing token marking a request forwarded by another node
pub const LOCAL_MARKER: &str = "LOCAL";

/// Whether a request may be routed or fanned out by the receiving node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    /// Client request: route single-key commands, scatter-gather scans
    #[default]
    Cluster,
    /// Forwarded by a peer: answer from this node's store only
    Local,
}

/// A parsed request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub scope: Scope,
}

impl Request {
    /// A request for another node to serve from its own store
    pub fn forwarded(command: Command) -> Self {
        Self {
            command,
            scope: Scope::Local,
        }
    }

    pub fn to_line(&self) -> String {
        match self.scope {
            Scope::Cluster => self.command.to_line(),
            Scope::Local => format!("{} {}", self.command.to_line(), LOCAL_MARKER),
        }
    }
}

/// Parse one request line.
///
/// A missing argument yields [`MeshKvError::Protocol`] with the reason to
/// report; an unknown (or empty) keyword yields [`MeshKvError::InvalidCommand`].
/// Tokens past the command's arguments are ignored, except a [`LOCAL_MARKER`]
/// directly after them.
pub fn parse_request(line: &str) -> Result<Request> {
    let (_, tokens) = tokens(line)
        .map_err(|e| MeshKvError::Protocol(format!("Failed to tokenize request: {:?}", e)))?;
    let (keyword, args) = match tokens.split_first() {
        Some((keyword, args)) => (*keyword, args),
        None => ("", &[][..]),
    };
    let arg = |i: usize| args.get(i).map(|a| a.to_string());

    let (command, arity) = match keyword {
        "PUT" => match (arg(0), arg(1)) {
            (Some(key), Some(value)) => (Command::Put { key, value }, 2),
            _ => return Err(usage("PUT requires key and value")),
        },
        "GET" => match arg(0) {
            Some(key) => (Command::Get { key }, 1),
            None => return Err(usage("GET requires key")),
        },
        "REMOVE" => match arg(0) {
            Some(key) => (Command::Remove { key }, 1),
            None => return Err(usage("REMOVE requires key")),
        },
        "RANGE" => match (arg(0), arg(1)) {
            (Some(start), Some(end)) => (Command::Range { start, end }, 2),
            _ => return Err(usage("RANGE requires start and end keys")),
        },
        "PREFIX" => match arg(0) {
            Some(prefix) => (Command::Prefix { prefix }, 1),
            None => return Err(usage("PREFIX requires prefix")),
        },
        other => return Err(MeshKvError::InvalidCommand(other.to_string())),
    };

    let scope = match args.get(arity) {
        Some(&LOCAL_MARKER) => Scope::Local,
        _ => Scope::Cluster,
    };
    Ok(Request { command, scope })
}

fn usage(reason: &str) -> MeshKvError {
    MeshKvError::Protocol(reason.to_string())
}

/// Split on any whitespace, dropping empty tokens
fn tokens(input: &str) -> IResult<&str, Vec<&str>> {
    many0(preceded(
        take_while(char::is_whitespace),
        take_while1(|c: char| !c.is_whitespace()),
    ))(input)
}

/// Split a peer's multi-key reply into keys.
///
/// `ERROR`, `NONE` and empty replies contribute nothing.
pub fn parse_key_list(reply: &str) -> Vec<String> {
    let reply = strip_line_ending(reply);
    if reply == "ERROR" || reply == "NONE" {
        return Vec::new();
    }
    reply.split_whitespace().map(str::to_string).collect()
}

/// Drop trailing `\r`/`\n` from a peer reply
pub fn strip_line_ending(reply: &str) -> &str {
    reply.trim_end_matches(['\r', '\n'])
}

/// How a connection's request bytes are collected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadMode {
    /// Whatever arrives in one read is the request; a short read truncates it
    #[default]
    SingleRead,
    /// Keep reading until a newline, end of stream or the size bound
    UntilNewline,
}

/// Read one request from `reader` and strip every newline character.
///
/// Returns `None` when the peer closed the connection before sending anything.
pub async fn read_request<R>(reader: &mut R, mode: ReadMode, max_len: usize) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; max_len.max(1)];
    let mut filled = reader.read(&mut buffer).await?;
    if filled == 0 {
        return Ok(None);
    }

    if mode == ReadMode::UntilNewline {
        while filled < buffer.len() && !buffer[..filled].contains(&b'\n') {
            let bytes = reader.read(&mut buffer[filled..]).await?;
            if bytes == 0 {
                break;
            }
            filled += bytes;
        }
    }

    let request = String::from_utf8_lossy(&buffer[..filled]).replace('\n', "");
    Ok(Some(request))
}
