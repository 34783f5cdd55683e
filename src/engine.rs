//! The boundary between dispatch and the network event engine.
//!
//! An [`Engine`] accepts sockets, parses HTTP requests and WebSocket frames,
//! and hands them to the poll thread as [`Event`]s. The dispatch layer never
//! touches sockets directly; it answers through `send`, `send_frame` and
//! `decline`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::frame::Opcode;

/// Opaque handle for one client connection. Never reused by an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A fully received HTTP request as parsed by the engine.
#[derive(Debug, Clone, Default)]
pub struct ParsedMessage {
    pub method: String,
    /// Request target, including any query string.
    pub path: String,
    /// Minor HTTP version: `1` for HTTP/1.1, `0` for HTTP/1.0.
    pub version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote_addr: Option<SocketAddr>,
}

impl ParsedMessage {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            version: 1,
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// The path without its query string.
    pub fn url(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(url, _)| url)
    }

    pub fn query_string(&self) -> Option<&str> {
        self.path.split_once('?').map(|(_, query)| query)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    // Intent: calculate connection persistence from HTTP headers and version.
    // Result: HTTP/1.1 stays open unless told to close; HTTP/1.0 only on request.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection").unwrap_or_default().to_ascii_lowercase();
        if self.version == 1 {
            !connection.contains("close")
        } else {
            connection.contains("keep-alive")
        }
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        self.header("Upgrade")
            .map_or(false, |value| value.eq_ignore_ascii_case("websocket"))
            && self.header("Sec-WebSocket-Key").is_some()
    }
}

pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Something the engine observed during a poll tick.
#[derive(Debug, Clone)]
pub enum Event {
    HttpRequest(ConnectionId, ParsedMessage),
    /// The handshake response has already been sent by the engine.
    WebSocketUpgrade(ConnectionId, ParsedMessage),
    /// A data or continuation frame. `fin` marks the last fragment of a message.
    WebSocketFrame {
        connection: ConnectionId,
        payload: Vec<u8>,
        fin: bool,
    },
    /// The peer sent a close frame.
    WebSocketClose(ConnectionId),
    /// The connection is gone.
    Closed(ConnectionId),
}

/// Interrupts a blocked `poll_once` from another thread.
pub trait Wake: Send + Sync {
    fn wake(&self) -> io::Result<()>;
}

impl Wake for mio::Waker {
    fn wake(&self) -> io::Result<()> {
        mio::Waker::wake(self)
    }
}

/// A network event engine driven by a single poll thread.
pub trait Engine: Send + 'static {
    /// Start listening. Returns the bound address.
    fn bind(&mut self, config: &ServerConfig) -> Result<SocketAddr>;

    /// Wait at most `timeout` for activity and append what happened to `events`.
    fn poll_once(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()>;

    /// Queue raw bytes on a connection.
    fn send(&mut self, connection: ConnectionId, bytes: &[u8]) -> io::Result<()>;

    /// Queue one WebSocket frame on an upgraded connection.
    fn send_frame(&mut self, connection: ConnectionId, opcode: Opcode, payload: &[u8]) -> io::Result<()>;

    /// Close the connection once everything queued on it has been written.
    fn close(&mut self, connection: ConnectionId);

    /// Default handling for a request no controller answered.
    fn decline(&mut self, connection: ConnectionId, message: &ParsedMessage) -> io::Result<()>;

    fn is_open(&self, connection: ConnectionId) -> bool;

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        None
    }

    /// Drop the listener and every connection.
    fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_url_and_query() {
        let message = ParsedMessage::new("GET", "/items?x=5&y=6");
        assert_eq!(message.url(), "/items");
        assert_eq!(message.query_string(), Some("x=5&y=6"));
        assert_eq!(ParsedMessage::new("GET", "/").query_string(), None);
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        let mut message = ParsedMessage::new("GET", "/");
        assert!(message.keep_alive());
        message = message.with_header("connection", "Close");
        assert!(!message.keep_alive());

        let mut legacy = ParsedMessage::new("GET", "/");
        legacy.version = 0;
        assert!(!legacy.keep_alive());
        assert!(legacy.with_header("Connection", "keep-alive").keep_alive());
    }

    #[test]
    fn detects_websocket_upgrade() {
        let message = ParsedMessage::new("GET", "/ws")
            .with_header("Upgrade", "WebSocket")
            .with_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        assert!(message.is_websocket_upgrade());
        assert!(!ParsedMessage::new("GET", "/ws").is_websocket_upgrade());
    }
}
