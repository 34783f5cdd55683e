//! Upgraded connections and the registry that tracks them.
//!
//! The registry lives on the poll thread and is only ever touched from there,
//! which is why neither type carries a lock. Controllers get the socket a
//! callback is about plus the registry of every other socket. Anything they
//! send is queued in an outbox and written by the poll thread once the
//! callback round is over.

use std::collections::HashMap;

use crate::engine::ConnectionId;
use crate::frame::{self, Opcode, MAX_FRAME_PAYLOAD};

/// A frame a controller asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// One live upgraded connection.
#[derive(Debug)]
pub struct WebSocket {
    connection: ConnectionId,
    id: u64,
    url: String,
    data: Vec<u8>,
    limit: usize,
    complete: bool,
    closed: bool,
    outbox: Vec<OutgoingFrame>,
}

impl WebSocket {
    fn new(connection: ConnectionId, id: u64, url: String, limit: usize) -> Self {
        Self {
            connection,
            id,
            url,
            data: Vec::new(),
            limit,
            complete: false,
            closed: false,
            outbox: Vec::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Small registry-assigned number, handy for logging and addressing sockets.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// URL of the upgrade request.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Queue a text frame.
    pub fn send(&mut self, data: impl Into<String>) {
        self.push(Opcode::Text, data.into().into_bytes());
    }

    pub fn send_binary(&mut self, data: impl Into<Vec<u8>>) {
        self.push(Opcode::Binary, data.into());
    }

    /// Queue a close frame. The socket leaves the registry on the next flush.
    pub fn close(&mut self) {
        if !self.closed {
            self.push(Opcode::Close, Vec::new());
            self.closed = true;
        }
    }

    fn push(&mut self, opcode: Opcode, payload: Vec<u8>) {
        if self.closed {
            tracing::debug!(websocket = self.id, "dropping frame queued after close");
            return;
        }
        self.outbox.push(OutgoingFrame { opcode, payload });
    }

    /// Accumulate one received fragment. `fin` marks the end of a message.
    ///
    /// A message that would grow past the limit is discarded and the socket is
    /// closed with status 1009.
    pub(crate) fn append(&mut self, payload: &[u8], fin: bool) {
        if self.closed {
            return;
        }
        if self.data.len() + payload.len() > self.limit {
            tracing::debug!(
                websocket = self.id,
                buffered = self.data.len(),
                incoming = payload.len(),
                limit = self.limit,
                "message too big, closing"
            );
            self.data = Vec::new();
            self.complete = false;
            self.push(Opcode::Close, frame::close_payload(frame::CLOSE_TOO_BIG));
            self.closed = true;
            return;
        }
        self.data.extend_from_slice(payload);
        self.complete = fin;
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn has_packet(&self) -> bool {
        self.complete && !self.data.is_empty()
    }

    /// Take the whole accumulated buffer as one packet.
    pub(crate) fn flush_data(&mut self) -> Vec<u8> {
        self.complete = false;
        std::mem::take(&mut self.data)
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<OutgoingFrame> {
        std::mem::take(&mut self.outbox)
    }
}

/// Live WebSockets keyed by connection. Poll-thread only.
#[derive(Debug)]
pub struct WebSockets {
    sockets: HashMap<ConnectionId, WebSocket>,
    next_id: u64,
    message_limit: usize,
}

impl Default for WebSockets {
    fn default() -> Self {
        Self::with_message_limit(MAX_FRAME_PAYLOAD)
    }
}

impl WebSockets {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose sockets refuse messages larger than `limit` bytes.
    pub fn with_message_limit(limit: usize) -> Self {
        Self {
            sockets: HashMap::new(),
            next_id: 0,
            message_limit: limit,
        }
    }

    /// Register a connection, or return the socket already registered for it.
    pub fn add(&mut self, connection: ConnectionId, url: &str) -> &mut WebSocket {
        let next_id = &mut self.next_id;
        let limit = self.message_limit;
        self.sockets.entry(connection).or_insert_with(|| {
            *next_id += 1;
            WebSocket::new(connection, *next_id, url.to_string(), limit)
        })
    }

    /// Put back a socket taken out with [`WebSockets::remove`].
    pub(crate) fn restore(&mut self, socket: WebSocket) {
        self.sockets.insert(socket.connection, socket);
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&WebSocket> {
        self.sockets.get(&connection)
    }

    pub fn get_mut(&mut self, connection: ConnectionId) -> Option<&mut WebSocket> {
        self.sockets.get_mut(&connection)
    }

    pub fn get_by_id(&mut self, id: u64) -> Option<&mut WebSocket> {
        self.sockets.values_mut().find(|socket| socket.id == id)
    }

    pub fn remove(&mut self, connection: ConnectionId) -> Option<WebSocket> {
        self.sockets.remove(&connection)
    }

    // Intent: purge sockets whose connection the engine no longer holds.
    // Result: every remaining entry maps to an open connection.
    pub fn clean<F>(&mut self, is_open: F) -> usize
    where
        F: Fn(ConnectionId) -> bool,
    {
        let before = self.sockets.len();
        self.sockets.retain(|connection, _| is_open(*connection));
        let purged = before - self.sockets.len();
        if purged > 0 {
            tracing::debug!(purged, remaining = self.sockets.len(), "cleaned websocket registry");
        }
        purged
    }

    /// Queue a text frame on every open socket.
    pub fn send_all(&mut self, data: &str) {
        for socket in self.sockets.values_mut().filter(|socket| !socket.closed) {
            socket.send(data);
        }
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut connections: Vec<_> = self.sockets.keys().copied().collect();
        connections.sort();
        connections
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(raw: u64) -> ConnectionId {
        ConnectionId::new(raw)
    }

    #[test]
    fn add_is_idempotent() {
        let mut registry = WebSockets::new();
        let first = registry.add(conn(1), "/ws").id();
        let again = registry.add(conn(1), "/other").id();
        assert_eq!(first, again);
        assert_eq!(registry.get(conn(1)).unwrap().url(), "/ws");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clean_drops_closed_connections() {
        let mut registry = WebSockets::new();
        registry.add(conn(1), "/ws");
        registry.add(conn(2), "/ws");
        assert_eq!(registry.clean(|id| id != conn(1)), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(conn(1)).is_none());
        assert!(registry.get(conn(2)).is_some());
    }

    #[test]
    fn fragments_flush_as_one_packet() {
        let mut registry = WebSockets::new();
        let socket = registry.add(conn(3), "/ws");
        socket.append(b"hel", false);
        assert!(!socket.has_packet());
        socket.append(b"lo", true);
        assert!(socket.has_packet());
        assert_eq!(socket.flush_data(), b"hello");
        assert!(!socket.has_packet());
    }

    #[test]
    fn nothing_is_queued_after_close() {
        let mut registry = WebSockets::new();
        registry.add(conn(1), "/a");
        registry.add(conn(2), "/b").close();
        registry.send_all("ping");

        let open = registry.get_mut(conn(1)).unwrap().take_outbox();
        assert_eq!(open, vec![OutgoingFrame { opcode: Opcode::Text, payload: b"ping".to_vec() }]);
        let closed = registry.get_mut(conn(2)).unwrap().take_outbox();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].opcode, Opcode::Close);
    }

    #[test]
    fn oversized_messages_close_the_socket() {
        let mut registry = WebSockets::with_message_limit(8);
        let socket = registry.add(conn(5), "/ws");
        socket.append(b"12345", false);
        socket.append(b"6789", true);

        assert!(socket.is_closed());
        assert!(!socket.has_packet());
        assert_eq!(
            socket.take_outbox(),
            vec![OutgoingFrame { opcode: Opcode::Close, payload: vec![0x03, 0xF1] }]
        );
        socket.append(b"more", true);
        assert!(!socket.has_packet());
    }

    #[test]
    fn messages_at_the_limit_are_kept() {
        let mut registry = WebSockets::with_message_limit(8);
        let socket = registry.add(conn(6), "/ws");
        socket.append(b"1234", false);
        socket.append(b"5678", true);
        assert!(!socket.is_closed());
        assert_eq!(socket.flush_data(), b"12345678");
    }

    #[test]
    fn lookup_by_id() {
        let mut registry = WebSockets::new();
        registry.add(conn(10), "/a");
        let id = registry.add(conn(11), "/b").id();
        assert_eq!(registry.get_by_id(id).unwrap().connection(), conn(11));
        assert!(registry.get_by_id(999).is_none());
    }
}
