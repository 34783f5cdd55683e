//! The bundled `mio` engine: plain TCP, HTTP/1.x via `httparse`, RFC 6455 WebSockets.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use crate::config::ServerConfig;
use crate::engine::{ConnectionId, Engine, Event, ParsedMessage, Wake};
use crate::error::{Error, Result};
use crate::frame::{self, Opcode};
use crate::http::{next_request, read_available, ReadState, MAX_BODY, MAX_HEADER};
use crate::response::{reason_phrase, Response};
use crate::vars::url_decode;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;

/// Raw bytes held for one connection before it is refused.
const MAX_BUFFERED: usize = MAX_HEADER + MAX_BODY + 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Http,
    WebSocket,
}

struct Outgoing {
    data: Vec<u8>,
    offset: usize,
}

struct Connection {
    id: ConnectionId,
    stream: TcpStream,
    buffer: Vec<u8>,
    outgoing: VecDeque<Outgoing>,
    mode: Mode,
    close_after_write: bool,
    remote_addr: Option<SocketAddr>,
    wants_write: bool,
}

fn write_outgoing(connection: &mut Connection) -> std::io::Result<bool> {
    while let Some(front) = connection.outgoing.front_mut() {
        match connection.stream.write(&front.data[front.offset..]) {
            Ok(0) => break,
            Ok(written) => {
                front.offset += written;
                if front.offset >= front.data.len() {
                    connection.outgoing.pop_front();
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(!connection.outgoing.is_empty())
}

/// A single-threaded engine over `mio`. Every method runs on the poll thread.
pub struct MioEngine {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    listener: Option<TcpListener>,
    connections: Slab<Connection>,
    index: HashMap<ConnectionId, usize>,
    pending: Vec<Event>,
    next_id: u64,
    document_root: PathBuf,
}

impl MioEngine {
    pub fn new() -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            waker,
            listener: None,
            connections: Slab::with_capacity(1024),
            index: HashMap::new(),
            pending: Vec::new(),
            next_id: 1,
            document_root: PathBuf::from("www"),
        })
    }

    fn accept(&mut self) -> std::io::Result<()> {
        let listener = match self.listener.as_mut() {
            Some(listener) => listener,
            None => return Ok(()),
        };
        loop {
            match listener.accept() {
                Ok((mut stream, addr)) => {
                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key() + FIRST_CONN);
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;
                    let id = ConnectionId::new(self.next_id);
                    self.next_id += 1;
                    self.index.insert(id, entry.key());
                    entry.insert(Connection {
                        id,
                        stream,
                        buffer: Vec::new(),
                        outgoing: VecDeque::new(),
                        mode: Mode::Http,
                        close_after_write: false,
                        remote_addr: Some(addr),
                        wants_write: false,
                    });
                    tracing::trace!(connection = %id, remote = %addr, "accepted connection");
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn remove(&mut self, key: usize) {
        if let Some(mut connection) = self.connections.try_remove(key) {
            let _ = self.poll.registry().deregister(&mut connection.stream);
            self.index.remove(&connection.id);
            self.pending.push(Event::Closed(connection.id));
            tracing::trace!(connection = %connection.id, "connection closed");
        }
    }

    fn queue(connection: &mut Connection, data: Vec<u8>) {
        if !data.is_empty() {
            connection.outgoing.push_back(Outgoing { data, offset: 0 });
        }
    }

    /// Answer with an error and close once it is written. HTTP connections get a
    /// response with `status`, upgraded ones a close frame carrying it.
    fn refuse(connection: &mut Connection, status: u16) {
        let reply = match connection.mode {
            Mode::Http => {
                let mut response = Response::text(reason_phrase(status));
                response.set_code(status);
                response.to_bytes(1, false)
            }
            Mode::WebSocket => frame::encode(Opcode::Close, &frame::close_payload(status)),
        };
        Self::queue(connection, reply);
        connection.close_after_write = true;
        connection.buffer.clear();
    }

    /// Parse everything buffered on a connection into events.
    fn drain_input(connection: &mut Connection, events: &mut Vec<Event>) {
        while connection.mode == Mode::Http && !connection.close_after_write {
            match next_request(&mut connection.buffer) {
                Ok(Some(mut message)) => {
                    message.remote_addr = connection.remote_addr;
                    if message.is_websocket_upgrade() {
                        let key = message.header("Sec-WebSocket-Key").unwrap_or_default();
                        Self::queue(connection, frame::handshake_response(key));
                        connection.mode = Mode::WebSocket;
                        events.push(Event::WebSocketUpgrade(connection.id, message));
                    } else {
                        events.push(Event::HttpRequest(connection.id, message));
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(connection = %connection.id, error = %err, "rejecting malformed request");
                    Self::refuse(connection, err.status());
                }
            }
        }

        while connection.mode == Mode::WebSocket && !connection.close_after_write {
            match frame::decode(&connection.buffer) {
                Ok(Some((decoded, used))) => {
                    connection.buffer.drain(..used);
                    match decoded.opcode {
                        Opcode::Ping => Self::queue(connection, frame::encode(Opcode::Pong, &decoded.payload)),
                        Opcode::Pong => {}
                        Opcode::Close => {
                            Self::queue(connection, frame::encode(Opcode::Close, &[]));
                            connection.close_after_write = true;
                            events.push(Event::WebSocketClose(connection.id));
                        }
                        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                            events.push(Event::WebSocketFrame {
                                connection: connection.id,
                                payload: decoded.payload,
                                fin: decoded.fin,
                            });
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(connection = %connection.id, error = %err, "dropping websocket on bad frame");
                    Self::refuse(connection, err.close_code());
                    events.push(Event::WebSocketClose(connection.id));
                }
            }
        }
    }

    fn handle_ready(&mut self, key: usize, readable: bool, writable: bool, events: &mut Vec<Event>) {
        let connection = match self.connections.get_mut(key) {
            Some(connection) => connection,
            None => return,
        };

        let mut drop_now = false;
        while readable && !connection.close_after_write {
            let state = match read_available(&mut connection.stream, &mut connection.buffer, MAX_BUFFERED) {
                Ok(state) => state,
                Err(err) => {
                    tracing::debug!(connection = %connection.id, error = %err, "read failed");
                    drop_now = true;
                    break;
                }
            };
            Self::drain_input(connection, events);
            match state {
                ReadState::Drained => break,
                ReadState::Closed => {
                    drop_now = true;
                    break;
                }
                // Parsing made no room: the pending message can never fit.
                ReadState::Full if connection.buffer.len() >= MAX_BUFFERED => {
                    tracing::debug!(connection = %connection.id, "input buffer limit reached");
                    let status = match connection.mode {
                        Mode::Http => 413,
                        Mode::WebSocket => frame::CLOSE_TOO_BIG,
                    };
                    Self::refuse(connection, status);
                }
                ReadState::Full => {}
            }
        }
        if writable || !connection.outgoing.is_empty() {
            if let Err(err) = write_outgoing(connection) {
                tracing::debug!(connection = %connection.id, error = %err, "write failed");
                drop_now = true;
            }
        }

        if drop_now || (connection.close_after_write && connection.outgoing.is_empty()) {
            self.remove(key);
            return;
        }
        self.update_interest(key);
    }

    fn update_interest(&mut self, key: usize) {
        let connection = match self.connections.get_mut(key) {
            Some(connection) => connection,
            None => return,
        };
        let wants_write = !connection.outgoing.is_empty();
        if wants_write == connection.wants_write {
            return;
        }
        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = Token(key + FIRST_CONN);
        match self.poll.registry().reregister(&mut connection.stream, token, interest) {
            Ok(()) => connection.wants_write = wants_write,
            Err(err) => {
                tracing::debug!(connection = %connection.id, error = %err, "reregister failed");
                self.remove(key);
            }
        }
    }

    fn with_connection(
        &mut self,
        id: ConnectionId,
        data: Vec<u8>,
    ) -> std::io::Result<()> {
        let key = *self
            .index
            .get(&id)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
        let connection = &mut self.connections[key];
        Self::queue(connection, data);
        if let Err(err) = write_outgoing(connection) {
            self.remove(key);
            return Err(err);
        }
        if connection.close_after_write && connection.outgoing.is_empty() {
            self.remove(key);
            return Ok(());
        }
        self.update_interest(key);
        Ok(())
    }

    fn static_response(&self, message: &ParsedMessage) -> Response {
        if message.method != "GET" && message.method != "HEAD" {
            return Response::not_found();
        }
        let path = match resolve_static_path(&self.document_root, message.url()) {
            Some(path) => path,
            None => return Response::not_found(),
        };
        match std::fs::read(&path) {
            Ok(contents) => {
                let mut response = Response::new();
                response.set_header("Content-Type", content_type(&path));
                if message.method == "GET" {
                    response.write(contents);
                }
                response
            }
            Err(_) => Response::not_found(),
        }
    }
}

/// Map a request URL onto a file under `root`, refusing anything that escapes it.
fn resolve_static_path(root: &Path, url: &str) -> Option<PathBuf> {
    let decoded = url_decode(url.as_bytes(), false).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let mut path = root.to_path_buf();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if path.is_dir() {
        path.push("index.html");
    }
    path.is_file().then_some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()).unwrap_or_default() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl Engine for MioEngine {
    fn bind(&mut self, config: &ServerConfig) -> Result<SocketAddr> {
        if let Some(certificate) = &config.ssl_certificate {
            return Err(Error::TlsUnsupported(certificate.clone()));
        }
        let addr = config.bind_addr()?;
        let mut listener = TcpListener::bind(addr).map_err(|err| Error::bind(addr, err))?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        self.document_root = config.document_root.clone();
        Ok(local)
    }

    fn poll_once(&mut self, timeout: Duration, events: &mut Vec<Event>) -> std::io::Result<()> {
        let timeout = if self.pending.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                (
                    event.token(),
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            match token {
                LISTENER => {
                    if let Err(err) = self.accept() {
                        tracing::warn!(error = %err, "accept failed");
                    }
                }
                WAKER => {}
                token => self.handle_ready(token.0 - FIRST_CONN, readable, writable, events),
            }
        }
        events.append(&mut self.pending);
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, bytes: &[u8]) -> std::io::Result<()> {
        self.with_connection(connection, bytes.to_vec())
    }

    fn send_frame(&mut self, connection: ConnectionId, opcode: Opcode, payload: &[u8]) -> std::io::Result<()> {
        self.with_connection(connection, frame::encode(opcode, payload))
    }

    fn close(&mut self, connection: ConnectionId) {
        if let Some(&key) = self.index.get(&connection) {
            self.connections[key].close_after_write = true;
            if self.connections[key].outgoing.is_empty() {
                self.remove(key);
            }
        }
    }

    fn decline(&mut self, connection: ConnectionId, message: &ParsedMessage) -> std::io::Result<()> {
        let response = self.static_response(message);
        tracing::debug!(
            connection = %connection,
            url = message.url(),
            status = response.code(),
            "no controller answered, using static fallback"
        );
        self.send(connection, &response.to_bytes(message.version, message.keep_alive()))?;
        if !message.keep_alive() {
            self.close(connection);
        }
        Ok(())
    }

    fn is_open(&self, connection: ConnectionId) -> bool {
        self.index.contains_key(&connection)
    }

    fn waker(&self) -> Option<Arc<dyn Wake>> {
        let waker: Arc<dyn Wake> = self.waker.clone();
        Some(waker)
    }

    fn shutdown(&mut self) {
        for mut connection in self.connections.drain() {
            let _ = self.poll.registry().deregister(&mut connection.stream);
        }
        self.index.clear();
        self.pending.clear();
        if let Some(mut listener) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut listener);
        }
    }
}
