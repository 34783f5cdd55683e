//! Server lifecycle and the poll thread.
//!
//! ```text
//!   Created ──start()──▶ Running ──stop()──▶ Stopping ──(poll thread exits)──▶ Stopped
//! ```
//!
//! Everything the poll thread needs (engine, controllers, sessions, the
//! WebSocket registry) lives in a [`Dispatcher`] that is moved onto the thread
//! at `start()` and handed back through the join handle at `stop()`. The
//! controlling thread shares only a few things with it: the flags, the
//! request counter, the in-flight map, and the locked controllers for `handles`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::controller::{Chain, Controller};
use crate::engine::{ConnectionId, Engine, Event, ParsedMessage, Wake};
use crate::error::{Error, Result};
use crate::frame::Opcode;
use crate::net::MioEngine;
use crate::request::Request;
use crate::sessions::Sessions;
use crate::websocket::{WebSocket, WebSockets};

const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A request currently being processed by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub method: String,
    pub url: String,
    pub since: Instant,
}

/// Request totals since `start()`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    pub requests: u64,
    pub uptime: Duration,
}

impl Stats {
    pub fn requests_per_sec(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.requests as f64 / secs
        } else {
            0.0
        }
    }
}

struct Shared {
    destroyed: AtomicBool,
    requests: AtomicU64,
    in_flight: Mutex<HashMap<ConnectionId, InFlight>>,
}

/// Poll-thread state. Nothing in here is locked: only one thread ever holds it.
struct Dispatcher<E> {
    engine: E,
    chain: Chain,
    sessions: Sessions,
    websockets: WebSockets,
    shared: Arc<Shared>,
    poll_interval: Duration,
    last_sweep: Instant,
}

impl<E: Engine> Dispatcher<E> {
    fn run(mut self, stop: Arc<AtomicBool>) -> Self {
        tracing::debug!(interval_ms = self.poll_interval.as_millis() as u64, "poll thread running");
        let mut events = Vec::new();
        while !stop.load(Ordering::Acquire) {
            if let Err(err) = self.engine.poll_once(self.poll_interval, &mut events) {
                tracing::error!(error = %err, "engine poll failed");
                std::thread::sleep(Duration::from_millis(10));
            }
            for event in events.drain(..) {
                self.dispatch(event);
            }
            self.flush_websockets();
            self.sweep_sessions();
        }

        self.engine.shutdown();
        self.shared.destroyed.store(true, Ordering::Release);
        tracing::debug!("poll thread exited");
        self
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::HttpRequest(connection, message) => self.handle_request(connection, message),
            Event::WebSocketUpgrade(connection, message) => self.web_socket_ready(connection, &message),
            Event::WebSocketFrame {
                connection,
                payload,
                fin,
            } => match self.websockets.get_mut(connection) {
                Some(websocket) => websocket.append(&payload, fin),
                None => tracing::trace!(connection = %connection, "frame for unregistered websocket"),
            },
            Event::WebSocketClose(connection) | Event::Closed(connection) => {
                if let Some(websocket) = self.websockets.get_mut(connection) {
                    websocket.mark_closed();
                }
            }
        }
    }

    /// Run one controller callback on `connection`'s socket, with the rest of
    /// the registry handed over as `others`.
    fn with_websocket<F>(&mut self, connection: ConnectionId, callback: F)
    where
        F: FnOnce(&mut Chain, &mut WebSocket, &mut WebSockets, &mut Sessions),
    {
        let mut websocket = match self.websockets.remove(connection) {
            Some(websocket) => websocket,
            None => return,
        };
        callback(&mut self.chain, &mut websocket, &mut self.websockets, &mut self.sessions);
        self.websockets.restore(websocket);
    }

    // Intent: turn one parsed message into a response via the controller chain.
    // Result: the winning response is written, or the engine's fallback runs.
    fn handle_request(&mut self, connection: ConnectionId, message: ParsedMessage) {
        let request = Request::new(message);
        self.shared.requests.fetch_add(1, Ordering::Relaxed);
        self.shared.in_flight.lock().insert(
            connection,
            InFlight {
                method: request.method().to_string(),
                url: request.url().to_string(),
                since: Instant::now(),
            },
        );

        let response = self.chain.dispatch(&request, &mut self.sessions);

        self.shared.in_flight.lock().remove(&connection);

        let message = request.message();
        let result = match response {
            Some(response) => {
                tracing::debug!(
                    connection = %connection,
                    method = request.method(),
                    url = request.url(),
                    status = response.code(),
                    "request handled"
                );
                let keep_alive = message.keep_alive();
                let sent = self
                    .engine
                    .send(connection, &response.to_bytes(message.version, keep_alive));
                if !keep_alive {
                    self.engine.close(connection);
                }
                sent
            }
            None => self.engine.decline(connection, message),
        };
        if let Err(err) = result {
            tracing::debug!(connection = %connection, error = %err, "failed to write response");
        }
    }

    fn web_socket_ready(&mut self, connection: ConnectionId, message: &ParsedMessage) {
        self.websockets.add(connection, message.url());
        let engine = &self.engine;
        self.websockets.clean(|id| engine.is_open(id));

        self.with_websocket(connection, |chain, websocket, others, sessions| {
            tracing::debug!(connection = %connection, websocket = websocket.id(), url = websocket.url(), "websocket ready");
            chain.web_socket_ready(websocket, others, sessions);
        });
        self.flush_outboxes();
    }

    fn flush_outbox(&mut self, connection: ConnectionId) {
        let frames = match self.websockets.get_mut(connection) {
            Some(websocket) => websocket.take_outbox(),
            None => return,
        };
        for frame in frames {
            if let Err(err) = self.engine.send_frame(connection, frame.opcode, &frame.payload) {
                tracing::trace!(connection = %connection, error = %err, "dropping websocket frame");
                break;
            }
            if frame.opcode == Opcode::Close {
                self.engine.close(connection);
            }
        }
    }

    // Intent: hand every completed WebSocket packet to the controllers once per tick.
    // Result: buffers are emptied, queued frames written, and closed sockets leave the registry.
    fn flush_websockets(&mut self) {
        for connection in self.websockets.connections() {
            let packet = match self.websockets.get_mut(connection) {
                Some(websocket) if websocket.has_packet() => websocket.flush_data(),
                _ => continue,
            };
            self.with_websocket(connection, |chain, websocket, others, sessions| {
                chain.web_socket_data(websocket, &packet, others, sessions);
            });
        }
        self.flush_outboxes();
    }

    /// Write every queued frame. Closed sockets with nothing left to deliver are dropped.
    fn flush_outboxes(&mut self) {
        for connection in self.websockets.connections() {
            self.flush_outbox(connection);
            let finished = self
                .websockets
                .get(connection)
                .map_or(false, |websocket| websocket.is_closed() && !websocket.has_packet());
            if finished {
                self.websockets.remove(connection);
                tracing::debug!(connection = %connection, "websocket removed");
            }
        }
    }

    fn sweep_sessions(&mut self) {
        let now = Instant::now();
        if now.saturating_duration_since(self.last_sweep) >= SESSION_SWEEP_INTERVAL {
            self.sessions.garbage_collect(now);
            self.last_sweep = now;
        }
    }
}

enum State<E> {
    Created(Dispatcher<E>),
    Running {
        stop: Arc<AtomicBool>,
        waker: Option<Arc<dyn Wake>>,
        handle: JoinHandle<Dispatcher<E>>,
        chain: Chain,
    },
    Stopped(Option<Dispatcher<E>>),
}

/// The dispatch server: an engine, an ordered controller chain and a poll thread.
pub struct Server<E: Engine = MioEngine> {
    config: ServerConfig,
    state: State<E>,
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

impl Server<MioEngine> {
    /// A server on the bundled `mio` engine.
    pub fn new(port: &str, document_root: impl Into<PathBuf>) -> Result<Self> {
        Self::from_config(ServerConfig::new(port, document_root))
    }

    pub fn from_config(config: ServerConfig) -> Result<Self> {
        Ok(Self::with_engine(config, MioEngine::new()?))
    }
}

impl<E: Engine> Server<E> {
    pub fn with_engine(config: ServerConfig, engine: E) -> Self {
        let shared = Arc::new(Shared {
            destroyed: AtomicBool::new(true),
            requests: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        });
        let dispatcher = Dispatcher {
            engine,
            chain: Chain::new(),
            sessions: Sessions::new(config.session_cookie.clone(), config.session_ttl()),
            websockets: WebSockets::new(),
            shared: shared.clone(),
            poll_interval: config.poll_interval(),
            last_sweep: Instant::now(),
        };
        Self {
            config,
            state: State::Created(dispatcher),
            shared,
            local_addr: None,
            started_at: None,
            stopped_at: None,
        }
    }

    fn dispatcher_mut(&mut self) -> Result<&mut Dispatcher<E>> {
        match &mut self.state {
            State::Created(dispatcher) => Ok(dispatcher),
            State::Running { .. } => Err(Error::AlreadyRunning),
            State::Stopped(_) => Err(Error::Stopped),
        }
    }

    /// Append a controller to the chain. Only valid before `start()`.
    pub fn register_controller(&mut self, controller: impl Controller + 'static) -> Result<()> {
        self.dispatcher_mut()?.chain.push(Box::new(controller));
        Ok(())
    }

    /// Set an extra engine option. Unknown keys fail at `start()`.
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        self.dispatcher_mut()?;
        self.config.options.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn set_ssl(&mut self, certificate: impl Into<PathBuf>) -> Result<()> {
        self.dispatcher_mut()?;
        self.config.ssl_certificate = Some(certificate.into());
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    // Intent: bind the engine and hand the dispatcher to a fresh poll thread.
    // Result: the server is Running, or still Created if binding failed.
    pub fn start(&mut self) -> Result<SocketAddr> {
        let mut dispatcher = match std::mem::replace(&mut self.state, State::Stopped(None)) {
            State::Created(dispatcher) => dispatcher,
            running @ State::Running { .. } => {
                self.state = running;
                return Err(Error::AlreadyRunning);
            }
            stopped => {
                self.state = stopped;
                return Err(Error::Stopped);
            }
        };

        let bound = self.config.resolve().and_then(|config| {
            let addr = dispatcher.engine.bind(&config)?;
            Ok((config, addr))
        });
        let (config, addr) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                tracing::error!(port = %self.config.listening_port, error = %err, "failed to start server");
                self.state = State::Created(dispatcher);
                return Err(err);
            }
        };

        dispatcher.sessions = Sessions::new(config.session_cookie.clone(), config.session_ttl());
        dispatcher.poll_interval = config.poll_interval();
        dispatcher.websockets = WebSockets::with_message_limit(config.max_message_bytes);
        let chain = dispatcher.chain.clone();
        let waker = dispatcher.engine.waker();
        let controllers = dispatcher.chain.len();
        let stop = Arc::new(AtomicBool::new(false));
        self.shared.destroyed.store(false, Ordering::Release);

        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("switchyard-poll".to_string())
            .spawn(move || dispatcher.run(thread_stop));
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.destroyed.store(true, Ordering::Release);
                return Err(Error::Io(err));
            }
        };

        tracing::info!(
            address = %addr,
            document_root = %config.document_root.display(),
            controllers,
            "server started"
        );
        self.config = config;
        self.local_addr = Some(addr);
        self.started_at = Some(Instant::now());
        self.state = State::Running {
            stop,
            waker,
            handle,
            chain,
        };
        Ok(addr)
    }

    /// Ask the poll thread to exit and wait until it has released the engine.
    pub fn stop(&mut self) {
        let (stop, waker, handle) = match std::mem::replace(&mut self.state, State::Stopped(None)) {
            State::Running { stop, waker, handle, .. } => (stop, waker, handle),
            other => {
                self.state = other;
                return;
            }
        };

        stop.store(true, Ordering::Release);
        if let Some(waker) = waker {
            if let Err(err) = waker.wake() {
                tracing::warn!(error = %err, "failed to wake poll thread, waiting for the tick");
            }
        }

        self.stopped_at = Some(Instant::now());
        match handle.join() {
            Ok(dispatcher) => self.state = State::Stopped(Some(dispatcher)),
            Err(_) => {
                tracing::error!("poll thread panicked");
                self.shared.destroyed.store(true, Ordering::Release);
            }
        }

        let stats = self.stats();
        tracing::info!(
            requests = stats.requests,
            requests_per_sec = stats.requests_per_sec(),
            "server stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// True once the poll thread has released the engine, or before it ever started.
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether any controller claims this route.
    ///
    /// While serving this waits for a controller that is busy in `process`.
    pub fn handles(&self, method: &str, url: &str) -> Result<bool> {
        match &self.state {
            State::Created(dispatcher) | State::Stopped(Some(dispatcher)) => {
                Ok(dispatcher.chain.handles(method, url))
            }
            State::Running { chain, .. } => Ok(chain.handles(method, url)),
            State::Stopped(None) => Err(Error::Stopped),
        }
    }

    /// Totals for the current run. Uptime stops counting at `stop()`.
    pub fn stats(&self) -> Stats {
        let uptime = match (self.started_at, self.stopped_at) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        };
        Stats {
            requests: self.shared.requests.load(Ordering::Relaxed),
            uptime,
        }
    }

    /// Requests that a controller is processing right now.
    pub fn in_flight(&self) -> Vec<(ConnectionId, InFlight)> {
        let in_flight = self.shared.in_flight.lock();
        let mut snapshot: Vec<_> = in_flight
            .iter()
            .map(|(connection, request)| (*connection, request.clone()))
            .collect();
        snapshot.sort_by_key(|(connection, _)| *connection);
        snapshot
    }

    /// Sessions held by a server that is not currently serving.
    pub fn sessions(&self) -> Option<&Sessions> {
        match &self.state {
            State::Created(dispatcher) | State::Stopped(Some(dispatcher)) => Some(&dispatcher.sessions),
            _ => None,
        }
    }
}

impl<E: Engine> Drop for Server<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
