#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use switchyard::{ConnectionId, Engine, Error, Event, Opcode, ParsedMessage, ServerConfig};

/// Everything a scripted engine was fed and everything the server did with it.
#[derive(Debug, Default)]
pub struct Script {
    pub incoming: VecDeque<Event>,
    pub open: HashSet<ConnectionId>,
    pub sent: Vec<(ConnectionId, Vec<u8>)>,
    pub frames: Vec<(ConnectionId, Opcode, Vec<u8>)>,
    pub declined: Vec<(ConnectionId, String)>,
    pub closed: Vec<ConnectionId>,
    pub fail_bind: bool,
    pub polls: usize,
    pub shutdown: bool,
}

/// An engine driven by the test instead of sockets. Clones share one script.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    pub script: Arc<Mutex<Script>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, raw: u64) -> ConnectionId {
        let connection = ConnectionId::new(raw);
        self.script.lock().open.insert(connection);
        connection
    }

    pub fn push(&self, event: Event) {
        self.script.lock().incoming.push_back(event);
    }

    pub fn request(&self, raw: u64, message: ParsedMessage) -> ConnectionId {
        let connection = self.open(raw);
        self.push(Event::HttpRequest(connection, message));
        connection
    }

    pub fn drop_connection(&self, connection: ConnectionId) {
        self.script.lock().open.remove(&connection);
    }

    /// Block until `ready` holds, failing the test after a few seconds.
    pub fn wait_until<F>(&self, what: &str, ready: F)
    where
        F: Fn(&Script) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if ready(&self.script.lock()) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    pub fn sent_to(&self, connection: ConnectionId) -> Vec<String> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| *id == connection)
            .map(|(_, bytes)| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }
}

impl Engine for ScriptedEngine {
    fn bind(&mut self, config: &ServerConfig) -> switchyard::Result<SocketAddr> {
        if self.script.lock().fail_bind {
            return Err(Error::Io(io::Error::from(io::ErrorKind::AddrInUse)));
        }
        config.bind_addr()
    }

    fn poll_once(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        {
            let mut script = self.script.lock();
            script.polls += 1;
            if !script.incoming.is_empty() {
                events.extend(script.incoming.drain(..));
                return Ok(());
            }
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(())
    }

    fn send(&mut self, connection: ConnectionId, bytes: &[u8]) -> io::Result<()> {
        self.script.lock().sent.push((connection, bytes.to_vec()));
        Ok(())
    }

    fn send_frame(&mut self, connection: ConnectionId, opcode: Opcode, payload: &[u8]) -> io::Result<()> {
        self.script
            .lock()
            .frames
            .push((connection, opcode, payload.to_vec()));
        Ok(())
    }

    fn close(&mut self, connection: ConnectionId) {
        let mut script = self.script.lock();
        script.open.remove(&connection);
        script.closed.push(connection);
    }

    fn decline(&mut self, connection: ConnectionId, message: &ParsedMessage) -> io::Result<()> {
        self.script
            .lock()
            .declined
            .push((connection, message.url().to_string()));
        Ok(())
    }

    fn is_open(&self, connection: ConnectionId) -> bool {
        self.script.lock().open.contains(&connection)
    }

    fn shutdown(&mut self) {
        let mut script = self.script.lock();
        script.open.clear();
        script.shutdown = true;
    }
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new("127.0.0.1:0", "www");
    config.poll_interval_ms = 10;
    config
}
