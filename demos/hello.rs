//! Serves a couple of routes, a WebSocket chat room and static files from `./www`.
//!
//! ```text
//! cargo run --example hello -- 8080
//! curl 'http://localhost:8080/hello?name=you'
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use switchyard::{Controller, Request, Response, RouteController, Server, Sessions, WebSocket, WebSockets};

struct Chat;

impl Controller for Chat {
    fn handles(&self, _method: &str, _url: &str) -> bool {
        false
    }

    fn process(&mut self, _request: &Request, _sessions: &mut Sessions) -> Option<Response> {
        None
    }

    fn web_socket_ready(&mut self, websocket: &mut WebSocket, others: &mut WebSockets, _sessions: &mut Sessions) {
        tracing::info!(websocket = websocket.id(), url = websocket.url(), "client joined");
        websocket.send(format!("hello #{}", websocket.id()));
        others.send_all(&format!("#{} joined", websocket.id()));
    }

    fn web_socket_data(
        &mut self,
        websocket: &mut WebSocket,
        data: &[u8],
        others: &mut WebSockets,
        _sessions: &mut Sessions,
    ) {
        let text = String::from_utf8_lossy(data);
        match text.as_ref() {
            "quit" => websocket.close(),
            line => others.send_all(&format!("#{}: {line}", websocket.id())),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    switchyard::logging::init("switchyard=debug,hello=info");

    let port = std::env::args().nth(1).unwrap_or_else(|| "8080".to_string());
    let mut server = Server::new(&port, "www")?;

    server.register_controller(
        RouteController::new()
            .route("GET", "/hello", |request, _| {
                Response::text(format!("Hello, {}!", request.get("name", "world")))
            })
            .route("GET", "/counter", |request, sessions| {
                let mut response = Response::new();
                let session = sessions.get(request, &mut response);
                let count = session.get("count", "0").parse::<u64>().unwrap_or(0) + 1;
                session.set("count", count.to_string());
                response.write(format!("visit #{count}"));
                response
            }),
    )?;
    server.register_controller(Chat)?;

    let addr = server.start()?;
    tracing::info!(%addr, "listening, press Enter to stop");

    let stopped = Arc::new(AtomicBool::new(false));
    let flag = stopped.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        flag.store(true, Ordering::Release);
    });
    while !stopped.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_millis(200));
        let stats = server.stats();
        tracing::trace!(requests = stats.requests, in_flight = server.in_flight().len(), "tick");
    }

    server.stop();
    Ok(())
}
