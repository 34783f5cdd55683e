mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use common::{test_config, ScriptedEngine};
use switchyard::{Controller, ParsedMessage, Request, Response, RouteController, Server, Sessions};

/// Claims no routes. Counts the requests that got past its route check.
struct Bystander {
    calls: Arc<AtomicUsize>,
}

impl Controller for Bystander {
    fn handles(&self, _method: &str, _url: &str) -> bool {
        false
    }

    fn process(&mut self, request: &Request, _sessions: &mut Sessions) -> Option<Response> {
        if !self.handles(request.method(), request.url()) {
            return None;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Some(Response::text("bystander"))
    }
}

fn items() -> RouteController {
    RouteController::new().route("GET", "/items", |request, _| {
        Response::text(request.get("x", "missing"))
    })
}

#[test]
fn first_controller_to_answer_wins() {
    let engine = ScriptedEngine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut server = Server::with_engine(test_config(), engine.clone());
    server
        .register_controller(Bystander { calls: calls.clone() })
        .unwrap();
    server.register_controller(items()).unwrap();
    server
        .register_controller(RouteController::new().route("GET", "/items", |_, _| Response::text("shadowed")))
        .unwrap();

    let connection = engine.request(1, ParsedMessage::new("GET", "/items?x=5"));
    server.start().unwrap();
    engine.wait_until("a response", |script| !script.sent.is_empty());
    server.stop();

    let sent = engine.sent_to(connection);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(sent[0].ends_with("\r\n\r\n5"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(engine.script.lock().declined.is_empty());
    assert_eq!(server.stats().requests, 1);
}

#[test]
fn unanswered_requests_go_back_to_the_engine() {
    let engine = ScriptedEngine::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut server = Server::with_engine(test_config(), engine.clone());
    server
        .register_controller(Bystander { calls: calls.clone() })
        .unwrap();
    server.register_controller(items()).unwrap();

    let connection = engine.request(7, ParsedMessage::new("GET", "/nothing/here"));
    server.start().unwrap();
    engine.wait_until("a decline", |script| !script.declined.is_empty());
    server.stop();

    let script = engine.script.lock();
    assert_eq!(script.declined, vec![(connection, "/nothing/here".to_string())]);
    assert!(script.sent.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn connection_close_is_honoured() {
    let engine = ScriptedEngine::new();
    let mut server = Server::with_engine(test_config(), engine.clone());
    server.register_controller(items()).unwrap();

    let closing = engine.request(
        1,
        ParsedMessage::new("GET", "/items?x=1").with_header("Connection", "close"),
    );
    let kept = engine.request(2, ParsedMessage::new("GET", "/items?x=2"));
    server.start().unwrap();
    engine.wait_until("both responses", |script| script.sent.len() == 2);
    server.stop();

    assert!(engine.sent_to(closing)[0].contains("Connection: close\r\n"));
    assert!(engine.sent_to(kept)[0].contains("Connection: Keep-Alive\r\n"));
    assert_eq!(engine.script.lock().closed, vec![closing]);
}

#[test]
fn sessions_follow_the_cookie() {
    let engine = ScriptedEngine::new();
    let mut server = Server::with_engine(test_config(), engine.clone());
    server
        .register_controller(RouteController::new().route("GET", "/visit", |request, sessions| {
            let mut response = Response::new();
            let session = sessions.get(request, &mut response);
            let visits = session.get("visits", "0").parse::<u32>().unwrap_or(0) + 1;
            session.set("visits", visits.to_string());
            response.write(format!("visits={visits}"));
            response
        }))
        .unwrap();

    let first = engine.request(1, ParsedMessage::new("GET", "/visit"));
    server.start().unwrap();
    engine.wait_until("the first visit", |script| script.sent.len() == 1);

    let reply = engine.sent_to(first).remove(0);
    assert!(reply.ends_with("visits=1"));
    let cookie = reply
        .lines()
        .find_map(|line| line.strip_prefix("Set-Cookie: "))
        .and_then(|value| value.split(';').next())
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("sessid="));

    let second = engine.request(2, ParsedMessage::new("GET", "/visit").with_header("Cookie", &cookie));
    engine.wait_until("the second visit", |script| script.sent.len() == 2);
    server.stop();

    let reply = engine.sent_to(second).remove(0);
    assert!(reply.ends_with("visits=2"));
    assert!(!reply.contains("Set-Cookie"));
    assert_eq!(server.sessions().unwrap().len(), 1);
}

/// Blocks inside `process` until the test lets it go.
struct Gate {
    release: mpsc::Receiver<()>,
}

impl Controller for Gate {
    fn handles(&self, _method: &str, url: &str) -> bool {
        url == "/slow"
    }

    fn process(&mut self, request: &Request, _sessions: &mut Sessions) -> Option<Response> {
        if request.url() != "/slow" {
            return None;
        }
        self.release.recv().ok()?;
        Some(Response::text("done"))
    }
}

#[test]
fn in_flight_requests_are_visible_while_processing() {
    let engine = ScriptedEngine::new();
    let (release, gate) = mpsc::channel();
    let mut server = Server::with_engine(test_config(), engine.clone());
    server
        .register_controller(Gate { release: gate })
        .unwrap();

    let connection = engine.request(3, ParsedMessage::new("POST", "/slow?id=1"));
    server.start().unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    let in_flight = loop {
        let in_flight = server.in_flight();
        if !in_flight.is_empty() || std::time::Instant::now() > deadline {
            break in_flight;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    };
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].0, connection);
    assert_eq!(in_flight[0].1.method, "POST");
    assert_eq!(in_flight[0].1.url, "/slow");

    release.send(()).unwrap();
    engine.wait_until("the slow response", |script| !script.sent.is_empty());
    assert!(server.in_flight().is_empty());
    server.stop();
}
