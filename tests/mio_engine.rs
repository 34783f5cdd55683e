use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use switchyard::{
    Controller, Request, Response, RouteController, Server, ServerConfig, Sessions, WebSocket, WebSockets,
};

struct Echo;

impl Controller for Echo {
    fn handles(&self, _method: &str, _url: &str) -> bool {
        false
    }

    fn process(&mut self, _request: &Request, _sessions: &mut Sessions) -> Option<Response> {
        None
    }

    fn web_socket_data(&mut self, websocket: &mut WebSocket, data: &[u8], _others: &mut WebSockets, _sessions: &mut Sessions) {
        websocket.send(format!("echo:{}", String::from_utf8_lossy(data)));
    }
}

fn serve(root: &std::path::Path) -> (Server, SocketAddr) {
    let mut config = ServerConfig::new("127.0.0.1:0", root);
    config.poll_interval_ms = 20;
    let mut server = Server::from_config(config).unwrap();
    server
        .register_controller(RouteController::new().route("GET", "/hello", |request, _| {
            Response::text(format!("hi {}", request.get("name", "stranger")))
        }))
        .unwrap();
    server.register_controller(Echo).unwrap();
    let addr = server.start().unwrap();
    (server, addr)
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn fetch(addr: SocketAddr, request: &str) -> String {
    let mut stream = connect(addr);
    stream.write_all(request.as_bytes()).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

fn read_until(stream: &mut TcpStream, done: impl Fn(&[u8]) -> bool) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0u8; 1024];
    while !done(&received) {
        let read = stream.read(&mut chunk).unwrap();
        assert!(read > 0, "connection closed early");
        received.extend_from_slice(&chunk[..read]);
    }
    received
}

fn masked_text(payload: &[u8]) -> Vec<u8> {
    let mask = [0x11, 0x22, 0x33, 0x44];
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
    frame
}

#[test]
fn controllers_answer_over_tcp() {
    let root = tempfile::tempdir().unwrap();
    let (mut server, addr) = serve(root.path());

    let response = fetch(addr, "GET /hello?name=ada HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\nhi ada"), "{response}");

    server.stop();
    assert!(server.is_destroyed());
}

#[test]
fn keep_alive_serves_several_requests() {
    let root = tempfile::tempdir().unwrap();
    let (_server, addr) = serve(root.path());
    let mut stream = connect(addr);

    stream
        .write_all(b"GET /hello?name=one HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    let first = read_until(&mut stream, |data| data.ends_with(b"hi one"));
    assert!(String::from_utf8_lossy(&first).contains("Connection: Keep-Alive"));

    stream
        .write_all(b"GET /hello?name=two HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();
    read_until(&mut stream, |data| data.ends_with(b"hi two"));
}

#[test]
fn unanswered_requests_fall_back_to_static_files() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("notes.txt"), "static body").unwrap();
    let (_server, addr) = serve(root.path());

    let found = fetch(addr, "GET /notes.txt HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    assert!(found.starts_with("HTTP/1.1 200 OK\r\n"), "{found}");
    assert!(found.contains("Content-Type: text/plain"), "{found}");
    assert!(found.ends_with("static body"), "{found}");

    let missing = fetch(addr, "GET /missing.txt HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"), "{missing}");

    let escaped = fetch(addr, "GET /../etc/passwd HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    assert!(escaped.starts_with("HTTP/1.1 404 Not Found\r\n"), "{escaped}");
}

#[test]
fn malformed_requests_get_a_bad_request() {
    let root = tempfile::tempdir().unwrap();
    let (_server, addr) = serve(root.path());

    let response = fetch(addr, "GET /hello HTTP/1.1\r\nBad Header Line\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
}

#[test]
fn websocket_handshake_and_echo() {
    let root = tempfile::tempdir().unwrap();
    let (_server, addr) = serve(root.path());
    let mut stream = connect(addr);

    let key = "dGhlIHNhbXBsZSBub25jZQ==";
    stream
        .write_all(
            format!(
                "GET /chat HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
                 Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n\r\n"
            )
            .as_bytes(),
        )
        .unwrap();
    let handshake = read_until(&mut stream, |data| data.windows(4).any(|window| window == b"\r\n\r\n"));
    let handshake = String::from_utf8_lossy(&handshake);
    assert!(handshake.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{handshake}");
    assert!(handshake.contains(&format!("Sec-WebSocket-Accept: {}\r\n", switchyard::ws::accept_key(key))));
    assert!(handshake.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));

    stream.write_all(&masked_text(b"ping me")).unwrap();
    let reply = read_until(&mut stream, |data| data.len() >= 2 && data.len() >= 2 + data[1] as usize);
    assert_eq!(reply[0], 0x81);
    assert_eq!(&reply[2..2 + reply[1] as usize], b"echo:ping me");
}

#[test]
fn fragmented_control_frames_close_the_socket() {
    let root = tempfile::tempdir().unwrap();
    let (_server, addr) = serve(root.path());
    let mut stream = connect(addr);

    stream
        .write_all(
            b"GET /chat HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();
    let handshake = read_until(&mut stream, |data| data.windows(4).any(|window| window == b"\r\n\r\n"));
    let header_end = handshake.windows(4).position(|window| window == b"\r\n\r\n").unwrap() + 4;

    // Ping without FIN, masked, empty payload.
    stream.write_all(&[0x09, 0x80, 1, 2, 3, 4]).unwrap();
    let mut rest = handshake[header_end..].to_vec();
    let mut chunk = [0u8; 64];
    while rest.len() < 4 {
        let read = stream.read(&mut chunk).unwrap();
        assert!(read > 0, "connection closed before the close frame");
        rest.extend_from_slice(&chunk[..read]);
    }
    assert_eq!(&rest[..4], &[0x88, 0x02, 0x03, 0xEA]);
}
