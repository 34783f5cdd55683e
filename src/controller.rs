//! Controllers and the dispatch chain.
//!
//! ```text
//! Request ─▶ controller[0].process ─▶ None ─▶ controller[1].process ─▶ Some(Response) ✔
//!                                                                    (later ones skipped)
//! ```
//!
//! Controllers are owned by the server for its whole lifetime. `process` and
//! the WebSocket callbacks run on the poll thread; `handles` may also be asked
//! from the controlling thread, so each controller sits behind its own lock.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::request::Request;
use crate::response::Response;
use crate::sessions::Sessions;
use crate::websocket::{WebSocket, WebSockets};

/// Application code plugged into the server.
pub trait Controller: Send {
    /// Called once, when the controller is registered.
    fn setup(&mut self) {}

    /// Whether `process` would answer this method and URL. Must not have side effects.
    fn handles(&self, method: &str, url: &str) -> bool;

    /// Produce a response, or decline with `None` to let the next controller try.
    fn process(&mut self, request: &Request, sessions: &mut Sessions) -> Option<Response>;

    /// A socket finished its handshake. `others` holds every other live socket.
    fn web_socket_ready(&mut self, _websocket: &mut WebSocket, _others: &mut WebSockets, _sessions: &mut Sessions) {}

    /// A complete message arrived on `websocket`. Frames queued on `others`
    /// (for instance through [`WebSockets::send_all`]) go out after the round.
    fn web_socket_data(
        &mut self,
        _websocket: &mut WebSocket,
        _data: &[u8],
        _others: &mut WebSockets,
        _sessions: &mut Sessions,
    ) {
    }
}

/// The ordered controller list. Clones share the same controllers.
#[derive(Default, Clone)]
pub struct Chain {
    controllers: Vec<Arc<Mutex<Box<dyn Controller>>>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut controller: Box<dyn Controller>) {
        controller.setup();
        self.controllers.push(Arc::new(Mutex::new(controller)));
    }

    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn handles(&self, method: &str, url: &str) -> bool {
        self.controllers
            .iter()
            .any(|controller| controller.lock().handles(method, url))
    }

    // Intent: walk the controllers in registration order.
    // Result: the first response produced wins; None when every controller declined.
    pub fn dispatch(&mut self, request: &Request, sessions: &mut Sessions) -> Option<Response> {
        self.controllers
            .iter()
            .find_map(|controller| controller.lock().process(request, sessions))
    }

    pub fn web_socket_ready(&mut self, websocket: &mut WebSocket, others: &mut WebSockets, sessions: &mut Sessions) {
        for controller in &self.controllers {
            controller.lock().web_socket_ready(websocket, others, sessions);
        }
    }

    pub fn web_socket_data(
        &mut self,
        websocket: &mut WebSocket,
        data: &[u8],
        others: &mut WebSockets,
        sessions: &mut Sessions,
    ) {
        for controller in &self.controllers {
            controller.lock().web_socket_data(websocket, data, others, sessions);
        }
    }
}

type Handler = Box<dyn FnMut(&Request, &mut Sessions) -> Response + Send>;

struct Route {
    method: String,
    url: String,
    handler: Handler,
}

/// A controller that answers a fixed table of `(method, url)` routes.
///
/// ```
/// use switchyard::{Response, RouteController};
///
/// let items = RouteController::new()
///     .prefix("/api")
///     .route("GET", "/items", |request, _| Response::text(request.get("x", "0")));
/// assert_eq!(items.routes(), vec!["GET /api/items".to_string()]);
/// ```
#[derive(Default)]
pub struct RouteController {
    prefix: String,
    routes: Vec<Route>,
}

impl RouteController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepended to every route registered afterwards.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_end_matches('/').to_string();
        self
    }

    pub fn route<F>(mut self, method: &str, url: &str, handler: F) -> Self
    where
        F: FnMut(&Request, &mut Sessions) -> Response + Send + 'static,
    {
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            url: format!("{}{}", self.prefix, url),
            handler: Box::new(handler),
        });
        self
    }

    pub fn routes(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|route| format!("{} {}", route.method, route.url))
            .collect()
    }

    fn position(&self, method: &str, url: &str) -> Option<usize> {
        self.routes
            .iter()
            .position(|route| route.method.eq_ignore_ascii_case(method) && route.url == url)
    }
}

impl Controller for RouteController {
    fn setup(&mut self) {
        for route in self.routes() {
            tracing::debug!(route = %route, "registered route");
        }
    }

    fn handles(&self, method: &str, url: &str) -> bool {
        self.position(method, url).is_some()
    }

    fn process(&mut self, request: &Request, sessions: &mut Sessions) -> Option<Response> {
        let index = self.position(request.method(), request.url())?;
        Some((self.routes[index].handler)(request, sessions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ParsedMessage;

    struct Fixed {
        url: &'static str,
        body: &'static str,
    }

    impl Controller for Fixed {
        fn handles(&self, _method: &str, url: &str) -> bool {
            url == self.url
        }

        fn process(&mut self, request: &Request, _sessions: &mut Sessions) -> Option<Response> {
            self.handles(request.method(), request.url())
                .then(|| Response::text(self.body))
        }
    }

    fn request(path: &str) -> Request {
        Request::new(ParsedMessage::new("GET", path))
    }

    #[test]
    fn first_responder_wins_in_registration_order() {
        let mut sessions = Sessions::default();
        let mut chain = Chain::new();
        chain.push(Box::new(Fixed { url: "/a", body: "first" }));
        chain.push(Box::new(Fixed { url: "/a", body: "second" }));
        let response = chain.dispatch(&request("/a"), &mut sessions).unwrap();
        assert_eq!(response.body(), b"first");

        let mut reversed = Chain::new();
        reversed.push(Box::new(Fixed { url: "/a", body: "second" }));
        reversed.push(Box::new(Fixed { url: "/a", body: "first" }));
        let response = reversed.dispatch(&request("/a"), &mut sessions).unwrap();
        assert_eq!(response.body(), b"second");

        assert!(chain.dispatch(&request("/b"), &mut sessions).is_none());
    }

    #[test]
    fn clones_see_the_same_controllers() {
        let mut chain = Chain::new();
        let snapshot = chain.clone();
        chain.push(Box::new(Fixed { url: "/a", body: "a" }));
        assert!(!snapshot.handles("GET", "/a"));

        let shared = chain.clone();
        assert!(shared.handles("GET", "/a"));
        assert!(!shared.handles("GET", "/b"));
        assert_eq!(shared.len(), 1);
    }

    #[test]
    fn routes_respect_prefix_and_method() {
        let mut sessions = Sessions::default();
        let mut routes = RouteController::new()
            .prefix("/api/")
            .route("get", "/items", |request, _| Response::text(request.get("x", "?")));
        assert!(routes.handles("GET", "/api/items"));
        assert!(!routes.handles("POST", "/api/items"));
        assert!(!routes.handles("GET", "/items"));

        let response = routes.process(&request("/api/items?x=5"), &mut sessions).unwrap();
        assert_eq!(response.body(), b"5");
        assert!(routes.process(&request("/api/other"), &mut sessions).is_none());
    }
}
