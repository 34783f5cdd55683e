//! An embeddable HTTP and WebSocket dispatch server.
//!
//! A [`Server`] drives a network [`Engine`] from a dedicated poll thread and
//! routes every request through an ordered chain of [`Controller`]s. The first
//! controller to produce a [`Response`] wins; unanswered requests fall back to
//! the engine (the bundled [`MioEngine`] serves static files).

mod config;
mod controller;
mod cookie;
mod engine;
mod error;
mod frame;
mod http;
pub mod logging;
mod multipart;
mod net;
mod request;
mod response;
mod server;
mod sessions;
mod vars;
mod websocket;

pub use config::{ConfigError, ServerConfig};
pub use controller::{Chain, Controller, RouteController};
pub use cookie::{get_cookie, CookieLookup};
pub use engine::{ConnectionId, Engine, Event, ParsedMessage, Wake};
pub use error::{Error, Result};
pub use frame::{Frame, FrameError, Opcode};
pub use multipart::{parse_multipart, Part, UploadFile};
pub use net::MioEngine;
pub use request::Request;
pub use response::Response;
pub use server::{InFlight, Server, Stats};
pub use sessions::{Session, Sessions};
pub use vars::{decode_variables, get_var, read_variable, url_decode, DecodeError, Lookup};
pub use websocket::{OutgoingFrame, WebSocket, WebSockets};

/// RFC 6455 framing helpers, for engines and tests that speak to clients directly.
pub mod ws {
    pub use crate::frame::{
        accept_key, close_payload, decode, encode, handshake_response, CLOSE_PROTOCOL_ERROR, CLOSE_TOO_BIG,
        MAX_FRAME_PAYLOAD,
    };
}
