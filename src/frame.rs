//! RFC 6455 framing used by the bundled engine.

use base64::Engine as _;
use sha1::{Digest, Sha1};

const HANDSHAKE_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest frame payload the engine accepts from a client.
pub const MAX_FRAME_PAYLOAD: usize = 16 * 1024 * 1024;

/// Close status for a peer that broke the framing rules.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close status for a message too big to process.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Largest payload a control frame may carry.
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("reserved opcode {0:#x}")]
    BadOpcode(u8),
    #[error("client frames must be masked")]
    Unmasked,
    #[error("frame payload of {0} bytes exceeds the limit")]
    TooLarge(u64),
    #[error("control frames must be final and at most 125 bytes")]
    BadControl,
}

impl FrameError {
    /// Status code carried by the close frame sent in reply.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::TooLarge(_) => CLOSE_TOO_BIG,
            FrameError::BadOpcode(_) | FrameError::Unmasked | FrameError::BadControl => CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// Payload of a close frame carrying `code`.
pub fn close_payload(code: u16) -> Vec<u8> {
    code.to_be_bytes().to_vec()
}

/// `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(HANDSHAKE_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// The `101 Switching Protocols` response for an upgrade request.
pub fn handshake_response(client_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
    .into_bytes()
}

/// Encode a single unmasked, final server frame.
pub fn encode(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | opcode.bits());
    match payload.len() {
        len if len < 126 => out.push(len as u8),
        len if len <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

// Intent: decode one masked client frame from the front of `buf`.
// Result: the frame and how many bytes it used, or None until enough bytes arrive.
pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_bits(buf[0] & 0x0F).ok_or(FrameError::BadOpcode(buf[0] & 0x0F))?;
    if buf[1] & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    let mut cursor = 2;
    let len = match buf[1] & 0x7F {
        126 => {
            if buf.len() < cursor + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            cursor += 2;
            len
        }
        127 => {
            if buf.len() < cursor + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            cursor += 8;
            u64::from_be_bytes(raw)
        }
        len => len as u64,
    };
    if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
        return Err(FrameError::BadControl);
    }
    if len > MAX_FRAME_PAYLOAD as u64 {
        return Err(FrameError::TooLarge(len));
    }
    let len = len as usize;

    if buf.len() < cursor + 4 + len {
        return Ok(None);
    }
    let mask = [buf[cursor], buf[cursor + 1], buf[cursor + 2], buf[cursor + 3]];
    cursor += 4;
    let payload = buf[cursor..cursor + len]
        .iter()
        .enumerate()
        .map(|(i, byte)| byte ^ mask[i % 4])
        .collect();

    Ok(Some((Frame { fin, opcode, payload }, cursor + len)))
}

#[cfg(test)]
pub(crate) fn mask_client_frame(fin: bool, opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    let mask = [0x37, 0xfa, 0x21, 0x3d];
    let mut out = vec![(if fin { 0x80 } else { 0 }) | opcode.bits()];
    match payload.len() {
        len if len < 126 => out.push(0x80 | len as u8),
        len => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, byte)| byte ^ mask[i % 4]));
    out
}
