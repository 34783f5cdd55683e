use std::io::Read;

use crate::engine::{header_value, ParsedMessage};

/// Largest request body the engine buffers before giving up on a connection.
pub(crate) const MAX_BODY: usize = 64 * 1024 * 1024;

/// Largest request line plus header block accepted before the blank line.
pub(crate) const MAX_HEADER: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ParseError {
    #[error("invalid request: {0}")]
    Syntax(#[from] httparse::Error),
    #[error("invalid chunk size")]
    ChunkSize,
    #[error("request body of {0} bytes is too large")]
    TooLarge(usize),
    #[error("header section exceeds {MAX_HEADER} bytes")]
    HeadersTooLarge,
}

impl ParseError {
    /// Status code sent back before the connection is closed.
    pub(crate) fn status(&self) -> u16 {
        match self {
            ParseError::HeadersTooLarge => 431,
            ParseError::TooLarge(_) => 413,
            ParseError::Syntax(_) | ParseError::ChunkSize => 400,
        }
    }
}

/// How a read pass over a non-blocking socket ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadState {
    /// The socket would block; everything available was read.
    Drained,
    /// The peer closed its side.
    Closed,
    /// The buffer reached its limit with data possibly still pending.
    Full,
}

// Intent: drain whatever the socket has ready into the connection buffer.
// Result: the caller learns whether the peer closed its side or the buffer filled up.
pub(crate) fn read_available<T: Read>(
    stream: &mut T,
    buffer: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<ReadState> {
    let mut temp = [0_u8; 4096];
    loop {
        if buffer.len() >= limit {
            return Ok(ReadState::Full);
        }
        let want = temp.len().min(limit - buffer.len());
        match stream.read(&mut temp[..want]) {
            Ok(0) => return Ok(ReadState::Closed),
            Ok(read) => buffer.extend_from_slice(&temp[..read]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(ReadState::Drained),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

fn parse_headers(buffer: &[u8]) -> Result<httparse::Status<(ParsedMessage, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(buffer)? {
        httparse::Status::Complete(size) => {
            let header_pairs = request
                .headers
                .iter()
                .map(|header| {
                    (
                        header.name.to_string(),
                        String::from_utf8_lossy(header.value).to_string(),
                    )
                })
                .collect();

            let parsed = ParsedMessage {
                method: request.method.unwrap_or("GET").to_string(),
                path: request.path.unwrap_or("/").to_string(),
                version: request.version.unwrap_or(1),
                headers: header_pairs,
                body: Vec::new(),
                remote_addr: None,
            };
            Ok(httparse::Status::Complete((parsed, size)))
        }
        httparse::Status::Partial => Ok(httparse::Status::Partial),
    }
}

fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|window| window == b"\r\n")
        .map(|idx| from + idx)
}

fn decode_chunked(buffer: &[u8], mut cursor: usize) -> Result<Option<(Vec<u8>, usize)>, ParseError> {
    let mut body = Vec::new();
    loop {
        let line_end = match find_crlf(buffer, cursor) {
            Some(end) => end,
            None => return Ok(None),
        };
        let line = String::from_utf8_lossy(&buffer[cursor..line_end]);
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).map_err(|_| ParseError::ChunkSize)?;
        cursor = line_end + 2;
        if size == 0 {
            // Skip trailers up to the blank line.
            loop {
                let end = match find_crlf(buffer, cursor) {
                    Some(end) => end,
                    None => return Ok(None),
                };
                let blank = end == cursor;
                cursor = end + 2;
                if blank {
                    return Ok(Some((body, cursor)));
                }
            }
        }
        // Sizes come from the client; bound them before any index arithmetic.
        if body.len().checked_add(size).map_or(true, |total| total > MAX_BODY) {
            return Err(ParseError::TooLarge(size));
        }
        let chunk_end = cursor + size;
        if buffer.len() < chunk_end + 2 {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..chunk_end]);
        cursor = chunk_end + 2;
    }
}

// Intent: take the next complete request off the front of a connection buffer.
// Result: the parsed message with its body, or None while bytes are still missing.
pub(crate) fn next_request(buffer: &mut Vec<u8>) -> Result<Option<ParsedMessage>, ParseError> {
    if buffer.is_empty() {
        return Ok(None);
    }
    let (mut request, header_len) = match parse_headers(buffer)? {
        httparse::Status::Complete((_, header_len)) if header_len > MAX_HEADER => {
            return Err(ParseError::HeadersTooLarge)
        }
        httparse::Status::Complete(result) => result,
        httparse::Status::Partial if buffer.len() > MAX_HEADER => return Err(ParseError::HeadersTooLarge),
        httparse::Status::Partial => return Ok(None),
    };

    let content_length = header_value(&request.headers, "Content-Length")
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let is_chunked = header_value(&request.headers, "Transfer-Encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    let (body, consumed) = if is_chunked {
        match decode_chunked(buffer, header_len)? {
            Some(result) => result,
            None => return Ok(None),
        }
    } else {
        if content_length > MAX_BODY {
            return Err(ParseError::TooLarge(content_length));
        }
        let total_len = header_len + content_length;
        if buffer.len() < total_len {
            return Ok(None);
        }
        (buffer[header_len..total_len].to_vec(), total_len)
    };

    buffer.drain(..consumed);
    request.body = body;
    Ok(Some(request))
}
