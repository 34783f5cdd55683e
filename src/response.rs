/// An HTTP response produced by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    code: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// An empty `200 OK` response.
    pub fn new() -> Self {
        Self::with_code(200)
    }

    pub fn with_code(code: u16) -> Self {
        Self {
            code,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// A `200 OK` plain-text response.
    pub fn text(body: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.set_header("Content-Type", "text/plain; charset=utf-8");
        response.body = body.into().into_bytes();
        response
    }

    pub fn html(body: impl Into<String>) -> Self {
        let mut response = Self::new();
        response.set_header("Content-Type", "text/html; charset=utf-8");
        response.body = body.into().into_bytes();
        response
    }

    pub fn not_found() -> Self {
        let mut response = Self::text("Not Found");
        response.code = 404;
        response
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn set_code(&mut self, code: u16) -> &mut Self {
        self.code = code;
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Append raw bytes to the body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        self.body.extend_from_slice(data.as_ref());
        self
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Set a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers
            .push(("Set-Cookie".to_string(), format!("{name}={value}; Path=/")));
        self
    }

    // Intent: serialise the response for the engine, owning framing headers.
    // Result: status line, caller headers, Connection and Content-Length, then the body.
    pub(crate) fn to_bytes(&self, version: u8, keep_alive: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.{} {} {}\r\n", version, self.code, reason_phrase(self.code)).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("connection")
                || name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if keep_alive {
            out.extend_from_slice(b"Connection: Keep-Alive\r\n");
        } else {
            out.extend_from_slice(b"Connection: close\r\n");
        }
        out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(&self.body);
        out
    }
}

pub(crate) fn reason_phrase(code: u16) -> &'static str {
    match code {
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
