use std::net::IpAddr;

use regex::Regex;

use crate::cookie::get_cookie;
use crate::engine::{header_value, ParsedMessage};
use crate::multipart::{parse_multipart, UploadFile, DEFAULT_NAME_LIMIT};
use crate::vars::{decode_variables, get_var, grow_and_retry, read_variable, DecodeError, Lookup};

/// One inbound HTTP request, immutable for the duration of a dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    message: ParsedMessage,
}

impl Request {
    pub fn new(message: ParsedMessage) -> Self {
        Self { message }
    }

    pub fn method(&self) -> &str {
        &self.message.method
    }

    /// The request path without its query string.
    pub fn url(&self) -> &str {
        self.message.url()
    }

    pub fn query_string(&self) -> Option<&str> {
        self.message.query_string()
    }

    /// Raw request body.
    pub fn data(&self) -> &[u8] {
        &self.message.body
    }

    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.message.remote_addr.map(|addr| addr.ip())
    }

    pub fn message(&self) -> &ParsedMessage {
        &self.message
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.message.header(name)
    }

    /// Body bytes that may hold form variables: url-encoded or untyped bodies only.
    fn form_body(&self) -> Option<&[u8]> {
        let body = self.data();
        if body.is_empty() {
            return None;
        }
        match self.header("Content-Type") {
            None => Some(body),
            Some(kind) if kind
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded") => Some(body),
            Some(_) => None,
        }
    }

    fn sources(&self) -> impl Iterator<Item = &[u8]> {
        self.query_string()
            .map(str::as_bytes)
            .into_iter()
            .chain(self.form_body())
    }

    pub fn has_variable(&self, key: &str) -> bool {
        let mut scratch = [0u8; 1];
        self.sources()
            .any(|data| get_var(data, key, &mut scratch) != Lookup::NotFound)
    }

    /// Look a variable up in the query string, then in a form-encoded body.
    pub fn get(&self, key: &str, fallback: &str) -> String {
        self.sources()
            .find_map(|data| read_variable(data, key))
            .unwrap_or_else(|| fallback.to_string())
    }

    /// Every query-string variable, in order. Empty if any pair fails to decode.
    pub fn variables(&self) -> Vec<(String, String)> {
        self.try_variables().unwrap_or_else(|err| {
            tracing::debug!(url = self.url(), error = %err, "discarding undecodable query string");
            Vec::new()
        })
    }

    pub fn try_variables(&self) -> Result<Vec<(String, String)>, DecodeError> {
        match self.query_string() {
            Some(query) => decode_variables(query.as_bytes()),
            None => Ok(Vec::new()),
        }
    }

    /// The first `Cookie` header, of possibly several, that carries `key`.
    fn cookie_header(&self, key: &str) -> Option<&str> {
        let mut scratch = [0u8; 1];
        self.message
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("Cookie"))
            .map(|(_, value)| value.as_str())
            .find(|value| Lookup::from(get_cookie(Some(*value), key, Some(&mut scratch))) != Lookup::NotFound)
    }

    pub fn has_cookie(&self, key: &str) -> bool {
        self.cookie_header(key).is_some()
    }

    pub fn cookie(&self, key: &str, fallback: &str) -> String {
        let header = match self.cookie_header(key) {
            Some(header) => header,
            None => return fallback.to_string(),
        };
        grow_and_retry(header.len(), |buffer| {
            get_cookie(Some(header), key, Some(buffer)).into()
        })
        .map(|value| String::from_utf8_lossy(&value).into_owned())
        .unwrap_or_else(|| fallback.to_string())
    }

    /// The uploaded file carried by a multipart body.
    ///
    /// Only the first part is extracted; later parts of a multi-file body are ignored.
    pub fn handle_uploads(&self) -> Vec<UploadFile> {
        let is_multipart = header_value(&self.message.headers, "Content-Type")
            .map_or(false, |kind| kind.to_ascii_lowercase().starts_with("multipart/form-data"));
        if !is_multipart {
            return Vec::new();
        }
        parse_multipart(self.data(), DEFAULT_NAME_LIMIT, DEFAULT_NAME_LIMIT)
            .map(|part| vec![part.file])
            .unwrap_or_default()
    }

    /// Match `"METHOD:url"` against an anchored regex and return its capture groups.
    pub fn matches(&self, pattern: &str) -> Option<Vec<String>> {
        let regex = match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => regex,
            Err(err) => {
                tracing::warn!(pattern, error = %err, "invalid route pattern");
                return None;
            }
        };
        let key = format!("{}:{}", self.method(), self.url());
        let captures = regex.captures(&key)?;
        Some(
            captures
                .iter()
                .map(|group| group.map_or_else(String::new, |m| m.as_str().to_string()))
                .collect(),
        )
    }
}
