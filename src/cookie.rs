use crate::vars::Lookup;

/// Outcome of [`get_cookie`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieLookup {
    Found(usize),
    Absent,
    TooSmall,
    /// No usable destination buffer was supplied.
    Malformed,
}

impl From<CookieLookup> for Lookup {
    fn from(outcome: CookieLookup) -> Self {
        match outcome {
            CookieLookup::Found(len) => Lookup::Found(len),
            CookieLookup::TooSmall => Lookup::TooSmall,
            CookieLookup::Absent | CookieLookup::Malformed => Lookup::NotFound,
        }
    }
}

fn find_ignore_case(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Locate the raw value of cookie `name` inside a `Cookie` header value.
///
/// Matching on `name=` is case-insensitive and literal. The value ends at the
/// next space, minus a trailing `;`, and loses one pair of surrounding quotes.
pub(crate) fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a [u8]> {
    let bytes = header.as_bytes();
    let name = name.as_bytes();
    let mut from = 0;
    while let Some(at) = find_ignore_case(bytes, name, from) {
        let after = at + name.len();
        if bytes.get(after) != Some(&b'=') {
            from = at + 1;
            continue;
        }

        let start = after + 1;
        if bytes.get(start) == Some(&b'"') {
            // Quoted values may contain spaces; the closing quote ends them.
            if let Some(close) = bytes[start + 1..].iter().position(|byte| *byte == b'"') {
                if close > 0 {
                    return Some(&bytes[start + 1..start + 1 + close]);
                }
            }
        }
        let mut end = bytes[start..]
            .iter()
            .position(|byte| *byte == b' ')
            .map_or(bytes.len(), |idx| start + idx);
        if end > start && bytes[end - 1] == b';' {
            end -= 1;
        }
        return Some(&bytes[start..end]);
    }
    None
}

// Intent: copy one cookie value into a caller-sized buffer.
// Result: callers learn the value length, that it is absent, or that they must grow the buffer.
pub fn get_cookie(header: Option<&str>, name: &str, dst: Option<&mut [u8]>) -> CookieLookup {
    let dst = match dst {
        Some(dst) if !dst.is_empty() => dst,
        _ => return CookieLookup::Malformed,
    };
    let header = match header {
        Some(header) if !name.is_empty() => header,
        _ => return CookieLookup::Absent,
    };
    match cookie_value(header, name) {
        None => CookieLookup::Absent,
        Some(value) if value.len() > dst.len() => CookieLookup::TooSmall,
        Some(value) => {
            dst[..value.len()].copy_from_slice(value);
            CookieLookup::Found(value.len())
        }
    }
}
