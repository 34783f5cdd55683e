//! Form and query-string variables.
//!
//! Two access paths share one decoder: [`decode_variables`] turns a whole
//! `k1=v1&k2=v2` payload into pairs, while [`get_var`] pulls a single value
//! into a caller-sized buffer and [`read_variable`] wraps it in the
//! grow-and-retry loop.

/// Size of the first buffer handed to a grow-and-retry lookup.
pub const INITIAL_BUFFER_SIZE: usize = 1024;

/// Outcome of copying a value into a fixed-size buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The value was written; it occupies the first `n` bytes.
    Found(usize),
    NotFound,
    /// The destination cannot hold the value. Retry with a larger one.
    TooSmall,
}

/// A percent-escape that is not followed by two hex digits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid percent-escape at byte {position}")]
pub struct DecodeError {
    pub position: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecodeInto {
    Written(usize),
    TooSmall,
    Invalid(DecodeError),
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode `src` into `dst`. With `form` set, `+` decodes to a space.
pub(crate) fn url_decode_into(src: &[u8], dst: &mut [u8], form: bool) -> DecodeInto {
    let mut i = 0;
    let mut j = 0;
    while i < src.len() {
        if j >= dst.len() {
            return DecodeInto::TooSmall;
        }
        dst[j] = match src[i] {
            b'%' => {
                let high = src.get(i + 1).copied().and_then(hex_value);
                let low = src.get(i + 2).copied().and_then(hex_value);
                match (high, low) {
                    (Some(high), Some(low)) => {
                        i += 2;
                        (high << 4) | low
                    }
                    _ => return DecodeInto::Invalid(DecodeError { position: i }),
                }
            }
            b'+' if form => b' ',
            other => other,
        };
        i += 1;
        j += 1;
    }
    DecodeInto::Written(j)
}

/// Percent-decode a whole slice. The output is never longer than the input.
pub fn url_decode(src: &[u8], form: bool) -> Result<Vec<u8>, DecodeError> {
    let mut dst = vec![0u8; src.len()];
    match url_decode_into(src, &mut dst, form) {
        DecodeInto::Written(len) => {
            dst.truncate(len);
            Ok(dst)
        }
        DecodeInto::Invalid(err) => Err(err),
        // Decoding never grows the data.
        DecodeInto::TooSmall => unreachable!("decoded output longer than input"),
    }
}

// Intent: decode every `key=value` pair of a query string or form body.
// Result: callers get all pairs in order, or an error if any single pair is malformed.
pub fn decode_variables(data: &[u8]) -> Result<Vec<(String, String)>, DecodeError> {
    let mut pairs = Vec::new();
    let mut offset = 0;
    for segment in data.split(|byte| *byte == b'&') {
        if !segment.is_empty() {
            let (key, value) = match segment.iter().position(|byte| *byte == b'=') {
                Some(eq) => (&segment[..eq], &segment[eq + 1..]),
                None => (segment, &segment[segment.len()..]),
            };
            let shift = |mut err: DecodeError, base: usize| {
                err.position += base;
                err
            };
            let key = url_decode(key, true).map_err(|err| shift(err, offset))?;
            let value_base = offset + segment.len() - value.len();
            let value = url_decode(value, true).map_err(|err| shift(err, value_base))?;
            pairs.push((
                String::from_utf8_lossy(&key).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            ));
        }
        offset += segment.len() + 1;
    }
    Ok(pairs)
}

/// Find `name` in `data` and decode its value into `dst`.
///
/// The name is matched ASCII case-insensitively and only at the start of the
/// data or right after a `&`. A value with a broken escape counts as absent.
pub fn get_var(data: &[u8], name: &str, dst: &mut [u8]) -> Lookup {
    let name = name.as_bytes();
    if dst.is_empty() {
        return Lookup::TooSmall;
    }
    if name.is_empty() || data.len() <= name.len() {
        return Lookup::NotFound;
    }

    let mut p = 0;
    while p + name.len() < data.len() {
        let at_boundary = p == 0 || data[p - 1] == b'&';
        if at_boundary
            && data[p + name.len()] == b'='
            && data[p..p + name.len()].eq_ignore_ascii_case(name)
        {
            let start = p + name.len() + 1;
            let end = data[start..]
                .iter()
                .position(|byte| *byte == b'&')
                .map_or(data.len(), |idx| start + idx);
            return match url_decode_into(&data[start..end], dst, true) {
                DecodeInto::Written(len) => Lookup::Found(len),
                DecodeInto::TooSmall => Lookup::TooSmall,
                DecodeInto::Invalid(err) => {
                    tracing::debug!(position = err.position, "undecodable variable value");
                    Lookup::NotFound
                }
            };
        }
        p += 1;
    }
    Lookup::NotFound
}

/// Run `attempt` with a buffer that starts at [`INITIAL_BUFFER_SIZE`] and doubles on
/// [`Lookup::TooSmall`]. Doubling stops once the buffer covers `limit` bytes, the
/// length of the raw input, since no extracted value can be longer than that.
pub(crate) fn grow_and_retry<F>(limit: usize, mut attempt: F) -> Option<Vec<u8>>
where
    F: FnMut(&mut [u8]) -> Lookup,
{
    let mut size = INITIAL_BUFFER_SIZE;
    let mut buffer = vec![0u8; size];
    loop {
        match attempt(&mut buffer) {
            Lookup::Found(len) => {
                buffer.truncate(len);
                return Some(buffer);
            }
            Lookup::NotFound => return None,
            Lookup::TooSmall if size >= limit => {
                tracing::warn!(size, limit, "lookup still reports a short buffer, giving up");
                return None;
            }
            Lookup::TooSmall => {
                size *= 2;
                buffer = vec![0u8; size];
            }
        }
    }
}

// Intent: fetch one variable without knowing its length up front.
// Result: the decoded value, byte-exact, or None when the name is absent.
pub fn read_variable(data: &[u8], name: &str) -> Option<String> {
    grow_and_retry(data.len(), |buffer| get_var(data, name, buffer))
        .map(|value| String::from_utf8_lossy(&value).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn decodes_pairs_in_order() {
        let decoded = decode_variables(b"k1=v1&k2=v%32").unwrap();
        assert_eq!(decoded, pairs(&[("k1", "v1"), ("k2", "v2")]));
    }

    #[test]
    fn bare_keys_and_plus_signs() {
        let decoded = decode_variables(b"flag&name=John+Smith&empty=").unwrap();
        assert_eq!(
            decoded,
            pairs(&[("flag", ""), ("name", "John Smith"), ("empty", "")])
        );
    }

    #[test]
    fn any_bad_escape_fails_the_whole_set() {
        assert!(decode_variables(b"bad%").is_err());
        let err = decode_variables(b"ok=1&x=%zz").unwrap_err();
        assert_eq!(err.position, 7);
    }

    #[test]
    fn value_stops_at_next_ampersand() {
        let mut dst = [0u8; 16];
        assert_eq!(get_var(b"a=1&b=two&c=3", "b", &mut dst), Lookup::Found(3));
        assert_eq!(&dst[..3], b"two");
    }

    #[test]
    fn name_must_start_a_pair() {
        let mut dst = [0u8; 16];
        assert_eq!(get_var(b"xb=1", "b", &mut dst), Lookup::NotFound);
        assert_eq!(get_var(b"B=1", "b", &mut dst), Lookup::Found(1));
    }

    #[test]
    fn short_buffer_is_reported() {
        let mut dst = [0u8; 2];
        assert_eq!(get_var(b"k=abcdef", "k", &mut dst), Lookup::TooSmall);
        assert_eq!(get_var(b"k=abcdef", "k", &mut []), Lookup::TooSmall);
    }

    #[test]
    fn grow_and_retry_doubles_until_the_value_fits() {
        let value = "x".repeat(3000);
        let data = format!("pad=1&big={value}&tail=2");
        let mut sizes = Vec::new();
        let found = grow_and_retry(data.len(), |buffer| {
            sizes.push(buffer.len());
            get_var(data.as_bytes(), "big", buffer)
        });
        assert_eq!(sizes, vec![1024, 2048, 4096]);
        assert_eq!(found.unwrap(), value.as_bytes());
        assert_eq!(read_variable(data.as_bytes(), "tail").as_deref(), Some("2"));
    }

    #[test]
    fn grow_and_retry_is_bounded() {
        let mut calls = 0;
        let found = grow_and_retry(5000, |_| {
            calls += 1;
            Lookup::TooSmall
        });
        assert!(found.is_none());
        assert_eq!(calls, 4);
    }
}
