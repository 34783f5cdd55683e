//! Single-part extraction from `multipart/form-data` bodies.

/// Default cap on the field name and file name of an uploaded part.
pub const DEFAULT_NAME_LIMIT: usize = 1024;

/// One file part of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub field_name: String,
    pub file_name: String,
    pub data: Vec<u8>,
}

/// A successfully extracted part plus the offset of the boundary that ended it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub file: UploadFile,
    pub boundary_offset: usize,
}

const CONTENT_DISPOSITION: &[u8] = b"Content-Disposition: ";

fn header_block_len(buf: &[u8]) -> Option<usize> {
    for (i, window) in buf.windows(2).enumerate() {
        if window == b"\n\n" {
            return Some(i + 2);
        }
        if window == b"\n\r" && buf.get(i + 2) == Some(&b'\n') {
            return Some(i + 3);
        }
    }
    None
}

fn line_len(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|byte| *byte == b'\n').map(|idx| idx + 1)
}

/// Pull `var=value` or `var="value"` out of a header parameter list.
fn header_param(params: &[u8], var: &[u8], limit: usize) -> String {
    let mut s = 0;
    while s + var.len() < params.len() {
        let boundary = s == 0 || matches!(params[s - 1], b' ' | b',' | b';');
        if boundary && params[s + var.len()] == b'=' && &params[s..s + var.len()] == var {
            let rest = &params[s + var.len() + 1..];
            let value = match rest.first() {
                Some(b'"') => {
                    let inner = &rest[1..];
                    let end = inner.iter().position(|byte| *byte == b'"').unwrap_or(inner.len());
                    &inner[..end]
                }
                _ => {
                    let end = rest
                        .iter()
                        .position(|byte| matches!(byte, b' ' | b',' | b';'))
                        .unwrap_or(rest.len());
                    &rest[..end]
                }
            };
            let value = &value[..value.len().min(limit)];
            return String::from_utf8_lossy(value).into_owned();
        }
        s += 1;
    }
    String::new()
}

// Intent: extract the first part of a multipart body without copying the rest.
// Result: the part's names and bytes, or None if the body is not a complete part.
pub fn parse_multipart(body: &[u8], name_limit: usize, file_name_limit: usize) -> Option<Part> {
    if body.len() < 3 || body[0] != b'-' || body[1] != b'-' || body[2] == b'\n' {
        return None;
    }
    let headers_end = header_block_len(body)?;
    let boundary_line = line_len(body)?;
    let boundary = body[..boundary_line]
        .strip_suffix(b"\n")
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))?;
    if boundary.len() <= 2 {
        return None;
    }

    let mut field_name = String::new();
    let mut file_name = String::new();
    let mut n = boundary_line;
    while n < headers_end {
        let len = match line_len(&body[n..headers_end]) {
            Some(len) if len > 0 => len,
            _ => break,
        };
        let line = &body[n..n + len];
        if line.len() > CONTENT_DISPOSITION.len()
            && line[..CONTENT_DISPOSITION.len()].eq_ignore_ascii_case(CONTENT_DISPOSITION)
        {
            let params = line[CONTENT_DISPOSITION.len()..]
                .strip_suffix(b"\n")
                .map(|rest| rest.strip_suffix(b"\r").unwrap_or(rest))
                .unwrap_or(&line[CONTENT_DISPOSITION.len()..]);
            field_name = header_param(params, b"name", name_limit);
            file_name = header_param(params, b"filename", file_name_limit);
        }
        n += len;
    }

    let mut pos = headers_end;
    while pos + boundary.len() <= body.len() {
        if body[pos..pos + boundary.len()] == *boundary {
            let data_end = pos.checked_sub(2).filter(|end| *end >= headers_end)?;
            return Some(Part {
                file: UploadFile {
                    field_name,
                    file_name,
                    data: body[headers_end..data_end].to_vec(),
                },
                boundary_offset: pos,
            });
        }
        pos += 1;
    }
    None
}
