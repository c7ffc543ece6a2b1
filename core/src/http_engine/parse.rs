//! Request-line and header parsing (spec.md §4.3 steps 1-3).
//!
//! US-ASCII for the request line and header names, ISO-8859-1 for opaque
//! header values (spec.md §9 open question (a)) — in practice this means
//! we read raw bytes and only require the request line and header names
//! to be valid ASCII; header values are decoded permissively via Latin-1,
//! which never fails since every byte 0-255 is a valid Latin-1 scalar.

use http::Uri;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::ProtocolError;

const MAX_REQUEST_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;

pub struct RequestLine {
    pub method: String,
    pub target: String,
}

/// Headers as received, order preserved (spec.md §9 open question (c)).
pub type Headers = Vec<(String, String)>;

/// Reads one CRLF-terminated request line. `Ok(None)` signals a clean
/// EOF before any bytes were read (end of the keep-alive loop, not an
/// error).
pub async fn read_request_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Result<Option<RequestLine>, ProtocolError>> {
    let mut line = Vec::new();
    let n = read_line_limited(reader, &mut line, MAX_REQUEST_LINE).await?;
    if n == 0 {
        return Ok(Ok(None));
    }
    if line.len() >= MAX_REQUEST_LINE {
        return Ok(Err(ProtocolError::RequestLineTooLong));
    }
    if line.is_empty() {
        // spec.md §4.3 step 1: an empty line ends the request loop the
        // same as EOF does.
        return Ok(Ok(None));
    }
    let Ok(text) = std::str::from_utf8(&line) else {
        return Ok(Err(ProtocolError::BadRequestTarget));
    };
    let mut parts = text.splitn(3, ' ');
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(Err(ProtocolError::BadRequestTarget));
    };
    Ok(Ok(Some(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
    })))
}

/// Reads headers up to the terminating blank line. More than
/// [`MAX_HEADERS`] is a protocol error.
pub async fn read_headers<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Result<Headers, ProtocolError>> {
    let mut headers = Headers::new();
    loop {
        let mut line = Vec::new();
        read_line_limited(reader, &mut line, MAX_REQUEST_LINE).await?;
        if line.is_empty() {
            break;
        }
        if headers.len() >= MAX_HEADERS {
            return Ok(Err(ProtocolError::TooManyHeaders));
        }
        let text = latin1_to_string(&line);
        let Some((name, value)) = text.split_once(':') else {
            return Ok(Err(ProtocolError::BadRequestTarget));
        };
        if !name.bytes().all(|b| b.is_ascii() && b != b' ') {
            return Ok(Err(ProtocolError::BadRequestTarget));
        }
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(Ok(headers))
}

/// Reads a single line, stripping the trailing CRLF/LF, stopping early
/// (without erroring) once `limit` bytes have been read so a client
/// can't force unbounded buffering.
async fn read_line_limited<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    limit: usize,
) -> std::io::Result<usize> {
    let mut total = 0;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(total);
        }
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if out.len() < limit {
                out.extend_from_slice(&buf[..pos]);
            }
            total += pos + 1;
            reader.consume(pos + 1);
            if out.last() == Some(&b'\r') {
                out.pop();
            }
            return Ok(total);
        } else {
            let n = buf.len();
            if out.len() < limit {
                out.extend_from_slice(buf);
            }
            total += n;
            reader.consume(n);
            if total >= limit {
                return Ok(total);
            }
        }
    }
}

fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Resolves the request-target into a fully-qualified URI per spec.md
/// §4.3 step 3.
pub fn resolve_uri(method: &str, target: &str, headers: &Headers) -> Result<Uri, ProtocolError> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return format!("https://{target}")
            .parse()
            .map_err(|_| ProtocolError::BadRequestTarget);
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return target.parse().map_err(|_| ProtocolError::BadRequestTarget);
    }
    // Origin-form: prepend scheme + Host header (or "localhost").
    let host = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .map(|(_, v)| v.as_str())
        .unwrap_or("localhost");
    format!("http://{host}{target}")
        .parse()
        .map_err(|_| ProtocolError::BadRequestTarget)
}

/// Reads one line with no structural validation — used for response
/// status lines and chunked-encoding size lines, neither of which has
/// the `token SP token SP token` shape a request line does. `Ok(None)`
/// on clean EOF before any bytes were read.
pub async fn read_raw_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut raw = String::new();
    let n = reader.read_line(&mut raw).await?;
    if n == 0 {
        return Ok(None);
    }
    while raw.ends_with('\n') || raw.ends_with('\r') {
        raw.pop();
    }
    Ok(Some(raw))
}

pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_request_line() {
        let mut reader = BufReader::new(Cursor::new(b"GET / HTTP/1.1\r\n".to_vec()));
        let line = read_request_line(&mut reader).await.unwrap().unwrap().unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.target, "/");
    }

    #[tokio::test]
    async fn empty_read_signals_clean_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        let line = read_request_line(&mut reader).await.unwrap().unwrap();
        assert!(line.is_none());
    }

    #[tokio::test]
    async fn reads_headers_until_blank_line() {
        let mut reader = BufReader::new(Cursor::new(
            b"Host: example.com\r\nX-Foo: bar\r\n\r\n".to_vec(),
        ));
        let headers = read_headers(&mut reader).await.unwrap().unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(header_value(&headers, "host"), Some("example.com"));
    }

    #[tokio::test]
    async fn too_many_headers_is_protocol_error() {
        let mut raw = Vec::new();
        for i in 0..101 {
            raw.extend_from_slice(format!("X-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        let mut reader = BufReader::new(Cursor::new(raw));
        assert!(read_headers(&mut reader).await.unwrap().is_err());
    }

    #[test]
    fn connect_target_becomes_https_authority() {
        let uri = resolve_uri("CONNECT", "example.com:443", &vec![]).unwrap();
        assert_eq!(uri.to_string(), "https://example.com:443/");
    }

    #[test]
    fn origin_form_prepends_host_header() {
        let headers = vec![("Host".to_string(), "example.com".to_string())];
        let uri = resolve_uri("GET", "/a/b", &headers).unwrap();
        assert_eq!(uri.to_string(), "http://example.com/a/b");
    }

    #[test]
    fn origin_form_without_host_uses_localhost() {
        let uri = resolve_uri("GET", "/a", &vec![]).unwrap();
        assert_eq!(uri.to_string(), "http://localhost/a");
    }

    #[test]
    fn absolute_uri_passes_through() {
        let uri = resolve_uri("GET", "http://example.com/x", &vec![]).unwrap();
        assert_eq!(uri.to_string(), "http://example.com/x");
    }
}
