use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, ParseWarning, ParseWarningKind,
    RequestHead, RequestLine, ResponseHead, StatusLine,
};

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore {
        warnings: Vec<ParseWarning>,
    },
    Complete {
        message: T,
        warnings: Vec<ParseWarning>,
    },
    Error {
        error: ParseError,
        warnings: Vec<ParseWarning>,
    },
}

/// Incremental request-head parser.
///
/// Bytes are pushed as they arrive from the socket. Once the head is
/// complete, anything received past the blank line is kept and handed out by
/// [`RequestParser::take_buffered`] so it can be relayed untouched.
#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<RequestHead> {
        self.buffer.extend_from_slice(bytes);
        self.try_parse_request()
    }

    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn try_parse_request(&mut self) -> ParseStatus<RequestHead> {
        match parse_request_head(&self.buffer, self.limits, &mut self.warnings) {
            Ok(ParseResult::Complete { message, consumed }) => {
                self.buffer.drain(..consumed);
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Complete { message, warnings }
            }
            Ok(ParseResult::NeedMore) => ParseStatus::NeedMore {
                warnings: self.warnings.clone(),
            },
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Error { error, warnings }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    warnings: Vec<ParseWarning>,
    limits: Limits,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            warnings: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<ResponseHead> {
        self.buffer.extend_from_slice(bytes);
        self.try_parse_response()
    }

    pub fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    fn try_parse_response(&mut self) -> ParseStatus<ResponseHead> {
        match parse_response_head(&self.buffer, self.limits, &mut self.warnings) {
            Ok(ParseResult::Complete { message, consumed }) => {
                self.buffer.drain(..consumed);
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Complete { message, warnings }
            }
            Ok(ParseResult::NeedMore) => ParseStatus::NeedMore {
                warnings: self.warnings.clone(),
            },
            Err(error) => {
                let warnings = std::mem::take(&mut self.warnings);
                ParseStatus::Error { error, warnings }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ParseResult<T> {
    NeedMore,
    Complete { message: T, consumed: usize },
}

fn parse_request_head(
    buffer: &[u8],
    limits: Limits,
    warnings: &mut Vec<ParseWarning>,
) -> Result<ParseResult<RequestHead>, ParseError> {
    let Some(headers_end) = find_headers_end(buffer, limits)? else {
        return Ok(ParseResult::NeedMore);
    };

    let (line_end, headers_start) = split_start_line(buffer, headers_end);
    let line = parse_request_line(&buffer[..line_end], 0, warnings)?;
    let headers = parse_headers(&buffer[headers_start..headers_end], headers_start, warnings)?;

    Ok(ParseResult::Complete {
        message: RequestHead { line, headers },
        consumed: headers_end + HEADER_TERMINATOR.len(),
    })
}

fn parse_response_head(
    buffer: &[u8],
    limits: Limits,
    warnings: &mut Vec<ParseWarning>,
) -> Result<ParseResult<ResponseHead>, ParseError> {
    let Some(headers_end) = find_headers_end(buffer, limits)? else {
        return Ok(ParseResult::NeedMore);
    };

    let (line_end, headers_start) = split_start_line(buffer, headers_end);
    let line = parse_status_line(&buffer[..line_end], 0, warnings)?;
    let headers = parse_headers(&buffer[headers_start..headers_end], headers_start, warnings)?;

    Ok(ParseResult::Complete {
        message: ResponseHead { line, headers },
        consumed: headers_end + HEADER_TERMINATOR.len(),
    })
}

fn find_headers_end(buffer: &[u8], limits: Limits) -> Result<Option<usize>, ParseError> {
    match twoway::find_bytes(buffer, HEADER_TERMINATOR) {
        Some(index) if index > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        Some(index) => Ok(Some(index)),
        None if buffer.len() > limits.max_header_bytes => Err(ParseError {
            kind: ParseErrorKind::HeaderTooLarge,
            offset: limits.max_header_bytes,
        }),
        None => Ok(None),
    }
}

// A head with no header fields ends at the start line's own CRLF, so the
// header block is empty rather than starting past the terminator.
fn split_start_line(buffer: &[u8], headers_end: usize) -> (usize, usize) {
    match twoway::find_bytes(&buffer[..headers_end], CRLF) {
        Some(line_end) => (line_end, line_end + CRLF.len()),
        None => (headers_end, headers_end),
    }
}

fn parse_request_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<RequestLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.split_whitespace();
    let method = parts.next().ok_or_else(|| invalid.clone())?;
    let target = parts.next().ok_or_else(|| invalid.clone())?;
    let version_raw = parts.next().unwrap_or("HTTP/1.1");

    if parts.next().is_some() {
        return Err(invalid);
    }

    let version = parse_http_version(version_raw, offset, warnings);

    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

fn parse_status_line(
    line: &[u8],
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<StatusLine, ParseError> {
    let invalid = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset,
    };
    let text = std::str::from_utf8(line).map_err(|_| invalid.clone())?;

    let mut parts = text.splitn(3, ' ');
    let version_raw = parts.next().unwrap_or("HTTP/1.1");
    let status_raw = parts.next().ok_or_else(|| invalid.clone())?;
    let reason = parts.next().unwrap_or("");

    let status_code = status_raw.parse::<u16>().map_err(|_| invalid)?;
    let version = parse_http_version(version_raw, offset, warnings);

    Ok(StatusLine {
        version,
        status_code,
        reason: reason.to_string(),
    })
}

fn parse_http_version(
    version_raw: &str,
    offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> HttpVersion {
    match version_raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::UnknownVersion(other.to_string()),
                offset,
            });
            HttpVersion::Other(other.to_string())
        }
    }
}

fn parse_headers(
    bytes: &[u8],
    base_offset: usize,
    warnings: &mut Vec<ParseWarning>,
) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeaderBlock,
        offset: base_offset,
    })?;

    let mut headers = Vec::new();
    let mut current: Option<(String, String)> = None;
    let mut current_value = String::new();
    let mut offset = base_offset;

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }

        if line.starts_with([' ', '\t']) {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::ObsFoldDetected,
                offset,
            });
            if current.is_some() {
                current_value.push(' ');
                current_value.push_str(line.trim());
                offset += line.len() + CRLF.len();
                continue;
            }
        }

        if let Some((name, raw_name)) = current.take() {
            headers.push(Header {
                name,
                raw_name,
                value: current_value.trim().to_string(),
            });
            current_value.clear();
        }

        let (raw_name, value) = line.split_once(':').unwrap_or((line, ""));

        if raw_name.trim().is_empty() || !line.contains(':') {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderName,
                offset,
            });
        }

        if value.bytes().any(|byte| byte == b'\r' || byte == b'\n') {
            warnings.push(ParseWarning {
                kind: ParseWarningKind::InvalidHeaderValue,
                offset,
            });
        }

        current = Some((raw_name.trim().to_string(), raw_name.to_string()));
        current_value.push_str(value.trim_start());
        offset += line.len() + CRLF.len();
    }

    if let Some((name, raw_name)) = current {
        headers.push(Header {
            name,
            raw_name,
            value: current_value.trim().to_string(),
        });
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{ParseStatus, RequestParser, ResponseParser};
    use crate::http1::{HttpVersion, Limits, ParseErrorKind, ParseWarningKind};

    #[test]
    fn parses_connect_head() {
        let mut parser = RequestParser::new();
        let input = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";

        match parser.push(input) {
            ParseStatus::Complete { message, .. } => {
                assert!(message.is_connect());
                assert_eq!(message.line.target, "example.com:443");
                assert_eq!(message.header("host"), Some("example.com:443"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn parses_head_across_buffers() {
        let mut parser = RequestParser::new();
        let part1 = b"GET http://example.com/abc HTTP/1.1\r\nHost:";
        let part2 = b" example.com\r\nUser-Agent: test\r\n\r\n";

        assert_matches!(parser.push(part1), ParseStatus::NeedMore { .. });

        match parser.push(part2) {
            ParseStatus::Complete { message, .. } => {
                assert_eq!(message.line.target, "http://example.com/abc");
                assert_eq!(message.headers.len(), 2);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn keeps_bytes_past_the_head() {
        let mut parser = RequestParser::new();
        let input = b"POST http://example.com/ HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";

        assert_matches!(parser.push(input), ParseStatus::Complete { .. });
        assert_eq!(parser.take_buffered(), b"hello");
        assert!(parser.take_buffered().is_empty());
    }

    #[test]
    fn keeps_tunnel_bytes_sent_with_connect() {
        let mut parser = RequestParser::new();
        let input = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01";

        match parser.push(input) {
            ParseStatus::Complete { message, .. } => assert!(message.headers.is_empty()),
            other => panic!("unexpected status {other:?}"),
        }
        assert_eq!(parser.take_buffered(), b"\x16\x03\x01");
    }

    #[test]
    fn parses_connect_established_response() {
        let mut parser = ResponseParser::new();
        let input = b"HTTP/1.1 200 Connection Established\r\n\r\n";

        match parser.push(input) {
            ParseStatus::Complete { message, .. } => {
                assert_eq!(message.line.status_code, 200);
                assert_eq!(message.line.reason, "Connection Established");
                assert_eq!(message.line.version, HttpVersion::Http11);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn rejects_garbage_status_line() {
        let mut parser = ResponseParser::new();
        let status = parser.push(b"SSH-2.0-OpenSSH\r\n\r\n");

        assert_matches!(
            status,
            ParseStatus::Error { error, .. } if error.kind == ParseErrorKind::InvalidStatusLine
        );
    }

    #[test]
    fn warns_on_obs_fold() {
        let mut parser = RequestParser::new();
        let input = b"GET / HTTP/1.1\r\nHeader: one\r\n\tcontinued\r\n\r\n";

        match parser.push(input) {
            ParseStatus::Complete { message, warnings } => {
                assert_eq!(message.header("header"), Some("one continued"));
                assert!(
                    warnings
                        .iter()
                        .any(|warning| matches!(warning.kind, ParseWarningKind::ObsFoldDetected))
                );
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn supports_header_limit() {
        let mut parser = RequestParser::with_limits(Limits {
            max_header_bytes: 10,
        });
        let status = parser.push(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        assert_matches!(
            status,
            ParseStatus::Error { error, .. } if error.kind == ParseErrorKind::HeaderTooLarge
        );
    }

    #[test]
    fn oversized_partial_head_is_rejected_early() {
        let mut parser = RequestParser::with_limits(Limits {
            max_header_bytes: 16,
        });
        let status = parser.push(b"GET / HTTP/1.1\r\nX-Padding: aaaaaaaaaaaa");

        assert_matches!(status, ParseStatus::Error { .. });
    }

    #[test]
    fn warns_on_unknown_version() {
        let mut parser = ResponseParser::new();

        match parser.push(b"HTTP/9.9 407 Proxy Authentication Required\r\n\r\n") {
            ParseStatus::Complete { message, warnings } => {
                assert_eq!(message.line.status_code, 407);
                assert!(
                    warnings
                        .iter()
                        .any(|warning| matches!(warning.kind, ParseWarningKind::UnknownVersion(_)))
                );
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
