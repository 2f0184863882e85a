use base64::Engine;

use crate::http1::RequestHead;
use crate::target::Target;

pub const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

// Hop-by-hop headers that belong to the client's hop and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "te",
    "upgrade",
];

// The body is relayed verbatim, so its framing headers and `Host` survive
// even when a `Connection` header names them.
const END_TO_END: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value for a `Proxy-Authorization` header using the Basic scheme.
    pub fn basic_authorization(&self) -> String {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl std::fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// How the request target is written when a head is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestForm {
    /// `/path?query`, for a request sent straight to the origin.
    Origin,
    /// `http://host:port/path?query`, for a request handed to another proxy.
    Absolute,
}

pub fn build_connect_request(target: &Target, credentials: Option<&ProxyCredentials>) -> Vec<u8> {
    let authority = target.authority();
    let mut bytes = Vec::new();
    bytes.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\n").as_bytes());
    bytes.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    if let Some(credentials) = credentials {
        bytes.extend_from_slice(
            format!(
                "Proxy-Authorization: {}\r\n",
                credentials.basic_authorization()
            )
            .as_bytes(),
        );
    }
    bytes.extend_from_slice(b"\r\n");
    bytes
}

/// Re-serialises a plain (non-CONNECT) request head for the next hop.
///
/// Hop-by-hop headers are dropped, including any named by the client's
/// `Connection` header. `Connection: close` pins the connection to this
/// single exchange, and `credentials` (if any) are attached as
/// `Proxy-Authorization` for an upstream proxy. The absolute form keeps the
/// scheme the client asked for.
pub fn forward_request_head(
    head: &RequestHead,
    target: &Target,
    form: RequestForm,
    credentials: Option<&ProxyCredentials>,
) -> Vec<u8> {
    let scheme = request_scheme(&head.line.target);
    let host = host_header_value(target, default_port(&scheme));
    let path = origin_path(&head.line.target);
    let request_target = match form {
        RequestForm::Origin => path,
        RequestForm::Absolute => format!("{scheme}://{host}{path}"),
    };
    let listed = connection_tokens(head);

    let mut bytes = Vec::new();
    bytes.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            head.line.method,
            request_target,
            head.line.version.as_str()
        )
        .as_bytes(),
    );

    let mut has_host = false;
    for header in &head.headers {
        let name = header.name.to_ascii_lowercase();
        if HOP_BY_HOP.contains(&name.as_str())
            || (listed.contains(&name) && !END_TO_END.contains(&name.as_str()))
        {
            continue;
        }
        if header.name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        bytes.extend_from_slice(header.raw_name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(header.value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
    }
    if !has_host {
        bytes.extend_from_slice(format!("Host: {host}\r\n").as_bytes());
    }
    if let (RequestForm::Absolute, Some(credentials)) = (form, credentials) {
        bytes.extend_from_slice(
            format!(
                "Proxy-Authorization: {}\r\n",
                credentials.basic_authorization()
            )
            .as_bytes(),
        );
    }
    bytes.extend_from_slice(b"Connection: close\r\n\r\n");
    bytes
}

/// A bodiless response the proxy writes itself, e.g. `502 Bad Gateway`.
pub fn status_response(status_code: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {status_code} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
        .into_bytes()
}

pub fn is_success_status(status_code: u16) -> bool {
    (200..300).contains(&status_code)
}

fn origin_path(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    let Some((_, rest)) = target.split_once("://") else {
        return target.to_string();
    };
    match rest.find(['/', '?']) {
        Some(index) if rest[index..].starts_with('/') => rest[index..].to_string(),
        // `http://host?query` has an empty path.
        Some(index) => format!("/{}", &rest[index..]),
        None => "/".to_string(),
    }
}

// Field names listed by `Connection` (and the legacy `Proxy-Connection`).
fn connection_tokens(head: &RequestHead) -> Vec<String> {
    head.headers
        .iter()
        .filter(|header| {
            header.name.eq_ignore_ascii_case("connection")
                || header.name.eq_ignore_ascii_case("proxy-connection")
        })
        .flat_map(|header| header.value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn request_scheme(target: &str) -> String {
    if target.starts_with('/') {
        return "http".to_string();
    }
    match target.split_once("://") {
        Some((scheme, _)) => scheme.to_ascii_lowercase(),
        None => "http".to_string(),
    }
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" { 443 } else { 80 }
}

fn host_header_value(target: &Target, default_port: u16) -> String {
    if target.port == default_port {
        if target.host.contains(':') {
            format!("[{}]", target.host)
        } else {
            target.host.clone()
        }
    } else {
        target.authority()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ProxyCredentials, RequestForm, build_connect_request, forward_request_head,
        is_success_status, status_response,
    };
    use crate::http1::{ParseStatus, RequestHead, RequestParser};
    use crate::target::Target;

    fn head(raw: &[u8]) -> RequestHead {
        match RequestParser::new().push(raw) {
            ParseStatus::Complete { message, .. } => message,
            other => panic!("unexpected status {other:?}"),
        }
    }

    fn text(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn basic_authorization_encodes_user_and_password() {
        let credentials = ProxyCredentials::new("user", "pass");
        assert_eq!(credentials.basic_authorization(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn debug_output_hides_password() {
        let credentials = ProxyCredentials::new("user", "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn connect_request_without_credentials() {
        let request = build_connect_request(&Target::new("example.com", 443), None);
        assert_eq!(
            text(request),
            "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n"
        );
    }

    #[test]
    fn connect_request_carries_credentials() {
        let credentials = ProxyCredentials::new("user", "pass");
        let request = text(build_connect_request(
            &Target::new("example.com", 443),
            Some(&credentials),
        ));
        assert!(request.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn origin_form_strips_scheme_and_proxy_headers() {
        let head = head(
            b"GET http://internal.local:9000/a/b?c=1 HTTP/1.1\r\nHost: internal.local:9000\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\nAccept: */*\r\n\r\n",
        );
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("internal.local", 9000),
            RequestForm::Origin,
            None,
        ));

        assert!(forwarded.starts_with("GET /a/b?c=1 HTTP/1.1\r\n"));
        assert!(forwarded.contains("Host: internal.local:9000\r\n"));
        assert!(forwarded.contains("Accept: */*\r\n"));
        assert!(!forwarded.to_ascii_lowercase().contains("proxy-"));
        assert!(forwarded.ends_with("Connection: close\r\n\r\n"));
    }

    #[test]
    fn absolute_form_adds_host_and_upstream_credentials() {
        let head = head(b"POST /submit HTTP/1.1\r\nHost: example.com\r\nContent-Length: 2\r\n\r\n");
        let credentials = ProxyCredentials::new("user", "pass");
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("example.com", 80),
            RequestForm::Absolute,
            Some(&credentials),
        ));

        assert!(forwarded.starts_with("POST http://example.com/submit HTTP/1.1\r\n"));
        assert!(forwarded.contains("Content-Length: 2\r\n"));
        assert!(forwarded.contains("Proxy-Authorization: Basic dXNlcjpwYXNz\r\n"));
    }

    #[test]
    fn missing_host_header_is_filled_in() {
        let head = head(b"GET http://example.com:8080 HTTP/1.0\r\n\r\n");
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("example.com", 8080),
            RequestForm::Origin,
            None,
        ));

        assert!(forwarded.starts_with("GET / HTTP/1.0\r\n"));
        assert!(forwarded.contains("Host: example.com:8080\r\n"));
    }

    #[test]
    fn empty_path_keeps_query() {
        let head = head(b"GET http://example.com?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("example.com", 80),
            RequestForm::Origin,
            None,
        ));

        assert!(forwarded.starts_with("GET /?q=1 HTTP/1.1\r\n"));
    }

    #[test]
    fn absolute_form_keeps_https_scheme() {
        let head = head(b"GET https://secure.example/login HTTP/1.1\r\nAccept: */*\r\n\r\n");
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("secure.example", 443),
            RequestForm::Absolute,
            None,
        ));

        assert!(forwarded.starts_with("GET https://secure.example/login HTTP/1.1\r\n"));
        assert!(forwarded.contains("Host: secure.example\r\n"));
    }

    #[test]
    fn connection_listed_headers_are_dropped() {
        let head = head(
            b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\nConnection: Upgrade, X-Session-Hint, Content-Length\r\nUpgrade: websocket\r\nTE: trailers\r\nX-Session-Hint: abc\r\nContent-Length: 0\r\nAccept: */*\r\n\r\n",
        );
        let forwarded = text(forward_request_head(
            &head,
            &Target::new("example.com", 80),
            RequestForm::Origin,
            None,
        ))
        .to_ascii_lowercase();

        assert!(!forwarded.contains("upgrade"));
        assert!(!forwarded.contains("te: trailers"));
        assert!(!forwarded.contains("x-session-hint"));
        assert!(forwarded.contains("content-length: 0\r\n"));
        assert!(forwarded.contains("accept: */*\r\n"));
        assert!(forwarded.ends_with("connection: close\r\n\r\n"));
    }

    #[test]
    fn status_response_is_bodiless() {
        assert_eq!(
            text(status_response(502, "Bad Gateway")),
            "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        assert!(is_success_status(200));
        assert!(!is_success_status(407));
    }
}
