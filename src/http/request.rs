//! Incremental HTTP request parser.
//!
//! A four-state machine over a connection's read buffer: request line,
//! headers, body, finished. Each step consumes exactly the bytes belonging
//! to one CRLF-terminated line (or, for the body, exactly `Content-Length`
//! bytes) and parks as `Incomplete` when they have not all arrived yet, so
//! a request split across any number of reads parses the same as one
//! delivered whole.

use std::collections::HashMap;

use crate::auth::{AuthAttempt, CredentialStore};
use crate::runtime::Buffer;

const CRLF: &[u8] = b"\r\n";

/// Extensionless paths served as their `.html` counterpart.
const DEFAULT_PAGES: [&str; 6] = [
    "/index",
    "/register",
    "/login",
    "/welcome",
    "/video",
    "/picture",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Header,
    Content,
    Finish,
}

/// Outcome of one parse step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// A full request is ready.
    Complete,
    /// Ran out of bytes mid-request; feed more and call again.
    Incomplete,
    /// The request line is unusable; respond 400 and drop the connection.
    Invalid,
}

/// One in-flight HTTP request. Survives across reads until `Complete`,
/// then is `reset` for the next request on a kept-alive connection.
#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
}

impl Request {
    pub fn new() -> Self {
        Self {
            state: ParseState::RequestLine,
            method: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// Forget everything and await a fresh request line.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Advance the state machine over whatever `buf` currently holds.
    pub fn parse(&mut self, buf: &mut Buffer) -> ParseOutcome {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return ParseOutcome::Incomplete,
                    };
                    if !self.parse_request_line(&line) {
                        return ParseOutcome::Invalid;
                    }
                    self.state = ParseState::Header;
                }
                ParseState::Header => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return ParseOutcome::Incomplete,
                    };
                    self.parse_header_line(&line);
                }
                ParseState::Content => {
                    let need = self.content_length();
                    if buf.readable_bytes() < need {
                        return ParseOutcome::Incomplete;
                    }
                    self.body = String::from_utf8_lossy(&buf.peek()[..need]).into_owned();
                    buf.retrieve(need);
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return ParseOutcome::Complete,
            }
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Persistent-connection request: HTTP/1.1 with an explicit
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        self.version() == "1.1" && self.header("Connection") == Some("keep-alive")
    }

    /// Decoded form fields of a URL-encoded body; empty for anything else.
    pub fn form_fields(&self) -> HashMap<String, String> {
        match self.header("Content-Type") {
            Some("application/x-www-form-urlencoded") => parse_urlencoded(self.body()),
            _ => HashMap::new(),
        }
    }

    /// Apply the auth routing rule: a form POST to the login or register
    /// route consults the credential store, landing on the welcome page on
    /// success and the error page otherwise. Other requests are untouched.
    pub fn resolve_route(&mut self, store: &dyn CredentialStore) {
        let attempt = match self.path.as_str() {
            "/login.html" => AuthAttempt::Login,
            "/register.html" => AuthAttempt::Register,
            _ => return,
        };
        if self.method != "POST" {
            return;
        }
        let fields = self.form_fields();
        let user = fields.get("username").map(String::as_str).unwrap_or("");
        let password = fields.get("password").map(String::as_str).unwrap_or("");
        self.path = if store.verify(user, password, attempt) {
            "/welcome.html".to_string()
        } else {
            "/error.html".to_string()
        };
    }

    /// `METHOD SP PATH SP HTTP/VERSION`, nothing more, nothing less.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(version), None)
                if !method.is_empty() && !path.is_empty() =>
            {
                match version.strip_prefix("HTTP/") {
                    Some(v) => {
                        self.method = method.to_string();
                        self.path = path.to_string();
                        self.version = v.to_string();
                        self.rewrite_path();
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    /// A line that doesn't look like `name: value` (the blank separator
    /// included) ends the header block.
    fn parse_header_line(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) if !name.is_empty() => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_string(), value.to_string());
            }
            _ => self.state = ParseState::Content,
        }
    }

    fn rewrite_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_string();
        } else if DEFAULT_PAGES.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop one CRLF-terminated line off the readable span, never consuming a
/// partial line.
fn take_line(buf: &mut Buffer) -> Option<String> {
    let readable = buf.peek();
    let end = readable.windows(2).position(|w| w == CRLF)?;
    let line = String::from_utf8_lossy(&readable[..end]).into_owned();
    buf.retrieve(end + 2);
    Some(line)
}

fn parse_urlencoded(body: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for pair in body.split('&') {
        if let Some((name, value)) = pair.split_once('=') {
            fields.insert(percent_decode(name), percent_decode(value));
        }
    }
    fields
}

/// Standard form decoding: `+` is a space, `%XX` names a byte with two hex
/// digits. Malformed escapes pass through as literal text.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2]))
            {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(data: &str) -> Buffer {
        let mut buf = Buffer::new();
        buf.append(data.as_bytes());
        buf
    }

    struct AllowAll;

    impl CredentialStore for AllowAll {
        fn verify(&self, _user: &str, _password: &str, _attempt: AuthAttempt) -> bool {
            true
        }
    }

    struct DenyAll;

    impl CredentialStore for DenyAll {
        fn verify(&self, _user: &str, _password: &str, _attempt: AuthAttempt) -> bool {
            false
        }
    }

    #[test]
    fn test_get_root_rewrites_to_index() {
        let mut buf = feed("GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("Host"), Some("x"));
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_extensionless_routes_gain_html() {
        let mut buf = feed("GET /login HTTP/1.1\r\n\r\n");
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.path(), "/login.html");
    }

    #[test]
    fn test_bad_request_line_is_invalid() {
        let mut buf = feed("BADLINE\r\n\r\n");
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Invalid);
    }

    #[test]
    fn test_split_delivery_resumes() {
        let mut buf = Buffer::new();
        let mut req = Request::new();

        buf.append(b"GET /inde");
        assert_eq!(req.parse(&mut buf), ParseOutcome::Incomplete);

        buf.append(b"x HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.header("Host"), Some("a"));
    }

    #[test]
    fn test_keep_alive_needs_version_and_header() {
        let mut buf = feed("GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        let mut req = Request::new();
        req.parse(&mut buf);
        assert!(req.is_keep_alive());

        let mut buf = feed("GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        let mut req = Request::new();
        req.parse(&mut buf);
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn test_malformed_header_line_ends_header_block() {
        let mut buf = feed("GET /a.html HTTP/1.1\r\nnot a header line\r\nHost: x\r\n\r\n");
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        // The bogus line was taken for the separator, so the rest of the
        // block was never parsed as headers.
        assert_eq!(req.header("Host"), None);
        assert!(buf.readable_bytes() > 0);
    }

    #[test]
    fn test_body_waits_for_content_length() {
        let mut buf = feed(
            "POST /login.html HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 10\r\n\r\nusern",
        );
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Incomplete);
        buf.append(b"ame=x");
        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.body(), "username=x");
    }

    #[test]
    fn test_form_decoding() {
        let mut buf = feed(
            "POST /login.html HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 31\r\n\r\nusername=j%41ck&password=a+b%21",
        );
        let mut req = Request::new();

        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        let fields = req.form_fields();
        assert_eq!(fields["username"], "jAck");
        assert_eq!(fields["password"], "a b!");
    }

    #[test]
    fn test_malformed_escape_passes_through() {
        assert_eq!(percent_decode("a%zz"), "a%zz");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%C3%A9"), "é");
    }

    #[test]
    fn test_resolve_route_login() {
        let mut buf = feed(
            "POST /login HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 24\r\n\r\nusername=bob&password=pw",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.path(), "/login.html");

        req.resolve_route(&AllowAll);
        assert_eq!(req.path(), "/welcome.html");
    }

    #[test]
    fn test_resolve_route_rejection() {
        let mut buf = feed(
            "POST /register.html HTTP/1.1\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 24\r\n\r\nusername=bob&password=pw",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);

        req.resolve_route(&DenyAll);
        assert_eq!(req.path(), "/error.html");
    }

    #[test]
    fn test_get_is_never_routed_through_auth() {
        let mut buf = feed("GET /login HTTP/1.1\r\n\r\n");
        let mut req = Request::new();
        req.parse(&mut buf);

        req.resolve_route(&DenyAll);
        assert_eq!(req.path(), "/login.html");
    }

    #[test]
    fn test_reset_clears_request() {
        let mut buf = feed("GET /picture HTTP/1.1\r\nHost: h\r\n\r\n");
        let mut req = Request::new();
        req.parse(&mut buf);
        assert_eq!(req.path(), "/picture.html");

        req.reset();
        assert_eq!(req.path(), "");
        assert_eq!(req.header("Host"), None);

        let mut buf = feed("GET /video HTTP/1.1\r\n\r\n");
        assert_eq!(req.parse(&mut buf), ParseOutcome::Complete);
        assert_eq!(req.path(), "/video.html");
    }
}
