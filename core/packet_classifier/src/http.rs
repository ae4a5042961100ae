//! TLS and HTTP sniffing on the first payload bytes of a TCP segment
//!
//! Only what the offload decision needs: whether the segment opens a TLS
//! handshake, whether it starts an HTTP request, and the request line plus
//! headers if so. Nothing here allocates for non-HTTP payloads.

use std::collections::HashMap;

// ============================================================================
// Constants
// ============================================================================

/// TLS record content type for handshake messages
const TLS_HANDSHAKE: u8 = 0x16;

/// Major version byte shared by SSL 3.0 through TLS 1.3 records
const TLS_MAJOR_VERSION: u8 = 0x03;

/// Record header (5) plus handshake type
const MIN_TLS_LEN: usize = 6;

/// Shortest payload worth testing for a method prefix
const MIN_HTTP_SNIFF_LEN: usize = 8;

/// Shortest payload that can carry a parseable request line
const MIN_HTTP_PARSE_LEN: usize = 16;

/// Default inspection window
pub const DEFAULT_MAX_INSPECT_BYTES: usize = 2048;

/// First four bytes of every method we recognise
const HTTP_METHOD_PREFIXES: [&[u8; 4]; 9] = [
    b"GET ", b"POST", b"PUT ", b"DELE", b"HEAD", b"OPTI", b"PATC", b"TRAC", b"CONN",
];

// ============================================================================
// Detection
// ============================================================================

/// Whether `payload` begins with a TLS handshake record
pub fn is_tls_handshake(payload: &[u8]) -> bool {
    payload.len() >= MIN_TLS_LEN && payload[0] == TLS_HANDSHAKE && payload[1] == TLS_MAJOR_VERSION
}

/// Whether `payload` begins with a known HTTP method
pub fn is_http(payload: &[u8]) -> bool {
    if payload.len() < MIN_HTTP_SNIFF_LEN {
        return false;
    }
    HTTP_METHOD_PREFIXES
        .iter()
        .any(|prefix| payload[..4] == prefix[..])
}

// ============================================================================
// Request Parsing
// ============================================================================

/// Request line and headers of a sniffed HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestInfo {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Header names lowercased; a repeated header keeps its last value
    pub headers: HashMap<String, String>,
    /// Empty when the request carries no Content-Type
    pub content_type: String,
    pub is_websocket: bool,
    pub has_auth: bool,
    /// Credential from `Authorization: Bearer <token>`
    pub bearer_token: Option<String>,
}

impl HttpRequestInfo {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// GET/HEAD of text or JSON content
    pub fn is_fast_path_candidate(&self) -> bool {
        let method_ok = self.method == "GET" || self.method == "HEAD";
        let content_ok = self.content_type.is_empty()
            || self.content_type.starts_with("text/")
            || self.content_type.starts_with("application/json");
        method_ok && content_ok
    }
}

/// Parse the request line and headers within the first `max_bytes` of `payload`.
///
/// Returns `None` for payloads too short to hold a request line or whose
/// first line is not `METHOD URI VERSION`. Header lines without a colon are
/// skipped; parsing stops at the first empty line.
pub fn parse_request(payload: &[u8], max_bytes: usize) -> Option<HttpRequestInfo> {
    if payload.len() < MIN_HTTP_PARSE_LEN {
        return None;
    }

    let window = &payload[..payload.len().min(max_bytes)];
    let text = String::from_utf8_lossy(window);
    let mut lines = text.split("\r\n");

    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?;
    let uri = parts.next()?;
    let version = parts.next()?;
    if method.is_empty() || uri.is_empty() || !version.starts_with("HTTP/") {
        return None;
    }

    let mut info = HttpRequestInfo {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        ..Default::default()
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        info.headers
            .insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    if let Some(ct) = info.headers.get("content-type") {
        info.content_type = ct.to_ascii_lowercase();
    }

    // Upgrade: websocket is sufficient with or without Connection: Upgrade
    info.is_websocket = info
        .headers
        .get("upgrade")
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if let Some(auth) = info.headers.get("authorization") {
        info.has_auth = true;
        if let Some(token) = auth.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                info.bearer_token = Some(token.to_string());
            }
        }
    }

    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_detection() {
        let hello = [0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00];
        assert!(is_tls_handshake(&hello));
        assert!(!is_tls_handshake(&hello[..5]));
        // Application data record
        assert!(!is_tls_handshake(&[0x17, 0x03, 0x03, 0x00, 0x10, 0x00]));
    }

    #[test]
    fn test_http_method_sniffing() {
        assert!(is_http(b"GET / HTTP/1.1\r\n"));
        assert!(is_http(b"DELETE /x HTTP/1.1\r\n"));
        assert!(is_http(b"OPTIONS * HTTP/1.1\r\n"));
        assert!(!is_http(b"GET /"));
        assert!(!is_http(b"SSH-2.0-OpenSSH_9.0\r\n"));
    }

    #[test]
    fn test_parse_request_headers_case_insensitive() {
        let req = b"POST /api HTTP/1.1\r\nHost: example\r\nCONTENT-TYPE: Application/JSON\r\nAuthorization: Bearer abc.def.ghi\r\n\r\nbody";
        let info = parse_request(req, DEFAULT_MAX_INSPECT_BYTES).unwrap();
        assert_eq!(info.method, "POST");
        assert_eq!(info.uri, "/api");
        assert_eq!(info.header("host"), Some("example"));
        assert_eq!(info.content_type, "application/json");
        assert!(info.has_auth);
        assert_eq!(info.bearer_token.as_deref(), Some("abc.def.ghi"));
        assert!(!info.is_websocket);
        assert!(!info.is_fast_path_candidate());
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let req = b"GET /chat HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\r\n";
        assert!(parse_request(req, DEFAULT_MAX_INSPECT_BYTES).unwrap().is_websocket);

        let req = b"GET /chat HTTP/1.1\r\nupgrade: websocket\r\n\r\n";
        assert!(parse_request(req, DEFAULT_MAX_INSPECT_BYTES).unwrap().is_websocket);

        let req = b"GET /chat HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";
        assert!(!parse_request(req, DEFAULT_MAX_INSPECT_BYTES).unwrap().is_websocket);
    }

    #[test]
    fn test_non_bearer_authorization() {
        let req = b"GET / HTTP/1.1\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n";
        let info = parse_request(req, DEFAULT_MAX_INSPECT_BYTES).unwrap();
        assert!(info.has_auth);
        assert!(info.bearer_token.is_none());
    }

    #[test]
    fn test_parse_rejects_short_or_garbled() {
        assert!(parse_request(b"GET / HTTP/1.1", DEFAULT_MAX_INSPECT_BYTES).is_none());
        assert!(parse_request(b"GET-nothing-here-at-all\r\n", DEFAULT_MAX_INSPECT_BYTES).is_none());
    }

    #[test]
    fn test_inspection_window_truncates_headers() {
        let mut req = b"GET / HTTP/1.1\r\nHost: a\r\n".to_vec();
        let cut = req.len();
        req.extend_from_slice(b"Upgrade: websocket\r\n\r\n");
        let info = parse_request(&req, cut).unwrap();
        assert!(!info.is_websocket);
        assert_eq!(info.header("host"), Some("a"));
    }

    #[test]
    fn test_fast_path_candidate() {
        let info = parse_request(b"HEAD /status HTTP/1.1\r\nContent-Type: text/plain\r\n\r\n", 2048)
            .unwrap();
        assert!(info.is_fast_path_candidate());
        let info = parse_request(b"GET / HTTP/1.1\r\nContent-Type: image/png\r\n\r\n", 2048).unwrap();
        assert!(!info.is_fast_path_candidate());
    }
}
