//! Minimal HTTP request abstraction the transports read from and write to.
//!
//! The engine never opens connections; hosts convert their own request type
//! into an [`HttpRequest`] (or build one directly when acting as a client).

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// HTTP methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    GET,
    POST,
    PUT,
    DELETE,
    HEAD,
    OPTIONS,
    PATCH,
    TRACE,
    CONNECT,
    UNKNOWN,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::TRACE => "TRACE",
            HttpMethod::CONNECT => "CONNECT",
            HttpMethod::UNKNOWN => "UNKNOWN",
        }
    }

    pub fn from_string(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "GET" => HttpMethod::GET,
            "POST" => HttpMethod::POST,
            "PUT" => HttpMethod::PUT,
            "DELETE" => HttpMethod::DELETE,
            "HEAD" => HttpMethod::HEAD,
            "OPTIONS" => HttpMethod::OPTIONS,
            "PATCH" => HttpMethod::PATCH,
            "TRACE" => HttpMethod::TRACE,
            "CONNECT" => HttpMethod::CONNECT,
            _ => HttpMethod::UNKNOWN,
        }
    }

    /// Whether a form body may carry parameters for this method.
    pub fn allows_body(&self) -> bool {
        matches!(self, HttpMethod::POST | HttpMethod::PUT | HttpMethod::PATCH)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parts of a request target that request signing depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTarget {
    pub host: String,
    pub port: u16,
    /// Path plus query string, fragment removed.
    pub request_uri: String,
}

/// An HTTP request as seen by the token transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute URL or origin-form target (`/path?query`).
    pub uri: String,
    /// Header list; names compare case-insensitively and may repeat.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, uri: impl Into<String>) -> Self {
        Self { method, uri: uri.into(), headers: Vec::new(), body: Vec::new() }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(HttpMethod::GET, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(HttpMethod::POST, uri)
    }

    /// Builder-style header addition.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Builder-style body with its content type.
    pub fn with_body(mut self, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// First header with the given name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every header with the given name, in order.
    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces all headers of that name with a single value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Whether the body is (or may become) a url-encoded form.
    pub fn is_form(&self) -> bool {
        match self.content_type() {
            Some(ct) => ct
                .split(';')
                .next()
                .map(|main| main.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Path plus query, without scheme, authority or fragment.
    pub fn request_uri(&self) -> &str {
        let without_fragment = self.uri.split('#').next().unwrap_or("");
        match without_fragment.split_once("://") {
            Some((_, rest)) => match rest.find(['/', '?']) {
                Some(idx) => &rest[idx..],
                None => "/",
            },
            None if without_fragment.is_empty() => "/",
            None => without_fragment,
        }
    }

    /// Host, port and request URI, falling back to the `Host` header for origin-form targets.
    pub fn target(&self) -> RequestTarget {
        let (secure, authority) = match self.uri.split_once("://") {
            Some((scheme, rest)) => {
                let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
                (scheme.eq_ignore_ascii_case("https"), rest[..end].to_string())
            }
            None => (false, self.header("host").unwrap_or("").to_string()),
        };
        let default_port = if secure { 443 } else { 80 };
        let (host, port) = split_authority(&authority, default_port);
        RequestTarget { host, port, request_uri: self.request_uri().to_string() }
    }

    /// Decoded query parameters in order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        let without_fragment = self.uri.split('#').next().unwrap_or("");
        match without_fragment.split_once('?') {
            Some((_, query)) => parse_form(query),
            None => Vec::new(),
        }
    }

    /// Decoded form body parameters; empty unless the body is url-encoded.
    pub fn body_params(&self) -> Vec<(String, String)> {
        if !self.is_form() {
            return Vec::new();
        }
        parse_form(&String::from_utf8_lossy(&self.body))
    }

    /// Appends an encoded parameter to the query string, before any fragment.
    pub fn append_query_param(&mut self, name: &str, value: &str) {
        let pair = format!("{}={}", encode_component(name), encode_component(value));
        let (base, fragment) = match self.uri.split_once('#') {
            Some((b, f)) => (b.to_string(), Some(f.to_string())),
            None => (self.uri.clone(), None),
        };
        let separator = if !base.contains('?') {
            "?"
        } else if base.ends_with('?') || base.ends_with('&') {
            ""
        } else {
            "&"
        };
        let mut uri = format!("{}{}{}", base, separator, pair);
        if let Some(f) = fragment {
            uri.push('#');
            uri.push_str(&f);
        }
        self.uri = uri;
    }

    /// Appends an encoded parameter to a url-encoded body, marking the body as a form.
    pub fn append_body_param(&mut self, name: &str, value: &str) {
        if !self.is_form() {
            self.set_header("Content-Type", FORM_CONTENT_TYPE);
        }
        if !self.body.is_empty() {
            self.body.push(b'&');
        }
        self.body
            .extend_from_slice(format!("{}={}", encode_component(name), encode_component(value)).as_bytes());
    }
}

fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if let Some(rest) = authority.strip_prefix('[') {
        // bracketed IPv6 literal
        if let Some((addr, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok()).unwrap_or(default_port);
            return (format!("[{}]", addr), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
            (host.to_ascii_lowercase(), port.parse().unwrap_or(default_port))
        }
        _ => (authority.to_ascii_lowercase(), default_port),
    }
}

/// Everything except the RFC 3986 unreserved set.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Percent-encodes a single query or form component.
pub fn encode_component(input: &str) -> String {
    utf8_percent_encode(input, COMPONENT).to_string()
}

/// Decodes a single query or form component (`+` means space).
pub fn decode_component(input: &str) -> String {
    let spaced = input.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Parses `a=1&b=2` into decoded pairs, keeping order and duplicates.
pub fn parse_form(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut iter = pair.splitn(2, '=');
            let key = iter.next().unwrap_or("");
            let value = iter.next().unwrap_or("");
            (decode_component(key), decode_component(value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_from_absolute_uri() {
        let req = HttpRequest::get("http://Example.com/gmap?x=1#top");
        let target = req.target();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.request_uri, "/gmap?x=1");

        let tls = HttpRequest::get("https://api.example.com:8443");
        assert_eq!(tls.target().port, 8443);
        assert_eq!(tls.target().request_uri, "/");
    }

    #[test]
    fn target_from_host_header() {
        let req = HttpRequest::get("/resource?id=7").with_header("Host", "svc.local:9000");
        let target = req.target();
        assert_eq!(target.host, "svc.local");
        assert_eq!(target.port, 9000);
        assert_eq!(target.request_uri, "/resource?id=7");
    }

    #[test]
    fn unreserved_characters_stay_literal() {
        assert_eq!(encode_component("access_token"), "access_token");
        assert_eq!(encode_component("a-b.c~d_e"), "a-b.c~d_e");
        assert_eq!(encode_component("a+b/c=d"), "a%2Bb%2Fc%3Dd");
        assert_eq!(decode_component(&encode_component("x y&z")), "x y&z");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = HttpRequest::get("/").with_header("X-Token", "one").with_header("x-token", "two");
        assert_eq!(req.header("x-TOKEN"), Some("one"));
        assert_eq!(req.header("missing"), None);
    }

    #[test]
    fn query_append_keeps_fragment_and_encodes() {
        let mut req = HttpRequest::get("http://example.com/p?x=1#frag");
        req.append_query_param("access_token", "a b&c");
        assert_eq!(req.uri, "http://example.com/p?x=1&access_token=a%20b%26c#frag");
        assert_eq!(
            req.query_params(),
            vec![("x".to_string(), "1".to_string()), ("access_token".to_string(), "a b&c".to_string())]
        );
    }

    #[test]
    fn body_params_require_form_content_type() {
        let mut req = HttpRequest::post("http://example.com/p");
        req.append_body_param("scope", "read write");
        assert!(req.is_form());
        assert_eq!(req.body_params(), vec![("scope".to_string(), "read write".to_string())]);

        let json = HttpRequest::post("http://example.com/p").with_body("application/json", "a=1");
        assert!(json.body_params().is_empty());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let mut req = HttpRequest::get("/").with_header("authorization", "one").with_header("Authorization", "two");
        assert_eq!(req.headers_named("AUTHORIZATION").count(), 2);
        req.set_header("Authorization", "three");
        assert_eq!(req.headers_named("authorization").collect::<Vec<_>>(), vec!["three"]);
    }
}
