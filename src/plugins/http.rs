//! HTTP request/response parser plugin.
//!
//! Extracts the request method, host, URI, user agent and referer, and the
//! response status code and content type. A second request (or response)
//! arriving on a flow that already carries one closes the flow at the
//! message boundary via flush-with-reinsert, so each exported record
//! describes a single HTTP transaction.

use serde::Serialize;

use crate::export::fields::{FieldDef, IPFIX_HTTP_TEMPLATE};
use crate::export::wire::{put_framed_str, put_varlen};
use crate::flow::Flow;
use crate::packet::Packet;
use crate::plugins::{
    ExtType, FLOW_FLUSH_WITH_REINSERT, ProcessPlugin, RecordExt,
};

const MAX_METHOD_LEN: usize = 10;
const MAX_HOST_LEN: usize = 64;
const MAX_URI_LEN: usize = 128;
const MAX_AGENT_LEN: usize = 128;
const MAX_REFERER_LEN: usize = 128;
const MAX_CONTENT_TYPE_LEN: usize = 32;

/// HTTP extension record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpExt {
    pub method: String,
    pub host: String,
    pub uri: String,
    pub user_agent: String,
    pub referer: String,
    pub code: u16,
    pub content_type: String,
    /// A request has been stored in this record.
    pub req: bool,
    /// A response has been stored in this record.
    pub resp: bool,
}

impl HttpExt {
    pub fn fill_ipfix(&self, buf: &mut Vec<u8>) {
        put_varlen(buf, self.user_agent.as_bytes());
        put_varlen(buf, self.method.as_bytes());
        put_varlen(buf, self.host.as_bytes());
        put_varlen(buf, self.referer.as_bytes());
        put_varlen(buf, self.uri.as_bytes());
        put_varlen(buf, self.content_type.as_bytes());
        buf.extend_from_slice(&self.code.to_be_bytes());
    }

    pub fn fill_framed(&self, buf: &mut Vec<u8>) {
        put_framed_str(buf, self.user_agent.as_bytes());
        put_framed_str(buf, self.method.as_bytes());
        put_framed_str(buf, self.host.as_bytes());
        put_framed_str(buf, self.referer.as_bytes());
        put_framed_str(buf, self.uri.as_bytes());
        put_framed_str(buf, self.content_type.as_bytes());
        buf.extend_from_slice(&self.code.to_be_bytes());
    }
}

#[derive(Debug, Default, Clone)]
pub struct HttpPlugin {
    requests: u64,
    responses: u64,
    total: u64,
    flush_flow: bool,
}

impl ProcessPlugin for HttpPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn ext_type(&self) -> ExtType {
        ExtType::Http
    }

    fn post_create(&mut self, flow: &mut Flow, pkt: &Packet) -> u32 {
        let payload = pkt.payload();
        if is_request(payload) {
            self.add_request(payload, flow);
        } else if is_response(payload) {
            self.add_response(payload, flow);
        }
        0
    }

    fn pre_update(&mut self, flow: &mut Flow, pkt: &mut Packet) -> u32 {
        let payload = pkt.payload();
        if is_request(payload) {
            if flow.extension(ExtType::Http).is_none() {
                self.add_request(payload, flow);
                return 0;
            }
            if let Some(RecordExt::Http(rec)) = flow.extension_mut(ExtType::Http) {
                self.parse_request(payload, rec);
            }
            if self.flush_flow {
                self.flush_flow = false;
                return FLOW_FLUSH_WITH_REINSERT;
            }
        } else if is_response(payload) {
            if flow.extension(ExtType::Http).is_none() {
                self.add_response(payload, flow);
                return 0;
            }
            if let Some(RecordExt::Http(rec)) = flow.extension_mut(ExtType::Http) {
                self.parse_response(payload, rec);
            }
            if self.flush_flow {
                self.flush_flow = false;
                return FLOW_FLUSH_WITH_REINSERT;
            }
        }
        0
    }

    fn finish(&mut self) {
        tracing::info!(
            requests = self.requests,
            responses = self.responses,
            total = self.total,
            "http plugin stats"
        );
    }

    fn ipfix_fields(&self) -> &'static [FieldDef] {
        IPFIX_HTTP_TEMPLATE
    }

    fn framed_fields(&self) -> &'static str {
        "HTTP_USERAGENT,HTTP_METHOD,HTTP_DOMAIN,HTTP_REFERER,HTTP_URI,HTTP_CONTENT_TYPE,HTTP_STATUS"
    }

    fn clone_plugin(&self) -> Box<dyn ProcessPlugin> {
        Box::new(self.clone())
    }
}

impl HttpPlugin {
    fn add_request(&mut self, payload: &[u8], flow: &mut Flow) {
        let mut rec = HttpExt::default();
        if self.parse_request(payload, &mut rec) {
            flow.add_extension(RecordExt::Http(rec));
        }
    }

    fn add_response(&mut self, payload: &[u8], flow: &mut Flow) {
        let mut rec = HttpExt::default();
        if self.parse_response(payload, &mut rec) {
            flow.add_extension(RecordExt::Http(rec));
        }
    }

    fn parse_request(&mut self, payload: &[u8], rec: &mut HttpExt) -> bool {
        self.total += 1;
        if payload.is_empty() {
            return false;
        }

        // Request line: METHOD URI VERSION
        let Some(method_end) = find(payload, 0, b' ') else {
            return false;
        };
        let Some(uri_end) = find(payload, method_end + 1, b' ') else {
            return false;
        };
        if !payload[uri_end + 1..].starts_with(b"HTTP") {
            return false;
        }

        if rec.req {
            // A request is already stored; export the flow at the message
            // boundary and reparse against the fresh record.
            self.flush_flow = true;
            self.total -= 1;
            return false;
        }
        rec.method = copy_str(&payload[..method_end], MAX_METHOD_LEN);
        rec.uri = copy_str(&payload[method_end + 1..uri_end], MAX_URI_LEN);

        rec.host.clear();
        rec.user_agent.clear();
        rec.referer.clear();
        for (key, value) in HeaderLines::after(payload, uri_end) {
            match key {
                b"Host" => rec.host = copy_str(value, MAX_HOST_LEN),
                b"User-Agent" => rec.user_agent = copy_str(value, MAX_AGENT_LEN),
                b"Referer" => rec.referer = copy_str(value, MAX_REFERER_LEN),
                _ => {}
            }
        }

        rec.req = true;
        self.requests += 1;
        true
    }

    fn parse_response(&mut self, payload: &[u8], rec: &mut HttpExt) -> bool {
        self.total += 1;
        if !payload.starts_with(b"HTTP") {
            return false;
        }

        // Status line: VERSION CODE REASON
        let Some(version_end) = find(payload, 0, b' ') else {
            return false;
        };
        let Some(code_end) = find(payload, version_end + 1, b' ') else {
            return false;
        };
        let code: u16 = match std::str::from_utf8(&payload[version_end + 1..code_end])
            .ok()
            .and_then(|s| s.parse().ok())
        {
            Some(c) if c > 0 => c,
            _ => return false,
        };

        if rec.resp {
            self.flush_flow = true;
            self.total -= 1;
            return false;
        }
        rec.code = code;

        rec.content_type.clear();
        for (key, value) in HeaderLines::after(payload, code_end) {
            if key == b"Content-Type" {
                rec.content_type = copy_str(value, MAX_CONTENT_TYPE_LEN);
            }
        }

        rec.resp = true;
        self.responses += 1;
        true
    }
}

fn is_request(payload: &[u8]) -> bool {
    if payload.len() < 4 {
        return false;
    }
    matches!(
        &payload[..4],
        b"GET " | b"POST" | b"PUT " | b"HEAD" | b"DELE" | b"TRAC" | b"OPTI" | b"CONN" | b"PATC"
    )
}

fn is_response(payload: &[u8]) -> bool {
    payload.len() >= 4 && &payload[..4] == b"HTTP"
}

fn find(data: &[u8], from: usize, needle: u8) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..].iter().position(|&b| b == needle).map(|p| from + p)
}

/// Bounded copy of a header value, trailing CR stripped.
fn copy_str(value: &[u8], max: usize) -> String {
    let value = value.strip_suffix(b"\r").unwrap_or(value);
    let end = value.len().min(max);
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// Iterator over `KEY: VALUE` header lines, stopping at the blank line
/// that ends the header section.
struct HeaderLines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> HeaderLines<'a> {
    /// Starts after the line containing `offset` (the request/status line).
    fn after(data: &'a [u8], offset: usize) -> Self {
        let pos = match find(data, offset, b'\n') {
            Some(p) => p + 1,
            None => data.len(),
        };
        HeaderLines { data, pos }
    }
}

impl<'a> Iterator for HeaderLines<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.data.len() {
            let end = find(self.data, self.pos, b'\n')?;
            if end - self.pos <= 1 {
                // Blank line: end of header section.
                return None;
            }
            let line = &self.data[self.pos..end];
            self.pos = end + 1;
            if let Some(colon) = line.iter().position(|&b| b == b':') {
                let key = &line[..colon];
                let value = line.get(colon + 2..).unwrap_or(&[]);
                return Some((key, value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /index.html HTTP/1.1\r\n\
        Host: example.com\r\n\
        User-Agent: curl/8.0\r\n\
        Referer: http://other.example/\r\n\
        \r\n";

    const RESPONSE: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
        Content-Type: text/html\r\n\
        \r\n";

    #[test]
    fn parses_request() {
        let mut plugin = HttpPlugin::default();
        let mut rec = HttpExt::default();
        assert!(plugin.parse_request(REQUEST, &mut rec));
        assert_eq!(rec.method, "GET");
        assert_eq!(rec.uri, "/index.html");
        assert_eq!(rec.host, "example.com");
        assert_eq!(rec.user_agent, "curl/8.0");
        assert_eq!(rec.referer, "http://other.example/");
        assert!(rec.req);
    }

    #[test]
    fn parses_response() {
        let mut plugin = HttpPlugin::default();
        let mut rec = HttpExt::default();
        assert!(plugin.parse_response(RESPONSE, &mut rec));
        assert_eq!(rec.code, 404);
        assert_eq!(rec.content_type, "text/html");
        assert!(rec.resp);
    }

    #[test]
    fn second_request_sets_flush() {
        let mut plugin = HttpPlugin::default();
        let mut rec = HttpExt::default();
        assert!(plugin.parse_request(REQUEST, &mut rec));
        assert!(!plugin.parse_request(REQUEST, &mut rec));
        assert!(plugin.flush_flow);
    }

    #[test]
    fn non_http_payload_ignored() {
        assert!(!is_request(b"\x16\x03\x01\x02\x00"));
        assert!(!is_response(b"SSH-2.0-OpenSSH"));
        let mut plugin = HttpPlugin::default();
        let mut rec = HttpExt::default();
        assert!(!plugin.parse_request(b"GETX", &mut rec));
    }

    #[test]
    fn ipfix_fill_layout() {
        let rec = HttpExt {
            method: "GET".into(),
            host: "h".into(),
            uri: "/".into(),
            user_agent: "ua".into(),
            referer: String::new(),
            code: 200,
            content_type: "t".into(),
            req: true,
            resp: true,
        };
        let mut buf = Vec::new();
        rec.fill_ipfix(&mut buf);
        // user_agent, method, host, referer, uri, content_type, code
        assert_eq!(
            buf,
            vec![
                2, b'u', b'a', 3, b'G', b'E', b'T', 1, b'h', 0, 1, b'/', 1, b't', 0, 200
            ]
        );
    }
}
