//! Request encoding (spec §4.3 "Request").

use std::collections::BTreeMap;

/// Headers are ordered (BTreeMap, not because the wire format requires
/// sorting, but so the encoded request is deterministic for tests).
pub struct Request<'a> {
    pub verb: &'static str,
    pub encoded_uri: String,
    pub encoded_query: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub content: Option<&'a [u8]>,
}

impl<'a> Request<'a> {
    /// `verb SP encoded_uri[?encoded_query] SP HTTP/1.1 CRLF` followed by
    /// each header `name:value CRLF`, a blank line, then the body if any.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.verb.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.encoded_uri.as_bytes());
        if let Some(q) = &self.encoded_query {
            out.push(b'?');
            out.extend_from_slice(q.as_bytes());
        }
        out.extend_from_slice(b" HTTP/1.1\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.push(b':');
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if let Some(body) = self.content {
            out.extend_from_slice(body);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_request_line_headers_and_body() {
        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), "example.com".to_string());
        headers.insert("content-length".to_string(), "5".to_string());

        let req = Request {
            verb: "PUT",
            encoded_uri: "/a/b".to_string(),
            encoded_query: Some("x=1".to_string()),
            headers,
            content: Some(b"hello"),
        };

        let encoded = req.encode();
        assert_eq!(
            encoded,
            b"PUT /a/b?x=1 HTTP/1.1\r\ncontent-length:5\r\nhost:example.com\r\n\r\nhello".to_vec()
        );
    }
}
