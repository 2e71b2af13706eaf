//! Response status-line/header parsing and body framing (spec §4.3
//! "Response parse", "Body read").

use std::collections::BTreeMap;

use pg_util::CoreError;

use super::client::Session;

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    /// Header names are lowercased (case-insensitive per spec).
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Chunked,
    Length(usize),
    Close,
    None,
}

/// Parses the status line, then headers until the blank line, then reads
/// the body according to the framing the headers declare. Sets
/// `close_on_eof` on `session` when the server sent `connection: close`.
pub async fn read_response(session: &mut Session, is_head: bool) -> Result<Response, CoreError> {
    let status_line = session.read_line().await?;
    let (status, reason) = parse_status_line(&status_line)?;

    let mut headers = BTreeMap::new();
    loop {
        let line = session.read_line().await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header_line(&line)?;
        headers.insert(name, value);
    }

    if headers.get("transfer-encoding").is_some() && headers.get("content-length").is_some() {
        return Err(CoreError::Format(
            "content-length and transfer-encoding both present".into(),
        ));
    }
    if let Some(te) = headers.get("transfer-encoding") {
        if !te.eq_ignore_ascii_case("chunked") {
            return Err(CoreError::Format(format!("unsupported transfer-encoding: {te}")));
        }
    }

    if headers
        .get("connection")
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
    {
        session.close_on_eof = true;
    }

    let framing = if is_head {
        BodyFraming::None
    } else if headers.contains_key("transfer-encoding") {
        BodyFraming::Chunked
    } else if let Some(len) = headers.get("content-length") {
        let n = len
            .trim()
            .parse::<usize>()
            .map_err(|_| CoreError::Format(format!("bad content-length: {len}")))?;
        BodyFraming::Length(n)
    } else {
        BodyFraming::Close
    };

    let body = match framing {
        BodyFraming::None => Vec::new(),
        BodyFraming::Length(n) => session.read_exact(n).await?,
        BodyFraming::Chunked => read_chunked_body(session).await?,
        BodyFraming::Close => session.read_to_end().await?,
    };

    Ok(Response {
        status,
        reason,
        headers,
        body,
    })
}

fn parse_status_line(line: &str) -> Result<(u16, String), CoreError> {
    let rest = line
        .strip_prefix("HTTP/1.1 ")
        .ok_or_else(|| CoreError::Format(format!("bad status line: {line:?}")))?;
    if rest.len() < 3 {
        return Err(CoreError::Format(format!("bad status line: {line:?}")));
    }
    let (code_str, tail) = rest.split_at(3);
    let code = code_str
        .parse::<u16>()
        .map_err(|_| CoreError::Format(format!("bad status code: {code_str:?}")))?;
    let reason = tail.strip_prefix(' ').unwrap_or(tail).to_string();
    Ok((code, reason))
}

fn parse_header_line(line: &str) -> Result<(String, String), CoreError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| CoreError::Format(format!("bad header line: {line:?}")))?;
    Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
}

async fn read_chunked_body(session: &mut Session) -> Result<Vec<u8>, CoreError> {
    let mut body = Vec::new();
    loop {
        let size_line = session.read_line().await?;
        let size_str = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| CoreError::Format(format!("bad chunk size: {size_line:?}")))?;
        if size == 0 {
            // Trailing headers (if any) up to the terminating blank line.
            loop {
                let trailer = session.read_line().await?;
                if trailer.is_empty() {
                    break;
                }
            }
            break;
        }
        let chunk = session.read_exact(size).await?;
        body.extend_from_slice(&chunk);
        let crlf = session.read_line().await?;
        if !crlf.is_empty() {
            return Err(CoreError::Format("malformed chunk terminator".into()));
        }
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Two chunks (32 and 16 bytes) over a real loopback connection,
    /// ending with the zero-size terminator chunk and a blank trailer line.
    #[tokio::test]
    async fn reads_chunked_body_from_two_chunks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let first = vec![b'a'; 32];
            let second = vec![b'b'; 16];
            stream.write_all(format!("{:x}\r\n", first.len()).as_bytes()).await.unwrap();
            stream.write_all(&first).await.unwrap();
            stream.write_all(b"\r\n").await.unwrap();
            stream.write_all(format!("{:x}\r\n", second.len()).as_bytes()).await.unwrap();
            stream.write_all(&second).await.unwrap();
            stream.write_all(b"\r\n").await.unwrap();
            stream.write_all(b"0\r\n\r\n").await.unwrap();
        });

        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let mut session = Session::test_session(stream);
        let body = read_chunked_body(&mut session).await.unwrap();

        assert_eq!(body.len(), 48);
        assert!(body[..32].iter().all(|&b| b == b'a'));
        assert!(body[32..].iter().all(|&b| b == b'b'));

        server.await.unwrap();
    }

    #[test]
    fn parses_status_line() {
        let (code, reason) = parse_status_line("HTTP/1.1 200 OK").unwrap();
        assert_eq!(code, 200);
        assert_eq!(reason, "OK");
    }

    #[test]
    fn parses_status_line_empty_reason() {
        let (code, reason) = parse_status_line("HTTP/1.1 204 ").unwrap();
        assert_eq!(code, 204);
        assert_eq!(reason, "");
    }

    #[test]
    fn rejects_non_http11_status_line() {
        assert!(parse_status_line("HTTP/1.0 200 OK").is_err());
    }

    #[test]
    fn header_line_is_lowercased() {
        let (name, value) = parse_header_line("Content-Length: 4").unwrap();
        assert_eq!(name, "content-length");
        assert_eq!(value, "4");
    }
}
