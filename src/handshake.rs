//! HTTP/1.1 Upgrade handshake: request/response framing, Sec-WebSocket-Accept
//! derivation, and the plain-text HTTP error surface used before any
//! WebSocket frame has been exchanged.

use bytes::{BufMut, BytesMut};
use sha1::Digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_BYTES: usize = 8 * 1024;

fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        _ => "Error",
    }
}

/// generate a fresh base64-encoded 16 byte nonce for `Sec-WebSocket-Key`
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    base64::encode(nonce)
}

/// derive the `Sec-WebSocket-Accept` value for a given `Sec-WebSocket-Key`
pub fn accept_key(key: &str) -> String {
    let mut hasher = sha1::Sha1::default();
    hasher.update(key.as_bytes());
    hasher.update(GUID);
    base64::encode(hasher.finalize())
}

/// write a plain-text HTTP error response and leave the transport for the
/// caller to close. Never emits a WebSocket Close frame: at this point no
/// WebSocket connection has been established.
pub async fn write_http_error<S>(stream: &mut S, code: u16, body: &str) -> Result<(), WsError>
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\n\
         Content-Type: text/plain\r\n\
         Content-Language: en\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        code = code,
        reason = reason_phrase(code),
        len = body.len(),
        body = body,
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn read_until_headers_end<S>(stream: &mut S) -> Result<BytesMut, WsError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        if buf.len() >= MAX_REQUEST_BYTES {
            return Err(WsError::Handshake("request header too large".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(WsError::Handshake("connection closed during handshake".into()));
        }
        buf.put_u8(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            return Ok(buf);
        }
    }
}

/// outcome of reading and validating a server-side handshake request
pub struct ServerHandshake {
    pub key: String,
    /// the parsed opening request, kept around in case a handler wants to
    /// inspect headers `accept` itself doesn't care about (e.g. an
    /// `Origin` check layered on top of this crate)
    pub request: http::Request<()>,
}

/// build an `http::HeaderMap` from parsed `httparse` headers; gives the
/// caller case-insensitive lookup instead of a manual lowercase loop.
fn header_map(headers: &[httparse::Header<'_>]) -> http::HeaderMap {
    let mut map = http::HeaderMap::with_capacity(headers.len());
    for header in headers {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(header.name.as_bytes()),
            http::HeaderValue::from_bytes(header.value),
        ) {
            map.append(name, value);
        }
    }
    map
}

/// read, parse and validate the client's opening request, responding with
/// the 101 switching-protocols line on success.
///
/// On any validation failure this writes the matching HTTP error response
/// itself and returns `Err`; the caller's only remaining job is to drop the
/// transport.
pub async fn accept<S>(stream: &mut S, upgrade_path: &str) -> Result<ServerHandshake, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = read_until_headers_end(stream).await?;

    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut header_storage);
    if parsed.parse(&raw).is_err() {
        write_http_error(stream, 400, "malformed request line or headers").await?;
        return Err(WsError::Handshake("malformed request".into()));
    }

    if parsed.method != Some("GET") {
        write_http_error(stream, 405, "expected GET").await?;
        return Err(WsError::Handshake("method not GET".into()));
    }

    let target = parsed.path.unwrap_or_default().to_string();
    if target != upgrade_path {
        let body = format!("Invalid route! ({target})");
        write_http_error(stream, 400, &body).await?;
        return Err(WsError::Handshake(body));
    }

    let headers = header_map(&*parsed.headers);

    let has_upgrade = headers
        .get(http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let has_connection_upgrade = headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|token| token.trim().eq_ignore_ascii_case("upgrade")));
    let has_version_13 = headers
        .get("sec-websocket-version")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "13");
    let key = headers
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string());

    if !has_upgrade {
        write_http_error(stream, 400, "missing Upgrade: websocket header").await?;
        return Err(WsError::Handshake("missing upgrade header".into()));
    }
    if !has_connection_upgrade {
        write_http_error(stream, 400, "missing Connection: Upgrade header").await?;
        return Err(WsError::Handshake("missing connection header".into()));
    }
    if !has_version_13 {
        write_http_error(stream, 400, "Sec-WebSocket-Version must be 13").await?;
        return Err(WsError::Handshake("unsupported websocket version".into()));
    }
    let Some(key) = key else {
        write_http_error(stream, 400, "missing Sec-WebSocket-Key header").await?;
        return Err(WsError::Handshake("missing key header".into()));
    };

    let mut request_builder = http::Request::builder().method(http::Method::GET).uri(target);
    for (name, value) in headers.iter() {
        request_builder = request_builder.header(name.clone(), value.clone());
    }
    let request = request_builder
        .body(())
        .map_err(|e| WsError::Handshake(format!("failed to rebuild request: {e}")))?;

    let accept = accept_key(&key);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         \r\n"
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(ServerHandshake { key, request })
}

/// perform the client side of the handshake: send the Upgrade request, read
/// and validate the 101 response.
pub async fn connect<S>(
    stream: &mut S,
    host: &str,
    upgrade_path: &str,
) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    let expected_accept = accept_key(&key);

    let request = format!(
        "GET {upgrade_path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let raw = read_until_headers_end(stream).await?;
    let mut header_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut header_storage);
    response
        .parse(&raw)
        .map_err(|_| WsError::Handshake("malformed response".into()))?;

    if response.code != Some(101) {
        return Err(WsError::Handshake(format!(
            "expected 101 Switching Protocols, got {:?} {:?}",
            response.code, response.reason
        )));
    }

    let mut accept_seen = false;
    for header in response.headers.iter() {
        if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept_seen = true;
            if header.value != expected_accept.as_bytes() {
                return Err(WsError::Handshake(format!(
                    "Sec-WebSocket-Accept mismatch: expected {expected_accept}, got {:?}",
                    String::from_utf8_lossy(header.value)
                )));
            }
        }
    }
    if !accept_seen {
        return Err(WsError::Handshake("missing Sec-WebSocket-Accept header".into()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn accept_key_matches_rfc6455_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[tokio::test]
    async fn accept_and_connect_agree_on_the_accept_key() {
        let (mut client_side, mut server_side) = duplex(4096);

        let server = tokio::spawn(async move {
            accept(&mut server_side, "/ws").await.unwrap();
        });
        connect(&mut client_side, "localhost:0", "/ws").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn accept_rejects_mismatched_route() {
        let (mut client_side, mut server_side) = duplex(4096);

        let server = tokio::spawn(async move {
            let err = accept(&mut server_side, "/ws").await.unwrap_err();
            assert!(matches!(err, WsError::Handshake(msg) if msg.contains("Invalid route!")));
        });

        client_side
            .write_all(
                b"GET /other HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn accept_rejects_missing_key() {
        let (mut client_side, mut server_side) = duplex(4096);

        let server = tokio::spawn(async move {
            let err = accept(&mut server_side, "/ws").await.unwrap_err();
            assert!(matches!(err, WsError::Handshake(_)));
        });

        client_side
            .write_all(
                b"GET /ws HTTP/1.1\r\n\
                  Host: localhost\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  \r\n",
            )
            .await
            .unwrap();
        server.await.unwrap();
    }
}
