//! Content-Length framing codec.
//!
//! Every message is framed as ASCII headers terminated by `\r\n\r\n`,
//! followed by a UTF-8 payload of exactly `Content-Length` bytes. Header
//! names are case-insensitive; headers other than `Content-Length` are
//! ignored. The payload is decoded as UTF-8 regardless of any
//! `Content-Type` charset parameter, matching what LSP peers do in
//! practice.

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RpcError, RpcResult};

/// Length of the shortest possible header section,
/// `Content-Length: 0\r\n\r\n`. Reads start with this many bytes before
/// scanning byte-by-byte for the terminator.
const MIN_HEADER_LEN: usize = 21;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reads framed payloads off a byte stream.
pub struct FrameReader<R> {
    inner: R,
    content_length: Regex,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            content_length: Regex::new(r"(?i)^content-length:\s*(\d+)\s*$").unwrap(),
        }
    }

    /// Read one frame and return its raw payload bytes.
    ///
    /// Returns `RpcError::StreamClosed` when the peer closed the stream at
    /// a frame boundary, and `RpcError::Framing` for malformed headers or a
    /// truncated payload; the caller logs the latter and keeps reading.
    pub async fn read_frame(&mut self) -> RpcResult<Vec<u8>> {
        let header = self.read_header_block().await?;
        let length = self.parse_content_length(&header)?;

        let mut payload = vec![0u8; length];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    RpcError::Framing(format!("truncated payload, expected {} bytes", length))
                }
                _ => RpcError::Io(err),
            })?;

        Ok(payload)
    }

    /// Read the header section through its CRLF-CRLF terminator.
    async fn read_header_block(&mut self) -> RpcResult<Vec<u8>> {
        let mut header = vec![0u8; MIN_HEADER_LEN];
        match self.inner.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(RpcError::StreamClosed);
            }
            Err(err) => return Err(RpcError::Io(err)),
        }

        // Past the minimum, take one byte at a time until the terminator.
        while !header.ends_with(HEADER_TERMINATOR) {
            let mut byte = [0u8; 1];
            match self.inner.read_exact(&mut byte).await {
                Ok(_) => header.push(byte[0]),
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(RpcError::StreamClosed);
                }
                Err(err) => return Err(RpcError::Io(err)),
            }
        }

        Ok(header)
    }

    fn parse_content_length(&self, header: &[u8]) -> RpcResult<usize> {
        let text = std::str::from_utf8(header)
            .map_err(|_| RpcError::Framing("header section is not ASCII".to_string()))?;

        for line in text.split("\r\n") {
            if let Some(captures) = self.content_length.captures(line) {
                return captures[1]
                    .parse::<usize>()
                    .map_err(|_| RpcError::Framing(format!("invalid Content-Length: {}", line)));
            }
        }

        Err(RpcError::Framing("missing Content-Length header".to_string()))
    }
}

/// Writes framed payloads to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one frame: header, terminator and payload go out as a single
    /// write, flushed before the next message begins.
    pub async fn write_frame(&mut self, payload: &[u8]) -> RpcResult<()> {
        let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_one(input: &[u8]) -> RpcResult<Vec<u8>> {
        let mut reader = FrameReader::new(input);
        reader.read_frame().await
    }

    #[tokio::test]
    async fn round_trip() {
        let payload = r#"{"jsonrpc":"2.0","method":"ping"}"#;
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.write_frame(payload.as_bytes()).await.unwrap();
        }

        let got = read_one(&out).await.unwrap();
        assert_eq!(got, payload.as_bytes());
    }

    #[tokio::test]
    async fn header_names_are_case_insensitive() {
        let input = b"CONTENT-LENGTH: 2\r\n\r\nhi";
        assert_eq!(read_one(input).await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn other_headers_are_ignored() {
        let input =
            b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: 4\r\n\r\nbody";
        assert_eq!(read_one(input).await.unwrap(), b"body");
    }

    #[tokio::test]
    async fn eof_at_boundary_is_stream_closed() {
        assert!(matches!(read_one(b"").await, Err(RpcError::StreamClosed)));
    }

    #[tokio::test]
    async fn eof_inside_header_is_stream_closed() {
        assert!(matches!(
            read_one(b"Content-Length: 10\r\n").await,
            Err(RpcError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn missing_content_length_is_a_framing_error() {
        let input = b"Content-Type: application/json\r\n\r\n{}";
        assert!(matches!(read_one(input).await, Err(RpcError::Framing(_))));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_framing_error() {
        let input = b"Content-Length: 10\r\n\r\nshort";
        assert!(matches!(read_one(input).await, Err(RpcError::Framing(_))));
    }

    #[tokio::test]
    async fn two_messages_in_one_buffer() {
        let input = b"Content-Length: 1\r\n\r\naContent-Length: 1\r\n\r\nb".to_vec();
        let mut reader = FrameReader::new(input.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), b"a");
        assert_eq!(reader.read_frame().await.unwrap(), b"b");
        assert!(matches!(
            reader.read_frame().await,
            Err(RpcError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn multibyte_payload_length_is_bytes_not_chars() {
        let payload = "héllo";
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.write_frame(payload.as_bytes()).await.unwrap();
        }
        let text = String::from_utf8(out.clone()).unwrap();
        assert!(text.starts_with(&format!("Content-Length: {}\r\n\r\n", payload.len())));
        assert_eq!(read_one(&out).await.unwrap(), payload.as_bytes());
    }
}
