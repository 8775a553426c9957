//! Wire framer: turns a byte stream into [`Frame`]s

use crate::constants::{HEADER_CONTENT_LENGTH, MAX_MESSAGE_SIZE};
use crate::error::{EslError, EslResult};
use crate::frame::{Frame, Headers};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Reads MIME-style frames off a buffered byte stream.
///
/// A frame is a block of `key: value` lines terminated by a blank line,
/// optionally followed by exactly `Content-Length` body bytes. Lines may be
/// CRLF- or LF-delimited; the terminator is a bare blank line either way.
pub struct Framer<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> Framer<R> {
    /// Wrap a buffered reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one complete frame.
    ///
    /// Errors: [`EslError::ConnectionClosed`] on clean EOF at a frame
    /// boundary, [`EslError::Framing`] on a malformed header line, an
    /// oversized or non-numeric `Content-Length`, or EOF mid-frame, and
    /// [`EslError::Io`] on transport failure.
    pub async fn read_frame(&mut self) -> EslResult<Frame> {
        let headers = self.read_header_block().await?;

        let body = match headers.get_raw(HEADER_CONTENT_LENGTH) {
            Some(raw) => Some(self.read_body(raw).await?),
            None => None,
        };

        Ok(Frame::new(headers, body))
    }

    async fn read_header_block(&mut self) -> EslResult<Headers> {
        let mut headers = Headers::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            let n = self.reader.read_until(b'\n', &mut line).await?;
            if n == 0 {
                if headers.is_empty() {
                    // EOF between frames: the peer hung up cleanly.
                    return Err(EslError::ConnectionClosed);
                }
                return Err(EslError::framing("EOF inside header block"));
            }

            let text = std::str::from_utf8(&line)
                .map_err(|_| EslError::framing("invalid UTF-8 in header line"))?;
            let text = text.trim_end_matches(['\n', '\r']);
            if text.is_empty() {
                // Blank line terminates the header block.
                return Ok(headers);
            }

            match text.split_once(':') {
                Some((name, value)) => {
                    headers.insert(name.trim(), value.trim());
                }
                None => {
                    return Err(EslError::Framing(format!(
                        "malformed header line: {text:?}"
                    )));
                }
            }
        }
    }

    async fn read_body(&mut self, content_length: &str) -> EslResult<String> {
        let length: usize = content_length
            .trim()
            .parse()
            .map_err(|_| {
                EslError::Framing(format!("invalid Content-Length: {content_length:?}"))
            })?;
        if length > MAX_MESSAGE_SIZE {
            return Err(EslError::Framing(format!(
                "Content-Length {length} exceeds limit {MAX_MESSAGE_SIZE}"
            )));
        }

        let mut body = vec![0u8; length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    EslError::framing("EOF before Content-Length bytes were read")
                }
                _ => EslError::Io(e),
            })?;

        String::from_utf8(body).map_err(|_| EslError::framing("invalid UTF-8 in body"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;
    use tokio::io::BufReader;

    async fn read_one(data: &[u8]) -> EslResult<Frame> {
        let mut framer = Framer::new(BufReader::new(data));
        framer.read_frame().await
    }

    #[tokio::test]
    async fn parses_headers_without_body() {
        let frame = read_one(b"Content-Type: auth/request\r\n\r\n").await.unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::AuthRequest));
        assert!(frame.body().is_none());
    }

    #[tokio::test]
    async fn parses_lf_only_frames() {
        let frame = read_one(b"Content-Type: auth/request\n\n").await.unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::AuthRequest));
    }

    #[tokio::test]
    async fn reads_exact_body_bytes() {
        let frame = read_one(b"Content-Type: api/response\r\nContent-Length: 2\r\n\r\nOK")
            .await
            .unwrap();
        assert_eq!(frame.kind(), Some(FrameKind::ApiResponse));
        assert_eq!(frame.body(), Some("OK"));
    }

    #[tokio::test]
    async fn zero_length_body_consumes_nothing() {
        let data = b"Content-Type: api/response\r\nContent-Length: 0\r\n\r\nContent-Type: auth/request\r\n\r\n";
        let mut framer = Framer::new(BufReader::new(&data[..]));
        let first = framer.read_frame().await.unwrap();
        assert_eq!(first.body(), Some(""));
        let second = framer.read_frame().await.unwrap();
        assert_eq!(second.kind(), Some(FrameKind::AuthRequest));
    }

    #[tokio::test]
    async fn body_boundary_is_exact_between_frames() {
        let data = b"Content-Type: api/response\r\nContent-Length: 5\r\n\r\nhelloContent-Type: auth/request\r\n\r\n";
        let mut framer = Framer::new(BufReader::new(&data[..]));
        let first = framer.read_frame().await.unwrap();
        assert_eq!(first.body(), Some("hello"));
        let second = framer.read_frame().await.unwrap();
        assert_eq!(second.kind(), Some(FrameKind::AuthRequest));
    }

    #[tokio::test]
    async fn short_body_is_framing_error() {
        let err = read_one(b"Content-Type: api/response\r\nContent-Length: 10\r\n\r\ntest")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_header_line_is_framing_error() {
        let err = read_one(b"not a header line\r\n\r\n").await.unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn non_numeric_content_length_rejected() {
        let err = read_one(b"Content-Type: api/response\r\nContent-Length: abc\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_content_length_rejected() {
        let data = format!(
            "Content-Type: api/response\r\nContent-Length: {}\r\n\r\n",
            MAX_MESSAGE_SIZE + 1
        );
        let err = read_one(data.as_bytes()).await.unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn clean_eof_reports_connection_closed() {
        let err = read_one(b"").await.unwrap_err();
        assert!(matches!(err, EslError::ConnectionClosed), "got {err:?}");
    }

    #[tokio::test]
    async fn eof_inside_headers_is_framing_error() {
        let err = read_one(b"Content-Type: auth/request\r\n").await.unwrap_err();
        assert!(matches!(err, EslError::Framing(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn duplicate_headers_preserved() {
        let frame = read_one(b"X-Multi: one\r\nX-Multi: two\r\nContent-Type: command/reply\r\n\r\n")
            .await
            .unwrap();
        assert_eq!(
            frame.headers.len(),
            3
        );
        assert_eq!(
            frame.headers.get_raw("X-Multi"),
            Some("one")
        );
    }
}
