//! `Content-Length` framing for byte-stream transports.
//!
//! Each frame is a header block terminated by an empty line, then exactly
//! `Content-Length` bytes of body:
//!
//! ```text
//! Content-Length: 52\r\n
//! Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n
//! \r\n
//! {"jsonrpc":"2.0","method":"initialized","params":{}}
//! ```
//!
//! Only the body is handed upward; the codec decides what it means.

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Largest accepted frame body (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Upper bound on the header block, so a peer that never sends the blank
/// separator cannot grow it without limit.
const MAX_HEADER_BYTES: usize = 8 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Next frame body, or `Ok(None)` when the stream ends between frames.
    ///
    /// A stream that ends inside a frame, a missing or unparsable
    /// `Content-Length`, and frames over [`MAX_FRAME_BYTES`] are errors.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };
        if len > MAX_FRAME_BYTES {
            bail!("frame of {len} bytes exceeds the {MAX_FRAME_BYTES} byte limit");
        }

        let mut body = vec![0; len];
        self.reader
            .read_exact(&mut body)
            .await
            .with_context(|| format!("reading {len} byte frame body"))?;
        Ok(Some(body))
    }

    async fn read_header_block(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut header_bytes = 0;

        loop {
            self.line.clear();
            // One byte past the budget is enough to tell an oversized header
            // apart from one that fits exactly.
            let budget = (MAX_HEADER_BYTES - header_bytes + 1) as u64;
            let n = (&mut self.reader)
                .take(budget)
                .read_line(&mut self.line)
                .await
                .context("reading frame header")?;
            if n == 0 {
                if header_bytes == 0 {
                    return Ok(None);
                }
                bail!("stream ended inside a frame header");
            }

            header_bytes += n;
            if header_bytes > MAX_HEADER_BYTES {
                bail!("frame header exceeds {MAX_HEADER_BYTES} bytes");
            }
            if !self.line.ends_with('\n') {
                bail!("stream ended inside a frame header");
            }

            let line = self.line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(':') else {
                bail!("malformed header line {line:?}");
            };
            if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                continue;
            }

            let len: usize = value
                .trim()
                .parse()
                .with_context(|| format!("invalid {CONTENT_LENGTH} {:?}", value.trim()))?;
            match content_length {
                Some(previous) if previous != len => {
                    bail!("conflicting {CONTENT_LENGTH} headers: {previous} and {len}");
                }
                _ => content_length = Some(len),
            }
        }

        content_length
            .map(Some)
            .with_context(|| format!("frame header has no {CONTENT_LENGTH}"))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write `body` as one frame and flush it.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<()> {
        let mut frame = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len()).into_bytes();
        frame.extend_from_slice(body);
        self.writer
            .write_all(&frame)
            .await
            .context("writing frame")?;
        self.writer.flush().await.context("flushing frame")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("shutting down writer")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn read_all(input: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut reader = FrameReader::new(input);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().await? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[tokio::test]
    async fn test_written_frames_read_back_in_order() {
        let first = br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let second = br#"{"jsonrpc":"2.0","method":"initialized"}"#;

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(first).await.unwrap();
        writer.write_frame(second).await.unwrap();

        let frames = read_all(&buf).await.unwrap();
        assert_eq!(frames, vec![first.to_vec(), second.to_vec()]);
    }

    #[tokio::test]
    async fn test_header_counts_bytes_not_chars() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf)
            .write_frame("{\"k\":\"é\"}".as_bytes())
            .await
            .unwrap();
        assert!(buf.starts_with(b"Content-Length: 10\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_end() {
        assert!(read_all(b"").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_extra_headers_and_header_case_are_tolerated() {
        let input = b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\ncontent-length: 2\r\n\r\n{}";
        assert_eq!(read_all(input).await.unwrap(), vec![b"{}".to_vec()]);
    }

    #[tokio::test]
    async fn test_bare_newlines_are_accepted() {
        assert_eq!(
            read_all(b"Content-Length: 2\n\n{}").await.unwrap(),
            vec![b"{}".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_repeated_identical_length_is_fine() {
        let input = b"Content-Length: 2\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(read_all(input).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_frames_are_errors() {
        let cases: &[&[u8]] = &[
            b"Content-Type: application/json\r\n\r\n{}",
            b"Content-Length: 10\r\n",
            b"Content-Length: 100\r\n\r\nhello",
            b"Content-Length: ten\r\n\r\n",
            b"Content-Length: 2\r\nContent-Length: 3\r\n\r\n{}",
            b"no colon here\r\n\r\n",
        ];
        for input in cases {
            assert!(
                read_all(input).await.is_err(),
                "accepted {:?}",
                String::from_utf8_lossy(input)
            );
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_reading_body() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let err = read_all(header.as_bytes()).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn test_endless_header_block_is_rejected() {
        let mut input = Vec::new();
        while input.len() <= MAX_HEADER_BYTES {
            input.extend_from_slice(b"X-Padding: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n");
        }
        let err = read_all(&input).await.unwrap_err();
        assert!(err.to_string().contains("frame header exceeds"));
    }

    #[tokio::test]
    async fn test_header_line_without_newline_is_bounded() {
        let mut reader = FrameReader::new(tokio::io::repeat(b'a'));
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), reader.read_frame())
            .await
            .expect("reader must give up on an endless header line");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("frame header exceeds"));
        assert!(reader.line.len() <= MAX_HEADER_BYTES + 1);
    }
}
