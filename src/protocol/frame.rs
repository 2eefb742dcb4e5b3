use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{PrexdError, Result};
use crate::shmem::MAX_SCRIPT_SIZE;

/// Longest header we accept: the decimal digits of `MAX_SCRIPT_SIZE` plus
/// the terminating line feed.
const MAX_HEADER_LEN: usize = 10;

/// Streaming parser for one length-prefixed frame.
///
/// Feed network chunks through [`on_chunk`](FrameCodec::on_chunk) until
/// [`is_complete`](FrameCodec::is_complete) reports true, then take the
/// payload. Not thread-safe; one instance per connection, reset between
/// requests.
#[derive(Debug, Default)]
pub struct FrameCodec {
    header: Vec<u8>,
    expected: Option<usize>,
    payload: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the next chunk off the stream. Returns the number of bytes
    /// that belonged to the current frame; callers that batch reads can
    /// hand the remainder to the next frame after `reset`.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        if self.expected.is_none() {
            while consumed < bytes.len() {
                let b = bytes[consumed];
                consumed += 1;
                if b == b'\n' {
                    self.parse_header()?;
                    break;
                }
                if !b.is_ascii_digit() || self.header.len() >= MAX_HEADER_LEN {
                    return Err(PrexdError::MalformedHeader);
                }
                self.header.push(b);
            }
        }

        if let Some(expected) = self.expected {
            let want = expected - self.payload.len();
            let take = want.min(bytes.len() - consumed);
            self.payload
                .extend_from_slice(&bytes[consumed..consumed + take]);
            consumed += take;
        }

        Ok(consumed)
    }

    fn parse_header(&mut self) -> Result<()> {
        let header = std::str::from_utf8(&self.header).map_err(|_| PrexdError::MalformedHeader)?;
        let len: usize = header.parse().map_err(|_| PrexdError::MalformedHeader)?;
        if len > MAX_SCRIPT_SIZE {
            return Err(PrexdError::MalformedHeader);
        }
        self.expected = Some(len);
        self.payload.reserve(len);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.expected, Some(expected) if self.payload.len() >= expected)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.is_complete().then_some(self.payload.as_slice())
    }

    pub fn reset(&mut self) {
        self.header.clear();
        self.expected = None;
        self.payload.clear();
    }
}

/// Frame a payload for the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let header = payload.len().to_string();
    let mut out = Vec::with_capacity(header.len() + 1 + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Read one complete frame off a stream. EOF before the frame completes is
/// a malformed header or payload depending on how far parsing got.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>> {
    let mut codec = FrameCodec::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return if codec.header.is_empty() && codec.expected.is_none() {
                // Clean close between frames.
                Err(PrexdError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed",
                )))
            } else if codec.expected.is_none() {
                Err(PrexdError::MalformedHeader)
            } else {
                Err(PrexdError::MalformedPayload("truncated frame".into()))
            };
        }
        codec.on_chunk(&buf[..n])?;
        if codec.is_complete() {
            return Ok(std::mem::take(&mut codec.payload));
        }
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> Result<()> {
    stream.write_all(&encode(payload)).await?;
    stream.flush().await?;
    Ok(())
}
