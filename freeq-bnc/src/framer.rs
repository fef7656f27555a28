//! Turns a raw byte stream into complete `\r\n`-terminated lines.
//!
//! TCP gives no message boundaries: one read may carry several lines, and
//! a single line (or its delimiter) may be split over many reads. The
//! framer keeps whatever follows the last delimiter and keeps reading until
//! the next line is complete.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::FrameError;
use crate::line::{DELIMITER, Line};

const READ_CHUNK: usize = 4096;

/// Line reader over one connection. The buffer is never shared.
pub struct LineFramer<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineFramer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    /// Read the next complete line, waiting for more bytes as needed.
    ///
    /// End of stream on a line boundary is [`FrameError::Closed`]; end of
    /// stream with buffered bytes is [`FrameError::Truncated`].
    pub async fn next_line(&mut self) -> Result<Line, FrameError> {
        // Where to resume scanning; bytes before this hold no delimiter start.
        let mut scanned = 0;
        loop {
            if let Some(i) = find_delimiter(&self.buf, scanned) {
                let rest = self.buf.split_off(i + DELIMITER.len());
                let mut line = std::mem::replace(&mut self.buf, rest);
                line.truncate(i);
                return Ok(Line::new(line));
            }
            // A '\r' at the very end may pair with a '\n' from the next read.
            scanned = self.buf.len().saturating_sub(DELIMITER.len() - 1);

            // Read into a local chunk so a dropped future leaves `buf` intact.
            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await?;
            self.buf.extend_from_slice(&chunk[..n]);

            if n == 0 {
                return if self.buf.is_empty() {
                    Err(FrameError::Closed)
                } else {
                    Err(FrameError::Truncated {
                        pending: self.buf.len(),
                    })
                };
            }
        }
    }
}

fn find_delimiter(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
        .map(|i| i + from)
}
