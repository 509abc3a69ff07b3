//! Newline message framing for JSON-RPC over worker stdio.
//!
//! Every envelope travels as one line of JSON terminated by `\n`. The read
//! side is a push-style [`LineFramer`]: bytes are fed in as they arrive from
//! the worker and complete lines come out, with any trailing partial line
//! held back until the next read completes it.
//!
//! # Wire Format
//!
//! ```text
//! {"protocol":"2.0","method":"memory_search","params":{...},"id":1}\n
//! {"protocol":"2.0","id":1,"result":{...}}\n
//! ```
//!
//! Carriage returns before the newline are stripped, and blank lines are
//! skipped rather than reported.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::ipc::error::IpcError;

/// Accumulates bytes from the worker's stdout and splits them into lines.
///
/// Splitting happens on raw bytes, so a multi-byte UTF-8 character that
/// straddles two reads is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct LineFramer {
    /// Bytes received since the last line boundary.
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect every line it completes.
    ///
    /// Returns zero or more lines with the terminator removed. Blank and
    /// whitespace-only lines are dropped. An unterminated tail is retained
    /// and prefixed to the next call's input.
    ///
    /// # Example
    ///
    /// ```
    /// use memoria::ipc::LineFramer;
    ///
    /// let mut framer = LineFramer::new();
    /// assert!(framer.feed(b"{").is_empty());
    /// assert_eq!(framer.feed(b"\"a\":1}\n"), vec![r#"{"a":1}"#.to_string()]);
    /// ```
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.buffer.is_empty() {
                push_line(&mut lines, head);
            } else {
                self.buffer.extend_from_slice(head);
                let line = std::mem::take(&mut self.buffer);
                push_line(&mut lines, &line);
            }
        }

        self.buffer.extend_from_slice(rest);
        lines
    }

    /// Flush the unterminated tail once the stream has ended.
    ///
    /// Returns `None` when nothing but whitespace was buffered.
    pub fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.buffer);
        let mut lines = Vec::with_capacity(1);
        push_line(&mut lines, &tail);
        lines.pop()
    }

    /// Number of bytes held back waiting for a line terminator.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Decode one raw line and keep it if it carries anything but whitespace.
fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    if text.trim().is_empty() {
        return;
    }
    lines.push(text.into_owned());
}

/// Write one newline-terminated message to the worker's stdin.
///
/// The body must not itself contain a newline; serde_json's compact output
/// never does.
///
/// # Errors
///
/// Returns `IpcError::ConnectionClosed` if the worker has closed its end of
/// the pipe, or `IpcError::Io` for any other write or flush failure.
pub async fn write_line<W>(writer: &mut W, body: &str) -> Result<(), IpcError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.extend_from_slice(body.as_bytes());
    frame.push(b'\n');

    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}
