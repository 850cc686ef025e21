//! Newline framing for provider stdio.
//!
//! [`LineCodec`] accumulates raw output chunks, yields each complete line and
//! keeps the trailing partial line buffered until its terminator arrives.
//! Decoding never fails on content: non-UTF-8 lines, oversized lines and an
//! unterminated tail at end of stream come out as [`LineFrame::Invalid`] so a
//! single bad line cannot stop the reader.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Longest accepted line, terminator excluded.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

const PREVIEW_LEN: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineFrame {
    Line(String),
    Invalid { reason: String, preview: String },
}

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    // Bytes already scanned for a terminator
    next_index: usize,
    // Dropping the remainder of an oversized line
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }

    fn frame_from(raw: &[u8]) -> LineFrame {
        match std::str::from_utf8(raw) {
            Ok(text) => LineFrame::Line(text.to_string()),
            Err(e) => LineFrame::Invalid {
                reason: format!("line is not valid UTF-8: {e}"),
                preview: preview(raw),
            },
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(raw: &[u8]) -> String {
    let end = raw.len().min(PREVIEW_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn strip_terminator(mut line: &[u8]) -> &[u8] {
    if let Some(rest) = line.strip_suffix(b"\n") {
        line = rest;
    }
    if let Some(rest) = line.strip_suffix(b"\r") {
        line = rest;
    }
    line
}

impl Decoder for LineCodec {
    type Item = LineFrame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<LineFrame>> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    let _ = buf.split_to(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    let raw = buf.split_to(end + 1);
                    self.next_index = 0;
                    let line = strip_terminator(&raw);
                    if line.len() > self.max_length {
                        return Ok(Some(LineFrame::Invalid {
                            reason: format!("line exceeds {} bytes", self.max_length),
                            preview: preview(line),
                        }));
                    }
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(Self::frame_from(line)));
                }
                (false, None) => {
                    if buf.len() > self.max_length {
                        let frame = LineFrame::Invalid {
                            reason: format!("line exceeds {} bytes", self.max_length),
                            preview: preview(buf),
                        };
                        buf.clear();
                        self.next_index = 0;
                        self.discarding = true;
                        return Ok(Some(frame));
                    }
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<LineFrame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        let tail = buf.split();
        self.next_index = 0;
        if self.discarding || tail.iter().all(u8::is_ascii_whitespace) {
            self.discarding = false;
            return Ok(None);
        }
        Ok(Some(LineFrame::Invalid {
            reason: "unterminated line at end of stream".to_string(),
            preview: preview(&tail),
        }))
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = io::Error;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> io::Result<()> {
        let line = line.as_ref();
        if line.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frames must not contain a line terminator",
            ));
        }
        dst.reserve(line.len() + 1);
        dst.put(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
