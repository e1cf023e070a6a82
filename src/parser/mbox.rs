//! MBOX splitting.
//!
//! Every line starting with the literal `From ` ends the previous message and
//! starts a new one; the separator line itself is discarded. Tolerant of
//! mixed `\n`/`\r\n` line endings, a UTF-8 BOM, and separators that are not
//! preceded by a blank line (logged).

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::warn;

use crate::error::{MailError, Result};

/// Iterator over the raw messages of an in-memory MBOX blob, in file order.
///
/// Yields borrowed slices, so stopping early costs nothing: a caller that
/// wants to cancel simply stops pulling.
pub struct MboxSplitter<'a> {
    data: &'a [u8],
    pos: usize,
    /// Byte offset of the current message body (just past its separator).
    start: Option<usize>,
}

impl<'a> MboxSplitter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);
        Self {
            data,
            pos: 0,
            start: Some(0),
        }
    }
}

impl<'a> Iterator for MboxSplitter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        loop {
            let start = self.start?;
            let mut prev_line_blank = true;

            while self.pos < self.data.len() {
                let line_start = self.pos;
                let line_end = memchr_newline(&self.data[line_start..])
                    .map(|p| line_start + p + 1)
                    .unwrap_or(self.data.len());
                let line = &self.data[line_start..line_end];
                self.pos = line_end;

                if is_mbox_separator(line) {
                    if line_start > start && !prev_line_blank {
                        warn!(
                            offset = line_start,
                            "Found 'From ' separator without preceding blank line"
                        );
                    }
                    self.start = Some(line_end);
                    let chunk = &self.data[start..line_start];
                    if is_blank(chunk) {
                        // Nothing before the first separator, or two separators in a row
                        break;
                    }
                    return Some(chunk);
                }
                prev_line_blank = is_blank(line);
            }

            if self.pos >= self.data.len() && self.start == Some(start) {
                // EOF: flush the last message
                self.start = None;
                let chunk = &self.data[start..];
                return if is_blank(chunk) { None } else { Some(chunk) };
            }
        }
    }
}

/// Split an MBOX blob into individual raw messages, in delivery order.
///
/// Delivery order is file order: the earliest written message comes first,
/// so replies always find their already-delivered parents.
pub fn split_mbox(blob: &[u8]) -> Vec<Vec<u8>> {
    MboxSplitter::new(blob).map(<[u8]>::to_vec).collect()
}

/// Split an MBOX file without reading it all into a buffer first.
pub fn split_mbox_file(path: impl AsRef<Path>) -> Result<Vec<Vec<u8>>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            MailError::not_found("MBOX file", path.display())
        } else {
            MailError::io(path, e)
        }
    })?;
    if file.metadata().map_err(|e| MailError::io(path, e))?.len() == 0 {
        return Ok(Vec::new());
    }
    // SAFETY: the map is read-only and dropped before returning; concurrent
    // truncation of the file by another process is outside our contract.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| MailError::io(path, e))?;
    Ok(split_mbox(&mmap))
}

#[inline]
fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

/// Check whether a line is an MBOX separator (`From ` at the start).
fn is_mbox_separator(line: &[u8]) -> bool {
    line.starts_with(b"From ")
}

/// Empty or only whitespace / CR / LF.
fn is_blank(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| b == b'\n' || b == b'\r' || b == b' ' || b == b'\t')
}
