use std::io::{self, BufRead, ErrorKind};
use std::string::FromUtf8Error;

use crate::{Sequence, StatementRecord};

#[derive(Debug, thiserror::Error)]
pub enum SourceReadError {
    #[error("failed to read statement source at line {line}: {source}")]
    Io {
        line: u64,
        #[source]
        source: io::Error,
    },
    #[error("statement at line {line} is not valid UTF-8: {source}")]
    InvalidUtf8 {
        line: u64,
        #[source]
        source: FromUtf8Error,
    },
    #[error("statement source exceeds {} statements", u32::MAX)]
    TooManyStatements,
}

/// Lazily splits a byte stream into one [`StatementRecord`] per non-blank line.
///
/// The stream is consumed once. After the first error the iterator is exhausted.
pub struct StatementReader<R> {
    inner: R,
    fragment: Vec<u8>,
    line: u64,
    seen: u32,
    finished: bool,
}

/// One read from the buffered source: either a whole line or a piece of one.
enum Segment {
    Complete,
    Partial,
    End,
}

impl<R: BufRead> StatementReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, fragment: Vec::new(), line: 0, seen: 0, finished: false }
    }

    /// Number of statements yielded so far.
    #[must_use]
    pub fn statements_read(&self) -> u32 {
        self.seen
    }

    /// Append the next buffered piece of the current line to `fragment`.
    fn read_segment(&mut self) -> io::Result<Segment> {
        let available = loop {
            match self.inner.fill_buf() {
                Ok(buf) => break buf,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        };

        if available.is_empty() {
            return Ok(Segment::End);
        }

        match available.iter().position(|byte| *byte == b'\n') {
            Some(index) => {
                self.fragment.extend_from_slice(&available[..index]);
                self.inner.consume(index + 1);
                Ok(Segment::Complete)
            }
            None => {
                let len = available.len();
                self.fragment.extend_from_slice(available);
                self.inner.consume(len);
                Ok(Segment::Partial)
            }
        }
    }

    fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.read_segment()? {
                Segment::Partial => {}
                Segment::Complete => return Ok(Some(std::mem::take(&mut self.fragment))),
                Segment::End if self.fragment.is_empty() => return Ok(None),
                Segment::End => return Ok(Some(std::mem::take(&mut self.fragment))),
            }
        }
    }
}

fn strip_carriage_return(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

impl<R: BufRead> Iterator for StatementReader<R> {
    type Item = Result<StatementRecord, SourceReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        loop {
            let raw = match self.next_line() {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(source) => {
                    self.finished = true;
                    return Some(Err(SourceReadError::Io { line: self.line + 1, source }));
                }
            };
            self.line += 1;

            let bytes = strip_carriage_return(raw);
            if bytes.is_empty() {
                continue;
            }

            let Some(seen) = self.seen.checked_add(1) else {
                self.finished = true;
                return Some(Err(SourceReadError::TooManyStatements));
            };
            let text = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(source) => {
                    self.finished = true;
                    return Some(Err(SourceReadError::InvalidUtf8 { line: self.line, source }));
                }
            };

            self.seen = seen;
            return Some(Ok(StatementRecord { sequence: Sequence(seen), line: self.line, text }));
        }
    }
}
