//! Incremental line reader for append-only files.
//!
//! A [`LineReader`] remembers the committed [`Checkpoint`] of one file plus
//! any bytes read past it that do not yet end in a newline. Each call reads
//! only bytes appended since the last call and yields complete lines; the
//! partial tail waits in the buffer until its newline arrives.

use crate::error::Result;
use crate::types::Checkpoint;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// One complete, non-blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 1-based line number within the file
    pub line_number: u64,
    /// Byte offset of the first byte of the line
    pub byte_offset: u64,
    /// Line text without the terminator; invalid UTF-8 replaced
    pub text: String,
}

/// Outcome of one incremental read.
#[derive(Debug, Default)]
pub struct IncrementalRead {
    pub lines: Vec<Line>,
    /// Position just past the last consumed line
    pub new_checkpoint: Checkpoint,
    /// The file was shorter than the checkpoint and was re-read from 0
    pub truncated: bool,
    /// Stopped at `max_lines` with complete lines still buffered
    pub capped: bool,
    pub file_size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl IncrementalRead {
    pub fn lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter()
    }
}

impl IntoIterator for IncrementalRead {
    type Item = Line;
    type IntoIter = std::vec::IntoIter<Line>;

    fn into_iter(self) -> Self::IntoIter {
        self.lines.into_iter()
    }
}

/// Read every complete line appended after `from`.
pub fn open_incremental(path: &Path, from: Checkpoint) -> Result<IncrementalRead> {
    LineReader::new(path).read(from, usize::MAX)
}

/// Tail state for one file.
#[derive(Debug)]
pub struct LineReader {
    path: PathBuf,
    committed: Checkpoint,
    /// Bytes after `committed.offset` not yet yielded
    pending: Vec<u8>,
}

impl LineReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            committed: Checkpoint::default(),
            pending: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of an unfinished trailing line currently held.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Read up to `max_lines` complete lines after `from`.
    pub fn read(&mut self, from: Checkpoint, max_lines: usize) -> Result<IncrementalRead> {
        if !from.same_position(&self.committed) {
            self.pending.clear();
        }
        self.committed = from;

        let metadata = std::fs::metadata(&self.path)?;
        let file_size = metadata.len();
        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);

        let mut truncated = false;
        if file_size < self.committed.offset {
            tracing::warn!(
                path = %self.path.display(),
                checkpoint_offset = self.committed.offset,
                file_size,
                "File truncated, restarting from the beginning"
            );
            truncated = true;
            self.committed = self.committed.reset();
            self.pending.clear();
        }

        let mut read_pos = self.committed.offset + self.pending.len() as u64;
        if file_size < read_pos {
            // The unfinished tail was rewritten; read it again.
            self.pending.clear();
            read_pos = self.committed.offset;
        }

        if file_size > read_pos {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(read_pos))?;
            file.take(file_size - read_pos)
                .read_to_end(&mut self.pending)?;
        }

        let mut lines = Vec::new();
        let mut cursor = 0usize;
        let mut offset = self.committed.offset;
        let mut line_number = self.committed.line;
        let mut capped = false;

        while let Some(pos) = self.pending[cursor..].iter().position(|&b| b == b'\n') {
            if lines.len() >= max_lines {
                capped = true;
                break;
            }
            let end = cursor + pos;
            let mut raw = &self.pending[cursor..end];
            if raw.last() == Some(&b'\r') {
                raw = &raw[..raw.len() - 1];
            }
            line_number += 1;

            let text = String::from_utf8_lossy(raw);
            if !text.trim().is_empty() {
                lines.push(Line {
                    line_number,
                    byte_offset: offset,
                    text: text.into_owned(),
                });
            }

            offset += (pos + 1) as u64;
            cursor = end + 1;
        }

        self.pending.drain(..cursor);
        self.committed = Checkpoint {
            offset,
            line: line_number,
            ..self.committed
        };

        Ok(IncrementalRead {
            lines,
            new_checkpoint: self.committed,
            truncated,
            capped,
            file_size,
            modified_at,
        })
    }
}
