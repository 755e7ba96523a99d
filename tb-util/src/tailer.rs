// Copyright (c) Facebook, Inc. and its affiliates.

//! Incremental reader for files which are being appended to by another
//! process.
//!
//! `FileTailer` remembers the byte offset of the first line it hasn't
//! consumed yet. Every `read_lines()` call opens the file if necessary,
//! checks whether it has grown past the cursor and returns the complete
//! lines appended since. A trailing line which isn't newline-terminated yet
//! is left in place and returned once the writer finishes it.
use anyhow::Result;
use log::{trace, warn};
use std::fs;
use std::io::{self, prelude::*, BufReader, SeekFrom};
use std::path::{Path, PathBuf};

/// Reads newline-terminated lines, advancing `cursor` past each one as it
/// is returned. A read error ends the batch and comes back together with
/// the lines read before it.
fn read_complete_lines<R: BufRead>(
    reader: &mut R,
    cursor: &mut u64,
) -> (Vec<String>, Option<io::Error>) {
    let mut lines = vec![];
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let len = match reader.read_until(b'\n', &mut buf) {
            Ok(v) => v,
            Err(e) => return (lines, Some(e)),
        };
        if len == 0 || buf.last() != Some(&b'\n') {
            return (lines, None);
        }

        let mut line = String::from_utf8_lossy(&buf).into_owned();
        line.truncate(line.trim_end_matches(&['\n', '\r'][..]).len());
        lines.push(line);
        *cursor += len as u64;
    }
}

#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    cursor: u64,
    file: Option<BufReader<fs::File>>,
}

impl FileTailer {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: PathBuf::from(path.as_ref()),
            cursor: 0,
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Returns the complete lines appended since the last call, without
    /// their line terminators. A missing file yields no lines. If reading
    /// fails midway, the lines before the failure are returned and the rest
    /// is retried on the next call.
    pub fn read_lines(&mut self) -> Result<Vec<String>> {
        if self.file.is_none() {
            match fs::File::open(&self.path) {
                Ok(f) => self.file = Some(BufReader::new(f)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    trace!("tailer: {:?} doesn't exist yet", &self.path);
                    return Ok(vec![]);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let reader = match self.file.as_mut() {
            Some(v) => v,
            None => return Ok(vec![]),
        };

        let end = reader.seek(SeekFrom::End(0))?;
        if end == self.cursor {
            self.file = None;
            return Ok(vec![]);
        }
        if end < self.cursor {
            warn!(
                "tailer: {:?} shrank below the read position ({} < {}), restarting",
                &self.path, end, self.cursor
            );
            self.cursor = 0;
        }
        reader.seek(SeekFrom::Start(self.cursor))?;

        let (lines, err) = read_complete_lines(reader, &mut self.cursor);
        if let Some(e) = err {
            self.file = None;
            if lines.is_empty() {
                return Err(e.into());
            }
            warn!(
                "tailer: Failed to read {:?} after {} lines, retrying later ({:?})",
                &self.path,
                lines.len(),
                &e
            );
        }
        Ok(lines)
    }

    /// Rewind to the beginning of the file and drop the open handle.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.file = None;
    }
}
