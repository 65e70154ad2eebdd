//! Incrementally written JSON array file.
//!
//! Layout: `[\n`, records separated by `,\n`, closed by `\n]\n`. Every record
//! is flushed as soon as it is written, so a crash loses nothing already
//! reported as written, but the file is only valid JSON after `finish`.

use crate::models::{MailsiftError, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct JsonArrayWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    has_records: bool,
    written: usize,
}

impl JsonArrayWriter {
    /// Start a new, empty array at `path`, replacing any existing file.
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent(path)?;
        let file = File::create(path).map_err(|e| MailsiftError::io("creating output file", e))?;
        let mut out = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            has_records: false,
            written: 0,
        };
        out.write_raw(b"[\n")?;
        debug!(path = %path.display(), "Created output file");
        Ok(out)
    }

    /// Reopen an array for appending, or create it if missing.
    ///
    /// A trailing `]` (and surrounding whitespace) is cut off so new records
    /// continue the same array. A file cut short by a crash is not repaired.
    pub fn append(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create(path);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| MailsiftError::io("opening output file", e))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .map_err(|e| MailsiftError::io("reading output file", e))?;

        let mut end = trim_end(&content, content.len());
        if end == 0 {
            drop(file);
            return Self::create(path);
        }
        if content.first() != Some(&b'[') {
            return Err(MailsiftError::InvalidInput(format!(
                "{} is not a JSON array",
                path.display()
            )));
        }

        let closed = content[end - 1] == b']';
        if closed {
            end = trim_end(&content, end - 1);
        } else {
            warn!(path = %path.display(), "Output file was not closed, appending after last write");
        }
        let has_records = content[end - 1] != b'[';

        file.set_len(end as u64)
            .map_err(|e| MailsiftError::io("truncating output file", e))?;
        file.seek(SeekFrom::End(0))
            .map_err(|e| MailsiftError::io("seeking output file", e))?;

        let mut out = Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            has_records,
            written: 0,
        };
        if !has_records {
            out.write_raw(b"\n")?;
        }
        info!(path = %path.display(), has_records, "Reopened output file for append");
        Ok(out)
    }

    /// Append one record and flush it.
    pub fn write_record<T: Serialize>(&mut self, record: &T) -> Result<()> {
        if self.has_records {
            self.writer
                .write_all(b",\n")
                .map_err(|e| MailsiftError::io("writing output", e))?;
        }
        serde_json::to_writer_pretty(&mut self.writer, record)
            .map_err(|e| MailsiftError::Internal(format!("Failed to serialize record: {e}")))?;
        self.writer
            .flush()
            .map_err(|e| MailsiftError::io("flushing output", e))?;
        self.has_records = true;
        self.written += 1;
        Ok(())
    }

    /// Records written through this writer.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Close the array and sync the file.
    pub fn finish(mut self) -> Result<usize> {
        self.write_raw(b"\n]\n")?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| MailsiftError::io("syncing output", e))?;
        Ok(self.written)
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| MailsiftError::io("writing output", e))
    }
}

/// Load a whole JSON array written by `JsonArrayWriter`.
pub fn load_records<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = fs::read(path).map_err(|e| MailsiftError::io("reading input file", e))?;
    serde_json::from_slice(&content)
        .map_err(|e| MailsiftError::ParseError(format!("{}: {e}", path.display())))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| MailsiftError::io("creating output dir", e))?;
    }
    Ok(())
}

fn trim_end(content: &[u8], mut end: usize) -> usize {
    while end > 0 && content[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    end
}
