//! Folder of `.eml` files as a document source.
//!
//! Outlook `.msg` files in the same folder are counted and skipped with a
//! warning; they are not RFC 5322 and need a different source.

use super::DocumentSource;
use crate::checkpoint::normalize_unit_id;
use crate::models::{MailsiftError, ParsedUnit, Result};
use mail_parser::{Address, Message, MessageParser};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reads RFC 5322 messages from `*.eml` files in one folder (not recursive).
pub struct MailboxSource {
    folder: PathBuf,
}

impl MailboxSource {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Files in the folder that look like mail but cannot be read here.
    pub fn unsupported_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = self.glob_files("msg")?;
        files.sort();
        Ok(files)
    }

    fn glob_files(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let folder = std::path::absolute(&self.folder)
            .map_err(|e| MailsiftError::io("resolving mail folder", e))?;
        let pattern = format!(
            "{}/*.{extension}",
            glob::Pattern::escape(&folder.to_string_lossy())
        );

        Ok(glob::glob(&pattern)
            .map_err(|e| MailsiftError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter(|path| path.is_file())
            .collect())
    }
}

impl DocumentSource for MailboxSource {
    /// Sorted absolute paths of every `*.eml` file in the folder.
    fn scan(&self) -> Result<Vec<String>> {
        if !self.folder.is_dir() {
            return Err(MailsiftError::InvalidInput(format!(
                "Not a directory: {}",
                self.folder.display()
            )));
        }

        let mut ids: Vec<String> = self
            .glob_files("eml")?
            .iter()
            .map(|path| normalize_unit_id(&path.to_string_lossy()))
            .collect();
        ids.sort();

        let skipped = self.unsupported_files()?;
        if !skipped.is_empty() {
            warn!(
                folder = %self.folder.display(),
                count = skipped.len(),
                "Skipping .msg files, only .eml is supported"
            );
        }

        info!(folder = %self.folder.display(), count = ids.len(), "Scanned mail folder");
        Ok(ids)
    }

    fn read(&self, id: &str) -> Result<ParsedUnit> {
        let raw = fs::read(id)
            .map_err(|e| MailsiftError::InvalidInput(format!("Reading {id}: {e}")))?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(MailsiftError::ParseError(format!("Empty message: {id}")));
        }

        let parsed = MessageParser::default()
            .parse(raw.as_slice())
            .ok_or_else(|| MailsiftError::ParseError(format!("Unparseable message: {id}")))?;

        let unit = ParsedUnit {
            id: normalize_unit_id(id),
            from: sender(&parsed),
            subject: parsed.subject().unwrap_or_default().to_string(),
            date: parsed.date().map(|d| d.to_rfc3339()).unwrap_or_default(),
            body_text: parsed
                .body_text(0)
                .map(|t| t.to_string())
                .unwrap_or_default(),
            body_html: parsed
                .body_html(0)
                .map(|h| h.to_string())
                .unwrap_or_default(),
        };
        debug!(unit = %unit.id, subject = %unit.subject, "Decoded message");
        Ok(unit)
    }
}

/// `Name <addr>` when both are present, else whichever is.
fn sender(parsed: &Message<'_>) -> String {
    let Some(addr) = parsed.from().and_then(Address::first) else {
        return String::new();
    };
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (None, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    }
}
