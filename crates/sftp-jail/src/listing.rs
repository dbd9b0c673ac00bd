//! Immutable directory listing snapshots with offset paging

use crate::protocol::FileAttrs;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// One file-metadata entry in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Entry name (last path component)
    pub name: String,
    /// Attributes captured with the snapshot
    pub attrs: FileAttrs,
}

impl FileEntry {
    /// Build an entry from a name and filesystem metadata
    pub fn new(name: impl Into<String>, metadata: &std::fs::Metadata) -> Self {
        Self {
            name: name.into(),
            attrs: FileAttrs::from_metadata(metadata),
        }
    }

    /// `ls -l` style line sent as the SFTP long name
    pub fn long_name(&self) -> String {
        let mode = self.attrs.permissions.unwrap_or(0);
        let kind = match mode & 0o170000 {
            0o040000 => 'd',
            0o120000 => 'l',
            _ => '-',
        };
        let mut perms = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (mode >> shift) & 0o7;
            perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        let modified = self
            .attrs
            .mtime
            .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::from(secs), 0))
            .unwrap_or_default();
        format!(
            "{}{} 1 {:<8} {:<8} {:>8} {} {}",
            kind,
            perms,
            self.attrs.uid.unwrap_or(0),
            self.attrs.gid.unwrap_or(0),
            self.attrs.size.unwrap_or(0),
            modified.format("%b %e %H:%M"),
            self.name
        )
    }
}

/// Ordered, immutable capture of directory contents
///
/// Cloning shares the captured entries. A new listing request builds a new
/// snapshot; an existing one never changes.
#[derive(Debug, Clone, Default)]
pub struct ListingSnapshot {
    entries: Arc<[FileEntry]>,
}

impl ListingSnapshot {
    /// Capture `entries` in the given order
    pub fn new(entries: Vec<FileEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    /// Number of captured entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if nothing was captured
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Page starting at `offset` holding at most `capacity` entries
    ///
    /// An offset at or past the end yields an empty page; that is the end of the
    /// sequence, not an error.
    pub fn list_at(&self, offset: usize, capacity: usize) -> &[FileEntry] {
        if offset >= self.entries.len() {
            return &[];
        }
        let end = offset + capacity.min(self.entries.len() - offset);
        &self.entries[offset..end]
    }

    /// Iterate over every captured entry in order
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.iter()
    }
}
