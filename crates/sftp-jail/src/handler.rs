//! Per-channel file operation handler
//!
//! One [`FileHandler`] serves one SFTP channel for one authenticated user.
//! Every request takes the handler lock, resolves its path through the
//! [`Sandbox`], and runs its filesystem call inside that critical section, so
//! requests on a channel never overlap. Channels do not coordinate with each
//! other, even for the same user.

use crate::audit::AuditEvent;
use crate::auth::SessionIdentity;
use crate::listing::{FileEntry, ListingSnapshot};
use crate::sandbox::Sandbox;
use crate::{Error, Result};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Which rejection message an unsupported method gets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// Mutating commands (rename, mkdir, rmdir, symlink, setstat)
    File,
    /// Listing-style commands (readlink)
    List,
}

/// A file request, closed over the operations the handler serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Open an existing file read-only
    Read { path: String },
    /// Open or create a file read-write
    Write { path: String, truncate: bool },
    /// Delete a file
    Remove { path: String },
    /// Snapshot a directory's entries
    List { path: String },
    /// Snapshot one file's metadata
    Stat { path: String },
    /// Anything else; rejected without touching the filesystem
    Unsupported { family: CommandFamily, name: String },
}

/// Result of a served [`Operation`]
#[derive(Debug)]
pub enum Outcome {
    /// Read-only handle
    Reader(fs::File),
    /// Read-write handle
    Writer(fs::File),
    /// File removed
    Removed,
    /// Offset-pageable listing (one entry for `Stat`)
    Listing(ListingSnapshot),
}

/// Counts entries into the handler's critical section
///
/// `peak()` above one would mean two requests on the same channel overlapped.
#[derive(Debug, Default)]
pub struct SectionGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    entered: AtomicU64,
}

impl SectionGauge {
    fn enter(&self) -> SectionGuard<'_> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.entered.fetch_add(1, Ordering::SeqCst);
        SectionGuard { gauge: self }
    }

    /// Highest number of requests ever inside the section at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total number of critical sections entered
    pub fn entered(&self) -> u64 {
        self.entered.load(Ordering::SeqCst)
    }
}

struct SectionGuard<'a> {
    gauge: &'a SectionGauge,
}

impl Drop for SectionGuard<'_> {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    /// Path resolved for the request currently (or last) in the section
    resolved: Option<PathBuf>,
}

/// File operation handler bound to one user for one channel
pub struct FileHandler {
    identity: SessionIdentity,
    sandbox: Arc<Sandbox>,
    state: Mutex<HandlerState>,
    gauge: SectionGauge,
}

impl fmt::Debug for FileHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandler")
            .field("username", &self.identity.username())
            .field("base_path", &self.sandbox.base_path())
            .finish_non_exhaustive()
    }
}

impl FileHandler {
    /// Handler for `identity`, resolving paths through `sandbox`
    pub fn new(identity: SessionIdentity, sandbox: Arc<Sandbox>) -> Self {
        Self {
            identity,
            sandbox,
            state: Mutex::new(HandlerState::default()),
            gauge: SectionGauge::default(),
        }
    }

    /// Identity this handler serves
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    /// Critical-section instrumentation
    pub fn critical_sections(&self) -> &SectionGauge {
        &self.gauge
    }

    /// Serve one request
    ///
    /// # Errors
    ///
    /// Unsupported requests fail with `NotSupported`; the rest fail with the
    /// resolver or filesystem error.
    pub async fn handle(&self, request: Operation) -> Result<Outcome> {
        match request {
            Operation::Read { path } => self.read_open(&path).await.map(Outcome::Reader),
            Operation::Write { path, truncate } => self
                .write_open(&path, truncate)
                .await
                .map(Outcome::Writer),
            Operation::Remove { path } => self.remove(&path).await.map(|()| Outcome::Removed),
            Operation::List { path } => self.list(&path).await.map(Outcome::Listing),
            Operation::Stat { path } => self.stat(&path).await.map(Outcome::Listing),
            Operation::Unsupported { family, name } => Err(self.reject(family, &name)),
        }
    }

    /// Open an existing file for reading
    ///
    /// # Errors
    ///
    /// Returns the resolver error or the open error (not found, permission).
    pub async fn read_open(&self, path: &str) -> Result<fs::File> {
        self.locked("Get", path, |resolved| async move {
            Ok(fs::OpenOptions::new().read(true).open(&resolved).await?)
        })
        .await
    }

    /// Open or create a file for reading and writing
    ///
    /// Existing contents are kept unless `truncate` is set.
    ///
    /// # Errors
    ///
    /// Returns the resolver error or the open error.
    pub async fn write_open(&self, path: &str, truncate: bool) -> Result<fs::File> {
        self.locked("Put", path, |resolved| async move {
            let mut options = fs::OpenOptions::new();
            options.read(true).write(true).create(true).truncate(truncate);
            #[cfg(unix)]
            options.mode(0o777);
            Ok(options.open(&resolved).await?)
        })
        .await
    }

    /// Delete a file
    ///
    /// # Errors
    ///
    /// Returns the resolver error or the removal error.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.locked("Remove", path, |resolved| async move {
            fs::remove_file(&resolved).await?;
            debug!(path = ?resolved, "File removed");
            Ok(())
        })
        .await
    }

    /// Snapshot the entries of a directory, sorted by name
    ///
    /// # Errors
    ///
    /// Returns the resolver error, or the first error reading the directory or
    /// an entry's metadata.
    pub async fn list(&self, path: &str) -> Result<ListingSnapshot> {
        self.locked("List", path, |resolved| async move {
            let mut read_dir = fs::read_dir(&resolved).await?;
            let mut entries = Vec::new();
            while let Some(entry) = read_dir.next_entry().await? {
                let metadata = entry.metadata().await?;
                entries.push(FileEntry::new(
                    entry.file_name().to_string_lossy().into_owned(),
                    &metadata,
                ));
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(ListingSnapshot::new(entries))
        })
        .await
    }

    /// Snapshot one file's metadata as a single-entry listing
    ///
    /// # Errors
    ///
    /// Returns the resolver error or the stat error.
    pub async fn stat(&self, path: &str) -> Result<ListingSnapshot> {
        let username = self.identity.username().to_string();
        self.locked("Stat", path, |resolved| async move {
            let metadata = fs::metadata(&resolved).await?;
            let name = resolved
                .file_name()
                .map_or(username, |n| n.to_string_lossy().into_owned());
            Ok(ListingSnapshot::new(vec![FileEntry::new(name, &metadata)]))
        })
        .await
    }

    /// Refuse an unsupported method; never touches the filesystem
    pub fn reject(&self, family: CommandFamily, name: &str) -> Error {
        AuditEvent::unsupported_operation(self.identity.username(), name).log();
        match family {
            CommandFamily::File => Error::NotSupported(format!("unsupported file command: {}", name)),
            CommandFamily::List => {
                Error::NotSupported(format!("unsupported file list command: {}", name))
            }
        }
    }

    /// Path resolved by the most recent request
    pub async fn last_resolved(&self) -> Option<PathBuf> {
        self.state.lock().await.resolved.clone()
    }

    async fn locked<T, F, Fut>(&self, method: &str, path: &str, op: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.state.lock().await;
        let _section = self.gauge.enter();

        let resolved = self.sandbox.resolve(self.identity.username(), path)?;
        state.resolved = Some(resolved.clone());

        let result = op(resolved).await;
        if let Err(e) = &result {
            if e.is_security_event() {
                warn!(
                    event = "file_operation_denied",
                    username = %self.identity.username(),
                    method = method,
                    path = %path,
                    error = %e,
                    "File operation denied"
                );
            } else {
                debug!(
                    username = %self.identity.username(),
                    method = method,
                    path = %path,
                    error = %e,
                    "File operation failed"
                );
            }
        }
        result
    }
}
