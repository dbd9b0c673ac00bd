//! Per-user sandbox roots and path resolution
//!
//! Every path a client sends is resolved here before anything touches the
//! filesystem. The client path is treated as rooted at the user's sandbox
//! root, so `..` can only pop components the client itself supplied.

use crate::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Resolves client paths under `<base_path>/<username>`
#[derive(Debug, Clone)]
pub struct Sandbox {
    base_path: PathBuf,
}

impl Sandbox {
    /// Create a resolver rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Directory holding every user's sandbox root
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Sandbox root for `username`
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` unless `username` is a single plain path component.
    pub fn root_for(&self, username: &str) -> Result<PathBuf> {
        validate_username(username)?;
        Ok(self.base_path.join(username))
    }

    /// Map a client-supplied path to an absolute path inside the user's root
    ///
    /// # Errors
    ///
    /// Returns `InvalidPath` for paths containing NUL bytes or an invalid username.
    pub fn resolve(&self, username: &str, client_path: &str) -> Result<PathBuf> {
        if client_path.contains('\0') {
            warn!(
                event = "path_rejected",
                username = %username,
                "Path contains null bytes"
            );
            return Err(Error::InvalidPath(
                "Path contains invalid characters".to_string(),
            ));
        }

        let root = self.root_for(username)?;
        let resolved = root.join(normalize(client_path));

        // normalize() yields plain components only
        if !resolved.starts_with(&root) {
            warn!(
                event = "path_traversal",
                username = %username,
                path = %client_path,
                "Path escaped sandbox root"
            );
            return Err(Error::InvalidPath("Invalid path".to_string()));
        }

        debug!(username = %username, path = %client_path, resolved = ?resolved, "Resolved path");
        Ok(resolved)
    }

    /// Create the base path and one root per user, skipping those that exist
    ///
    /// # Errors
    ///
    /// Fails on the first directory that cannot be created or on an invalid username.
    pub fn prepare<'a>(&self, usernames: impl IntoIterator<Item = &'a str>) -> Result<()> {
        create_permissive_dir(&self.base_path)?;
        for username in usernames {
            let root = self.root_for(username)?;
            create_permissive_dir(&root)?;
        }
        Ok(())
    }
}

/// Lexically normalize a client path into a relative path of plain components
///
/// Empty segments and `.` are dropped; `..` removes the previous component and is
/// ignored at the top. The result never starts with `..` and is never absolute.
pub fn normalize(client_path: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for segment in client_path.split(|c| c == '/' || (cfg!(windows) && c == '\\')) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Rooted, lexically cleaned form of a client path (`/` for the sandbox root)
pub fn clean_virtual(client_path: &str) -> String {
    let normalized = normalize(client_path);
    let mut out = String::from("/");
    let joined: Vec<String> = normalized
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    out.push_str(&joined.join("/"));
    out
}

fn validate_username(username: &str) -> Result<()> {
    let mut components = Path::new(username).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None)
            if name == username && !username.contains(['/', '\\', '\0']) =>
        {
            Ok(())
        }
        _ => Err(Error::InvalidPath(format!(
            "Username is not a valid directory name: {:?}",
            username
        ))),
    }
}

fn create_permissive_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }

    builder.create(path).map_err(|e| {
        Error::Config(format!("Failed to create directory {:?}: {}", path, e))
    })?;
    info!(event = "sandbox_created", directory = ?path, "Created directory");
    Ok(())
}
