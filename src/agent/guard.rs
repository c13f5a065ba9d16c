use super::error::{AgentError, ToolError};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// The canonical directory every tool operation is confined to.
///
/// Built once at startup and passed by reference into the file and script
/// primitives; it is never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoot {
    canonical: PathBuf,
}

impl SandboxRoot {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AgentError> {
        let path = path.as_ref();
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            AgentError::Config(format!(
                "Sandbox root {} cannot be resolved: {}",
                path.display(),
                e
            ))
        })?;
        if !canonical.is_dir() {
            return Err(AgentError::Config(format!(
                "Sandbox root {} is not a directory",
                canonical.display()
            )));
        }
        Ok(Self { canonical })
    }

    pub fn path(&self) -> &Path {
        &self.canonical
    }

    /// Final component of the root, e.g. `calculator` for `/srv/calculator`.
    pub fn name(&self) -> Option<&str> {
        self.canonical.file_name().and_then(|n| n.to_str())
    }

    /// Resolve `user_path` against the root and prove the result stays inside it.
    ///
    /// The joined path is canonicalized (symlinks followed). A target that does
    /// not exist yet is resolved through its deepest existing ancestor; the
    /// missing tail may only contain plain names, so `..` hidden behind a
    /// missing directory is rejected rather than guessed at. `action` only
    /// feeds the error message, which always quotes the untrusted input.
    pub async fn confine(&self, user_path: &str, action: &'static str) -> Result<PathBuf, ToolError> {
        let reject = || ToolError::Confinement {
            action,
            path: user_path.to_string(),
        };

        let joined = self.canonical.join(user_path);
        let mut existing = joined.as_path();
        let mut tail: Vec<Component<'_>> = Vec::new();

        let resolved_base = loop {
            match tokio::fs::canonicalize(existing).await {
                Ok(p) => break p,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Only truly absent entries may form the tail. An entry
                    // that exists but cannot be resolved is a dangling link.
                    if tokio::fs::symlink_metadata(existing).await.is_ok() {
                        debug!(path = %user_path, entry = %existing.display(), "dangling symlink in path");
                        return Err(reject());
                    }
                    let mut components = existing.components();
                    let last = components.next_back().ok_or_else(reject)?;
                    tail.push(last);
                    existing = components.as_path();
                    if existing.as_os_str().is_empty() {
                        return Err(reject());
                    }
                }
                Err(e) => {
                    debug!(path = %user_path, error = %e, "path resolution failed");
                    return Err(reject());
                }
            }
        };

        let mut resolved = resolved_base;
        for component in tail.into_iter().rev() {
            match component {
                Component::Normal(seg) => resolved.push(seg),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(reject());
                }
            }
        }

        // Path::starts_with compares whole components, so `root-evil` never
        // passes for `root`.
        if resolved.starts_with(&self.canonical) {
            Ok(resolved)
        } else {
            debug!(path = %user_path, resolved = %resolved.display(), "path escapes sandbox root");
            Err(reject())
        }
    }
}
