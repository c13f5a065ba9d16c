use super::error::ToolError;
use super::guard::SandboxRoot;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Longest UTF-8 encoding of a single character.
const MAX_UTF8_WIDTH: u64 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub size_bytes: u64,
    pub is_dir: bool,
}

impl DirEntryInfo {
    fn render(&self) -> String {
        format!(
            "- {}: file_size={} bytes, is_dir={}",
            self.name,
            self.size_bytes,
            if self.is_dir { "True" } else { "False" }
        )
    }
}

pub fn render_listing(entries: &[DirEntryInfo]) -> String {
    entries
        .iter()
        .map(DirEntryInfo::render)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn truncation_marker(path: &str, max_chars: usize) -> String {
    format!("\n[...File \"{}\" truncated at {} characters]", path, max_chars)
}

/// List `dir` (relative to the root) sorted by name.
pub async fn list_directory(root: &SandboxRoot, dir: &str) -> Result<Vec<DirEntryInfo>, ToolError> {
    let target = root.confine(dir, "list").await?;
    let is_dir = fs::metadata(&target)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(ToolError::NotADirectory(dir.to_string()));
    }

    let mut reader = fs::read_dir(&target).await?;
    let mut entries = Vec::new();
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        // Dangling symlinks have no target metadata; fall back to the link itself.
        let meta = match fs::metadata(entry.path()).await {
            Ok(m) => Some(m),
            Err(_) => fs::symlink_metadata(entry.path()).await.ok(),
        };
        let (size_bytes, is_dir) = meta.map(|m| (m.len(), m.is_dir())).unwrap_or((0, false));
        entries.push(DirEntryInfo {
            name,
            size_bytes,
            is_dir,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    debug!(dir = %dir, entries = entries.len(), "listed directory");
    Ok(entries)
}

/// Read up to `max_chars` characters of `path`, appending the truncation
/// marker when the file holds more. Invalid UTF-8 is replaced, never fatal.
pub async fn read_file(root: &SandboxRoot, path: &str, max_chars: usize) -> Result<String, ToolError> {
    let target = root.confine(path, "read").await?;
    let is_file = fs::metadata(&target)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(ToolError::NotAFile(path.to_string()));
    }

    // max_chars + 1 characters fit in this many bytes, so overflow is
    // detectable without pulling in the rest of a large file.
    let byte_budget = (max_chars as u64 + 1).saturating_mul(MAX_UTF8_WIDTH);
    let file = fs::File::open(&target).await?;
    let mut buf = Vec::new();
    file.take(byte_budget).read_to_end(&mut buf).await?;

    let decoded = String::from_utf8_lossy(&buf);
    let mut chars = decoded.char_indices();
    match chars.nth(max_chars) {
        Some((cut, _)) => {
            info!(path = %path, max_chars, "file truncated");
            let mut out = decoded[..cut].to_string();
            out.push_str(&truncation_marker(path, max_chars));
            Ok(out)
        }
        None => Ok(decoded.into_owned()),
    }
}

/// Create or overwrite `path` with `content`, creating missing parents.
///
/// The write is not atomic: a crash mid-write can leave a partial file.
pub async fn write_file(root: &SandboxRoot, path: &str, content: &str) -> Result<String, ToolError> {
    let target = root.confine(path, "write to").await?;
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&target, content.as_bytes()).await?;
    let written = content.chars().count();
    info!(path = %path, chars = written, "file written");
    Ok(format!(
        "Successfully wrote to \"{}\" ({} characters written)",
        path, written
    ))
}
