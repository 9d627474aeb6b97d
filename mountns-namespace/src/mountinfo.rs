//! Reading the mount table from `/proc/<pid>/mountinfo`

use std::fs;
use std::path::{Path, PathBuf};

use mountns_core::{Error, Result};

use crate::fixture::Propagation;

/// Mount entry from `/proc/self/mountinfo`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Unique mount ID
    pub mount_id: u32,
    /// ID of the parent mount
    pub parent_id: u32,
    /// Root of the mount within its filesystem
    pub root: PathBuf,
    /// Mount point relative to the process root
    pub mount_point: PathBuf,
    /// Optional fields such as `shared:1` or `master:3`
    pub tags: Vec<String>,
    /// Filesystem type
    pub filesystem_type: String,
}

impl MountEntry {
    /// Propagation type derived from the optional fields
    ///
    /// A mount that is both a slave and shared reports `Slave`.
    #[must_use]
    pub fn propagation(&self) -> Propagation {
        if self.tags.iter().any(|t| t == "unbindable") {
            Propagation::Unbindable
        } else if self.tags.iter().any(|t| t.starts_with("master:")) {
            Propagation::Slave
        } else if self.tags.iter().any(|t| t.starts_with("shared:")) {
            Propagation::Shared
        } else {
            Propagation::Private
        }
    }
}

/// Parse the mount table of the calling process
///
/// # Errors
/// Returns error if `/proc/self/mountinfo` cannot be read
pub fn read_mountinfo() -> Result<Vec<MountEntry>> {
    read_mountinfo_from(Path::new("/proc/self/mountinfo"))
}

/// Parse a mountinfo file
///
/// # Errors
/// Returns error if the file cannot be read
pub fn read_mountinfo_from(path: &Path) -> Result<Vec<MountEntry>> {
    let content = fs::read_to_string(path).map_err(|e| Error::Namespace {
        message: format!("Failed to read {}: {e}", path.display()),
    })?;

    Ok(parse_mountinfo(&content))
}

/// Parse mountinfo text, skipping malformed lines
#[must_use]
pub fn parse_mountinfo(content: &str) -> Vec<MountEntry> {
    content.lines().filter_map(parse_mountinfo_line).collect()
}

/// Parse a single line
///
/// Format: `id parent major:minor root mount_point options [tags...] - fstype source super_options`
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    let sep_pos = parts.iter().position(|&p| p == "-")?;
    if sep_pos < 6 || sep_pos + 1 >= parts.len() {
        return None;
    }

    Some(MountEntry {
        mount_id: parts[0].parse().ok()?,
        parent_id: parts[1].parse().ok()?,
        root: PathBuf::from(unescape(parts[3])),
        mount_point: PathBuf::from(unescape(parts[4])),
        tags: parts[6..sep_pos].iter().map(ToString::to_string).collect(),
        filesystem_type: parts[sep_pos + 1].to_string(),
    })
}

/// Decode the octal escapes (`\040` for space, ...) used in paths
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|octal| u8::from_str_radix(octal, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// All mounts whose mount point is `root` or lies beneath it
#[must_use]
pub fn mounts_under<'a>(entries: &'a [MountEntry], root: &Path) -> Vec<&'a MountEntry> {
    entries
        .iter()
        .filter(|e| e.mount_point.starts_with(root))
        .collect()
}

/// Topmost mount at exactly `path`, if any
#[must_use]
pub fn mount_at<'a>(entries: &'a [MountEntry], path: &Path) -> Option<&'a MountEntry> {
    entries.iter().rev().find(|e| e.mount_point == path)
}
