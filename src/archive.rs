//! Local archive of briefs and artifacts
//!
//! Layout: `{root}/{local_root}/{thread_id}/{seq:03}/brief.md` and
//! `.../artifacts/{id}.{ext}`. Every write is atomic.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{ExtractedArtifact, Thread};
use crate::store::atomic_write;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid path component: {0}")]
    InvalidComponent(String),
    #[error("Path escapes archive root: {0}")]
    PathEscape(String),
}

impl Serialize for ArchiveError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// A single path component: no separators, no `..`, not empty.
fn validate_component(component: &str) -> Result<(), ArchiveError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
    {
        return Err(ArchiveError::InvalidComponent(component.to_string()));
    }
    Ok(())
}

/// Artifact ids come from the page; keep them filesystem-safe
fn file_stem(id: &str) -> String {
    let stem: String = id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "artifact".to_string()
    } else {
        stem
    }
}

#[derive(Debug, Clone)]
pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn segment_dir(&self, thread: &Thread, sequence: u32) -> Result<PathBuf, ArchiveError> {
        validate_component(&thread.local_root)?;
        validate_component(&thread.id)?;
        Ok(self
            .root
            .join(&thread.local_root)
            .join(&thread.id)
            .join(format!("{:03}", sequence)))
    }

    pub fn artifact_path(
        &self,
        thread: &Thread,
        sequence: u32,
        artifact: &ExtractedArtifact,
    ) -> Result<PathBuf, ArchiveError> {
        let ext = artifact.artifact_type.extension(artifact.language.as_deref());
        Ok(self
            .segment_dir(thread, sequence)?
            .join("artifacts")
            .join(format!("{}.{}", file_stem(&artifact.id), ext)))
    }

    pub fn write_artifact(
        &self,
        thread: &Thread,
        sequence: u32,
        artifact: &ExtractedArtifact,
    ) -> Result<PathBuf, ArchiveError> {
        let path = self.artifact_path(thread, sequence, artifact)?;
        self.write(&path, &artifact.content)?;
        tracing::debug!(
            thread_id = %thread.id,
            artifact_id = %artifact.id,
            path = %path.display(),
            "Archived artifact"
        );
        Ok(path)
    }

    pub fn write_brief(&self, thread: &Thread, sequence: u32, text: &str) -> Result<PathBuf, ArchiveError> {
        let path = self.segment_dir(thread, sequence)?.join("brief.md");
        self.write(&path, text)?;
        tracing::debug!(thread_id = %thread.id, sequence, path = %path.display(), "Archived brief");
        Ok(path)
    }

    fn write(&self, path: &Path, contents: &str) -> Result<(), ArchiveError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(path, contents)?;
        Ok(())
    }

    /// Read back a file previously written by this archive
    pub fn read(&self, path: &Path) -> Result<String, ArchiveError> {
        let root = self.root.canonicalize()?;
        let candidate = path.canonicalize()?;
        if !candidate.starts_with(&root) {
            return Err(ArchiveError::PathEscape(path.display().to_string()));
        }
        Ok(fs::read_to_string(candidate)?)
    }

    /// Remove everything archived for a thread
    pub fn remove_thread(&self, thread: &Thread) -> Result<bool, ArchiveError> {
        validate_component(&thread.local_root)?;
        validate_component(&thread.id)?;
        let dir = self.root.join(&thread.local_root).join(&thread.id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArtifactType;
    use chrono::Utc;
    use tempfile::TempDir;

    fn thread(local_root: &str) -> Thread {
        Thread {
            id: "01THREAD".to_string(),
            title: "T".to_string(),
            project_name: "T".to_string(),
            project_url: None,
            prefix: "CW".to_string(),
            segment_count: 1,
            active_segment_id: None,
            split_threshold: 2,
            local_root: local_root.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_layout_and_read_back() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::new(dir.path());
        let artifact = ExtractedArtifact {
            id: "art/1".to_string(),
            title: "Lexer".to_string(),
            artifact_type: ArtifactType::Code,
            language: Some("rust".to_string()),
            content: "fn main() {}".to_string(),
        };

        let path = archive.write_artifact(&thread("Claude-Threads"), 3, &artifact).unwrap();
        assert!(path.ends_with("Claude-Threads/01THREAD/003/artifacts/art_1.rs"));
        assert_eq!(archive.read(&path).unwrap(), "fn main() {}");

        let brief = archive.write_brief(&thread("Claude-Threads"), 3, "# Brief").unwrap();
        assert!(brief.ends_with("003/brief.md"));
        assert!(!brief.with_file_name("brief.md.tmp").exists());
    }

    #[test]
    fn test_rejects_escaping_local_root() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::new(dir.path());
        assert!(matches!(
            archive.write_brief(&thread(".."), 1, "x"),
            Err(ArchiveError::InvalidComponent(_))
        ));
    }

    #[test]
    fn test_read_outside_root_rejected() {
        let root = TempDir::new().unwrap();
        let other = TempDir::new().unwrap();
        let outside = other.path().join("secret.txt");
        fs::write(&outside, "x").unwrap();
        let archive = LocalArchive::new(root.path());
        assert!(matches!(archive.read(&outside), Err(ArchiveError::PathEscape(_))));
    }

    #[test]
    fn test_remove_thread() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::new(dir.path());
        let t = thread("Claude-Threads");
        archive.write_brief(&t, 1, "x").unwrap();
        assert!(archive.remove_thread(&t).unwrap());
        assert!(!archive.remove_thread(&t).unwrap());
    }
}
