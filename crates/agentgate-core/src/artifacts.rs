//! Per-thread artifact directories.
//!
//! Every invocation gets `{root}/{thread_id}/in` (uploads staged for the
//! agent) and `{root}/{thread_id}/out` (files the agent produced). The job
//! record only stores the thread directory path.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use agentgate_state::JobId;
use serde::Serialize;
use tokio::fs;

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDirs {
    pub root: PathBuf,
    pub input: PathBuf,
    pub output: PathBuf,
}

/// A file found in a thread's `out/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub size: u64,
}

/// Reduce an uploaded filename to a safe single path component.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    max_upload_bytes: u64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, max_upload_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_upload_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_bytes
    }

    pub fn thread_dirs(&self, thread_id: &JobId) -> ThreadDirs {
        let root = self.root.join(thread_id.as_str());
        ThreadDirs {
            input: root.join("in"),
            output: root.join("out"),
            root,
        }
    }

    /// Create both directories for `thread_id`.
    pub async fn prepare(&self, thread_id: &JobId) -> Result<ThreadDirs> {
        let dirs = self.thread_dirs(thread_id);
        fs::create_dir_all(&dirs.input).await?;
        fs::create_dir_all(&dirs.output).await?;
        Ok(dirs)
    }

    /// `PayloadTooLarge` when `total` uploaded bytes exceed the limit.
    pub fn check_size(&self, total: u64) -> Result<()> {
        if total > self.max_upload_bytes {
            return Err(GatewayError::PayloadTooLarge {
                limit_bytes: self.max_upload_bytes,
            });
        }
        Ok(())
    }

    /// Stage one upload into `in/`. Returns the path written.
    pub async fn write_input(
        &self,
        dirs: &ThreadDirs,
        filename: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        self.check_size(data.len() as u64)?;
        let path = dirs.input.join(sanitize_filename(filename));
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Regular files in `out/`, sorted by name. Missing directory means none.
    pub async fn list_outputs(&self, thread_id: &JobId) -> Result<Vec<ArtifactEntry>> {
        let dir = self.thread_dirs(thread_id).output;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                found.push(ArtifactEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                });
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_flattened() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\a b.txt"), "a_b.txt");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[tokio::test]
    async fn prepare_write_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), 16);
        let id = JobId::from("t-1");

        let dirs = store.prepare(&id).await.unwrap();
        assert!(dirs.input.is_dir());
        assert!(dirs.output.is_dir());

        let written = store.write_input(&dirs, "../x.txt", b"hello").await.unwrap();
        assert_eq!(written, dirs.input.join("x.txt"));

        let err = store.write_input(&dirs, "big.bin", &[0u8; 17]).await.unwrap_err();
        assert!(matches!(err, GatewayError::PayloadTooLarge { limit_bytes: 16 }));

        std::fs::write(dirs.output.join("b.json"), b"{}").unwrap();
        std::fs::write(dirs.output.join("a.txt"), b"abc").unwrap();
        let outputs = store.list_outputs(&id).await.unwrap();
        let names: Vec<_> = outputs.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.json"]);
        assert_eq!(outputs[0].size, 3);
    }

    #[tokio::test]
    async fn missing_output_dir_lists_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path(), 16);
        assert!(store.list_outputs(&JobId::from("nope")).await.unwrap().is_empty());
    }
}
