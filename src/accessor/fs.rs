//! Filesystem accessor
//!
//! Serves vaults whose backing store is reachable as a mounted filesystem,
//! which is how HDFS vaults are deployed here (NFS gateway or fuse mount
//! on every checker host). Also the accessor of choice for local tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use super::{Accessor, AccessorKind, AccessorResult, FileMeta, ListIter};

/// Accessor rooted at a local directory.
pub struct FsAccessor {
    root: PathBuf,
    kind: AccessorKind,
    uri: String,
}

impl FsAccessor {
    /// Accessor for an HDFS vault served through a gateway mount.
    pub fn hdfs<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let uri = format!("hdfs://{}", root.display());
        Self {
            root,
            kind: AccessorKind::Hdfs,
            uri,
        }
    }

    /// Plain local-directory accessor.
    pub fn local<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let uri = format!("file://{}", root.display());
        Self {
            root,
            kind: AccessorKind::Hdfs,
            uri,
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let s = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Some(s)
    }
}

#[async_trait]
impl Accessor for FsAccessor {
    fn kind(&self) -> AccessorKind {
        self.kind
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn list_directory(&self, prefix: &str) -> AccessorResult<ListIter> {
        let dir = self.resolve(prefix);
        // An empty prefix lists as empty, matching object-store semantics.
        if !fs::try_exists(&dir).await? {
            return Ok(ListIter::from_vec(Vec::new()));
        }

        let mut files = Vec::new();
        let mut pending = vec![dir];
        while let Some(current) = pending.pop() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(path);
                } else if let Some(rel) = self.relative(&path) {
                    files.push(FileMeta {
                        path: rel,
                        size: meta.len(),
                    });
                }
            }
        }

        // Listings are consumed into a set, but a deterministic order keeps
        // logs comparable between runs.
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(ListIter::from_vec(files))
    }

    async fn exists(&self, path: &str) -> AccessorResult<bool> {
        Ok(fs::try_exists(self.resolve(path)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_file(root: &Path, rel: &str, len: usize) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        fs::write(&path, vec![0u8; len]).await.unwrap();
    }

    #[tokio::test]
    async fn lists_recursively_with_sizes() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "data/10/r1_0.dat", 100).await;
        write_file(tmp.path(), "data/10/r1_1.dat", 50).await;
        write_file(tmp.path(), "data/11/r2_0.dat", 7).await;

        let accessor = FsAccessor::local(tmp.path());
        let mut iter = accessor.list_directory("data/10").await.unwrap();

        let mut listed = Vec::new();
        while let Some(file) = iter.next().await {
            listed.push(file);
        }
        assert!(iter.is_valid());
        assert_eq!(
            listed,
            vec![
                FileMeta {
                    path: "data/10/r1_0.dat".to_string(),
                    size: 100
                },
                FileMeta {
                    path: "data/10/r1_1.dat".to_string(),
                    size: 50
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_prefix_lists_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let accessor = FsAccessor::local(tmp.path());
        let mut iter = accessor.list_directory("data/404").await.unwrap();
        assert!(iter.next().await.is_none());
        assert!(iter.is_valid());
    }

    #[tokio::test]
    async fn exists_probes_single_paths() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "data/10/r1_0.dat", 1).await;

        let accessor = FsAccessor::hdfs(tmp.path());
        assert_eq!(accessor.kind(), AccessorKind::Hdfs);
        assert!(accessor.exists("data/10/r1_0.dat").await.unwrap());
        assert!(!accessor.exists("data/10/r1_9.dat").await.unwrap());
    }
}
