use anvil_core::{AnvilError, Digest, Result};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Content-addressed store of output blobs under
/// `output-base/action_outputs/`, sharded two hex characters deep. Writes
/// go through a temp file and rename, so a blob is either absent or
/// complete.
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        OutputStore { root: root.into() }
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of_bytes(bytes);
        let dest = self.blob_path(&digest);
        if dest.exists() {
            return Ok(digest);
        }
        let hex = digest.to_hex();
        std::fs::create_dir_all(self.root.join(&hex[..2]))?;
        let tmp = dest.with_extension(format!("tmp.{}", std::process::id()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &dest)?;
        trace!(digest = %digest, "blob stored");
        Ok(digest)
    }

    /// Ingest a file from the execution root.
    pub fn put_file(&self, path: &Path) -> Result<Digest> {
        let bytes = std::fs::read(path)?;
        self.put_bytes(&bytes)
    }

    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(digest)).map_err(|e| {
            AnvilError::Io(format!("blob {digest} unreadable: {e}"))
        })
    }

    /// Copy a blob back out to a destination path, creating parents.
    pub fn materialize(&self, digest: &Digest, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.blob_path(digest), dest).map_err(|e| {
            AnvilError::Io(format!("materializing {digest} to {}: {e}", dest.display()))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let digest = store.put_bytes(b"object file contents").unwrap();
        assert!(store.contains(&digest));
        assert_eq!(store.read(&digest).unwrap(), b"object file contents");
    }

    #[test]
    fn identical_content_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path());
        let a = store.put_bytes(b"same").unwrap();
        let b = store.put_bytes(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn materialize_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path().join("cas"));
        let digest = store.put_bytes(b"lib").unwrap();
        let dest = dir.path().join("exec/out/pkg/lib.a");
        store.materialize(&digest, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"lib");
    }
}
