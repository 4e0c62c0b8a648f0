use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    state::{AppError, AppResult},
    store::Digest,
    utils::HandleErr,
};

/// Blob store for derived artifacts, keyed by `(source digest, transform
/// tag)`. Layout is `content/<aa>/<digest>/<tag>`; nothing in here embeds
/// the original path, so the store relocates cleanly. Everything inside is
/// recomputable, loss only costs time.
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn open(root: &Path) -> AppResult<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn artifact_path(&self, digest: Digest, tag: &str) -> PathBuf {
        self.root.join(digest.shard()).join(digest.to_hex()).join(tag)
    }

    /// Atomic write: the bytes land under a temp name in the final
    /// directory and are renamed into place.
    pub fn put(&self, digest: Digest, tag: &str, bytes: &[u8]) -> AppResult<PathBuf> {
        let staged = self.stage(digest, tag)?;
        std::fs::write(&staged.temp, bytes)?;
        staged.commit()
    }

    /// Reserves a temp path next to the final location for producers that
    /// write through an external process (the ffmpeg transcode path does).
    pub fn stage(&self, digest: Digest, tag: &str) -> AppResult<StagedArtifact> {
        let dest = self.artifact_path(digest, tag);
        let parent = dest
            .parent()
            .ok_or_else(|| AppError::Integrity(format!("artifact path {dest:?} has no parent")))?;
        std::fs::create_dir_all(parent)?;

        let temp = parent.join(format!(
            ".{}.{}.tmp",
            tag,
            std::process::id()
        ));
        Ok(StagedArtifact { temp, dest })
    }

    /// A miss is normal and means "recompute".
    pub fn get(&self, digest: Digest, tag: &str) -> AppResult<Option<Vec<u8>>> {
        match std::fs::read(self.artifact_path(digest, tag)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, digest: Digest, tag: &str) -> bool {
        self.artifact_path(digest, tag).is_file()
    }

    pub fn delete(&self, digest: Digest, tag: &str) -> AppResult<()> {
        match std::fs::remove_file(self.artifact_path(digest, tag)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.cleanup_digest_dir(digest);
        Ok(())
    }

    /// Removes every artifact derived from one source file.
    pub fn delete_all(&self, digest: Digest) -> AppResult<()> {
        let dir = self.root.join(digest.shard()).join(digest.to_hex());
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deletes the given artifacts, bounded by wall clock so a huge backlog
    /// cannot stall the maintenance loop. Returns exactly the entries that
    /// were removed; the caller drops their cache rows.
    pub fn sweep<'a>(
        &self,
        entries: impl Iterator<Item = (Digest, &'a str)>,
        budget: Duration,
    ) -> Vec<(Digest, String)> {
        let start = Instant::now();
        let mut removed = Vec::new();
        for (digest, tag) in entries {
            if start.elapsed() > budget {
                debug!(
                    "content sweep stopped after {} entries, budget exhausted",
                    removed.len()
                );
                break;
            }
            if self
                .delete(digest, tag)
                .log_warn_with_msg("failed to sweep content entry")
                .is_some()
            {
                removed.push((digest, tag.to_owned()));
            }
        }
        removed
    }

    fn cleanup_digest_dir(&self, digest: Digest) {
        let dir = self.root.join(digest.shard()).join(digest.to_hex());
        if let Ok(mut entries) = std::fs::read_dir(&dir) {
            if entries.next().is_none() {
                std::fs::remove_dir(&dir).ignore_not_found();
            }
        }
    }
}

pub struct StagedArtifact {
    pub temp: PathBuf,
    dest: PathBuf,
}

impl StagedArtifact {
    pub fn commit(self) -> AppResult<PathBuf> {
        std::fs::rename(&self.temp, &self.dest)?;
        Ok(self.dest)
    }

    pub fn abort(self) {
        std::fs::remove_file(&self.temp).ignore_not_found();
    }
}

trait IgnoreNotFound {
    fn ignore_not_found(self);
}

impl IgnoreNotFound for std::io::Result<()> {
    fn ignore_not_found(self) {
        if let Err(e) = self {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("cleanup failed: {e:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(tag: u8) -> Digest {
        Digest([tag; 32])
    }

    #[test]
    fn put_get_roundtrip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d = digest(0xab);

        let path = store.put(d, "audio_resample_48k_mono", b"pcm").unwrap();
        assert!(path.starts_with(dir.path().join("ab")));
        assert!(path.to_string_lossy().contains(&d.to_hex()));

        assert_eq!(store.get(d, "audio_resample_48k_mono").unwrap().unwrap(), b"pcm");
        assert!(store.get(d, "thumb_256x256").unwrap().is_none());
    }

    #[test]
    fn staged_writes_are_invisible_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d = digest(1);

        let staged = store.stage(d, "video_segment_0001").unwrap();
        std::fs::write(&staged.temp, b"partial").unwrap();
        assert!(!store.exists(d, "video_segment_0001"));

        staged.commit().unwrap();
        assert!(store.exists(d, "video_segment_0001"));
    }

    #[test]
    fn aborted_stage_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d = digest(2);

        let staged = store.stage(d, "thumb_64x64").unwrap();
        std::fs::write(&staged.temp, b"half").unwrap();
        staged.abort();
        assert!(!store.exists(d, "thumb_64x64"));
    }

    #[test]
    fn delete_all_clears_the_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d = digest(3);

        store.put(d, "a", b"1").unwrap();
        store.put(d, "b", b"2").unwrap();
        store.delete_all(d).unwrap();
        assert!(!store.exists(d, "a"));
        assert!(!store.exists(d, "b"));

        // Deleting the unknown is not an error.
        store.delete_all(d).unwrap();
        store.delete(d, "a").unwrap();
    }

    #[test]
    fn sweep_removes_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ContentStore::open(dir.path()).unwrap();
        let d = digest(4);

        store.put(d, "x", b"1").unwrap();
        store.put(d, "y", b"2").unwrap();

        let removed = store.sweep(
            [(d, "x"), (d, "y")].into_iter(),
            Duration::from_secs(5),
        );
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].1, "x");
        assert!(!store.exists(d, "x"));
    }
}
