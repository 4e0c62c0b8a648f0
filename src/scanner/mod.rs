pub mod watch;

use std::{
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use sha2::Digest as _;
use tracing::{debug, info, warn};

use crate::{
    engine::Services,
    ingest,
    state::AppResult,
    store::{files, tasks::NewTask, tasks::TaskKind, Digest, Modality},
    tasks::TaskEngine,
    utils::HandleErr,
};

/// Full-content sha256; the digest is the identity of a SourceFile.
pub fn hash_file(path: &Path) -> AppResult<Digest> {
    let mut hasher = sha2::Sha256::new();
    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        hasher.update(&buffer[..count]);
    }
    Ok(Digest(hasher.finalize().into()))
}

/// Minimal `*` globbing against a file name, enough for the exclusion
/// patterns the configuration carries (".*", "*~", "*.tmp").
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let mut pieces = pattern.split('*');
    let first = pieces.next().unwrap_or_default();
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];

    let mut pieces = pieces.peekable();
    while let Some(piece) = pieces.next() {
        if pieces.peek().is_none() {
            // Last piece anchors at the end.
            return piece.is_empty() || rest.ends_with(piece);
        }
        match rest.find(piece) {
            Some(at) => rest = &rest[at + piece.len()..],
            None => return false,
        }
    }
    rest.is_empty()
}

/// A debounced filesystem change, already mapped to the §4.7 action table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
    Moved { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    pub seen: usize,
    pub enqueued: usize,
    pub pruned: usize,
}

/// File discovery: the initial tree walk and the application of live
/// events. Heavy work (hashing, probing) happens in the `file_scan` task;
/// this layer decides what to enqueue.
pub struct Scanner {
    services: Arc<Services>,
    tasks: Arc<TaskEngine>,
}

impl Scanner {
    pub fn new(services: Arc<Services>, tasks: Arc<TaskEngine>) -> Arc<Self> {
        Arc::new(Self { services, tasks })
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return true;
        };
        self.services
            .config
            .watch
            .exclude
            .iter()
            .any(|pattern| wildcard_match(pattern, name))
    }

    /// Walks the configured roots, enqueueing a scan for every indexable
    /// path that is new or has a changed mtime, and prunes bindings whose
    /// files disappeared while the engine was down.
    pub fn initial_scan(&self, roots: &[PathBuf]) -> AppResult<ScanSummary> {
        let mut summary = ScanSummary::default();

        let mut discovered = Vec::new();
        for root in roots {
            if !root.is_dir() {
                warn!("watch root {root:?} does not exist, skipping");
                continue;
            }
            self.walk(root, &mut discovered);
        }

        for path in &discovered {
            summary.seen += 1;
            if Modality::from_path(path).is_none() {
                continue;
            }

            let mtime = path
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs());
            let known = {
                let mut conn = self.services.db.get()?;
                files::path_mtime(&mut conn, path)?
            };
            if known.is_some() && known == mtime {
                continue;
            }

            self.enqueue_scan(path)?;
            summary.enqueued += 1;
        }

        // Deletions that happened while nothing was watching.
        let known_paths = {
            let mut conn = self.services.db.get()?;
            files::all_paths(&mut conn)?
        };
        for known in known_paths {
            let path = PathBuf::from(&known);
            let under_root = roots.iter().any(|root| path.starts_with(root));
            if under_root && !path.exists() {
                self.apply_event(ChangeEvent::Removed(path))?;
                summary.pruned += 1;
            }
        }

        info!(
            "initial scan: {} files seen, {} scans enqueued, {} stale bindings pruned",
            summary.seen, summary.enqueued, summary.pruned
        );
        Ok(summary)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<PathBuf>) {
        let Some(read_dir) =
            dir.read_dir()
                .log_warn_with_msg("encountered IO error while scanning directory")
        else {
            return;
        };
        for entry in read_dir {
            let Some(entry) =
                entry.log_warn_with_msg("encountered IO error while scanning directory")
            else {
                continue;
            };
            let path = entry.path();
            if self.is_excluded(&path) {
                continue;
            }
            if path.is_dir() {
                self.walk(&path, out);
            } else {
                out.push(path);
            }
        }
    }

    /// The §4.7 event table. Exclusions are evaluated before any I/O.
    pub fn apply_event(&self, event: ChangeEvent) -> AppResult<()> {
        match event {
            ChangeEvent::Created(path) | ChangeEvent::Modified(path) => {
                if self.is_excluded(&path) || Modality::from_path(&path).is_none() {
                    return Ok(());
                }
                self.enqueue_scan(&path)?;
            }
            ChangeEvent::Removed(path) => {
                let mut conn = self.services.db.get()?;
                if let Some((file_id, remaining)) = files::detach_path(&mut conn, &path)? {
                    debug!("detached {path:?}, {remaining} references remain");
                    if remaining == 0 {
                        let row = files::file_row(&mut conn, file_id)?;
                        ingest::enqueue_purge(
                            &self.tasks,
                            row.digest,
                            file_id,
                            self.services.config.tasks.max_attempts,
                        )?;
                    }
                }
            }
            ChangeEvent::Moved { from, to } => {
                if self.is_excluded(&to) || Modality::from_path(&to).is_none() {
                    return self.apply_event(ChangeEvent::Removed(from));
                }

                let mut conn = self.services.db.get()?;
                let Some(row) = files::file_by_path(&mut conn, &from)? else {
                    // Unknown source: treat the destination as brand new.
                    drop(conn);
                    return self.apply_event(ChangeEvent::Created(to));
                };

                // Attach before detaching so the reference count never
                // touches zero; a move must not trigger a purge or a
                // re-embed.
                let mtime = to
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or_default();
                files::upsert_file(&mut conn, row.digest, &to, mtime, row.size, row.modality)?;
                files::detach_path(&mut conn, &from)?;
                debug!("moved {from:?} -> {to:?} without re-embedding");
            }
        }
        Ok(())
    }

    fn enqueue_scan(&self, path: &Path) -> AppResult<()> {
        let new = NewTask {
            kind: TaskKind::FileScan,
            target: Some(path.to_string_lossy().into_owned()),
            file_id: None,
            pipeline_group: None,
            file_bonus: 0,
            max_attempts: self.services.config.tasks.max_attempts,
            deps: Vec::new(),
        };
        self.tasks.enqueue(new)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::mock;
    use crate::state::Shutdown;
    use crate::store::tasks::{self, TaskFilter, TaskStatus};

    fn setup() -> (tempfile::TempDir, Arc<Services>, Arc<TaskEngine>, Arc<Scanner>) {
        let (dir, services) = crate::engine::test_services();
        let services = Arc::new(services);
        let engine = TaskEngine::new(services.clone(), Shutdown::new());
        let scanner = Scanner::new(services.clone(), engine.clone());
        (dir, services, engine, scanner)
    }

    fn queued_scans(services: &Services) -> Vec<String> {
        let mut conn = services.db.get().unwrap();
        tasks::get_tasks(
            &mut conn,
            &TaskFilter {
                kind: Some(TaskKind::FileScan),
                status: Some(TaskStatus::Queued),
                ..TaskFilter::default()
            },
        )
        .unwrap()
        .into_iter()
        .filter_map(|t| t.target)
        .collect()
    }

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match(".*", ".hidden"));
        assert!(!wildcard_match(".*", "visible.jpg"));
        assert!(wildcard_match("*.tmp", "upload.tmp"));
        assert!(!wildcard_match("*.tmp", "upload.tmp.done"));
        assert!(wildcard_match("*~", "draft.md~"));
        assert!(wildcard_match("cache*", "cache_dir"));
        assert!(wildcard_match("a*b*c", "a-x-b-y-c"));
        assert!(!wildcard_match("a*b*c", "a-x-c"));
    }

    #[test]
    fn initial_scan_enqueues_and_is_idempotent() {
        let (dir, services, _engine, scanner) = setup();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(tree.join("nested")).unwrap();
        mock::write_image_fixture(&tree.join("cat.jpg"), 800, 600, "cat");
        mock::write_image_fixture(&tree.join("nested/dog.png"), 800, 600, "dog");
        std::fs::write(tree.join("notes.bin"), "not indexable").unwrap();
        std::fs::write(tree.join(".hidden.jpg"), "excluded").unwrap();

        let summary = scanner.initial_scan(&[tree.clone()]).unwrap();
        assert_eq!(summary.enqueued, 2);
        assert_eq!(queued_scans(&services).len(), 2);

        // A second scan sees the same tree; the queued tasks dedupe and no
        // duplicates arise (mtimes unchanged, but rows do not exist yet, so
        // the scan re-enqueues onto the identical queued task).
        scanner.initial_scan(&[tree]).unwrap();
        assert_eq!(queued_scans(&services).len(), 2);
    }

    #[test]
    fn excluded_events_are_ignored() {
        let (dir, services, _engine, scanner) = setup();
        let path = dir.path().join(".secret.jpg");
        mock::write_image_fixture(&path, 800, 600, "x");

        scanner.apply_event(ChangeEvent::Created(path)).unwrap();
        assert!(queued_scans(&services).is_empty());
    }

    #[test]
    fn move_preserves_identity_without_reembedding() {
        let (dir, services, _engine, scanner) = setup();
        let from = dir.path().join("a.jpg");
        let to = dir.path().join("b.jpg");
        mock::write_image_fixture(&from, 800, 600, "cat");

        // Seed the binding the way file_scan would have.
        let digest = hash_file(&from).unwrap();
        {
            let mut conn = services.db.get().unwrap();
            files::upsert_file(&mut conn, digest, &from, 1, 10, Modality::Image).unwrap();
        }

        std::fs::rename(&from, &to).unwrap();
        scanner
            .apply_event(ChangeEvent::Moved {
                from: from.clone(),
                to: to.clone(),
            })
            .unwrap();

        let mut conn = services.db.get().unwrap();
        let row = files::file_by_path(&mut conn, &to).unwrap().unwrap();
        assert_eq!(row.digest, digest);
        assert!(files::file_by_path(&mut conn, &from).unwrap().is_none());
        assert_eq!(files::ref_count(&mut conn, row.id).unwrap(), 1);
        // No scan and no purge were enqueued for a pure rename.
        assert!(queued_scans(&services).is_empty());
        drop(conn);

        // A delete that leaves no references enqueues the purge.
        scanner.apply_event(ChangeEvent::Removed(to)).unwrap();
        let mut conn = services.db.get().unwrap();
        let purges = tasks::get_tasks(
            &mut conn,
            &TaskFilter {
                kind: Some(TaskKind::FilePurge),
                ..TaskFilter::default()
            },
        )
        .unwrap();
        assert_eq!(purges.len(), 1);
    }
}
