use std::path::Path;

use rusqlite::{params, OptionalExtension};

use crate::{
    database::{Connection, QueryRowGetConnExt, QueryRowGetStmtExt, QueryRowIntoStmtExt},
    state::{AppError, AppResult},
    store::{Digest, FileState, Modality},
    utils::now_secs,
};

#[derive(Debug, Clone, serde::Serialize)]
pub struct FileRow {
    pub id: i64,
    pub digest: Digest,
    pub modality: Modality,
    pub size: u64,
    pub state: FileState,
    pub failure: Option<String>,
    pub priority_bonus: i64,
}

impl TryFrom<&rusqlite::Row<'_>> for FileRow {
    type Error = rusqlite::Error;

    fn try_from(row: &rusqlite::Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            digest: row.get("digest")?,
            modality: row.get("modality")?,
            size: row.get::<_, i64>("size")? as u64,
            state: row.get("state")?,
            failure: row.get("failure")?,
            priority_bonus: row.get("priority_bonus")?,
        })
    }
}

const FILE_COLUMNS: &str = "id, digest, modality, size, state, failure, priority_bonus";

#[derive(Debug)]
pub struct UpsertOutcome {
    pub file_id: i64,
    /// The digest was not known before this call.
    pub is_new_digest: bool,
    /// A new path binding was created (the reference count grew).
    pub ref_grew: bool,
    /// When the path previously pointed at a different digest, that file id.
    pub rebound_from: Option<i64>,
}

/// Inserts the digest row when absent and binds the path to it. A path that
/// already points at a different digest is rebound; the caller must check
/// the old file for a zero reference count.
pub fn upsert_file(
    conn: Connection,
    digest: Digest,
    path: &Path,
    mtime: u64,
    size: u64,
    modality: Modality,
) -> AppResult<UpsertOutcome> {
    let tx = conn.transaction()?;
    let now = now_secs();

    let existing: Option<i64> = tx
        .query_row_get("SELECT id FROM source_file WHERE digest = ?1", [digest])
        .optional()?;
    let is_new_digest = existing.is_none();

    let file_id: i64 = match existing {
        Some(id) => id,
        None => tx.query_row_get(
            "INSERT INTO source_file (digest, modality, size, state, created)
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            params![digest, modality, size as i64, FileState::Pending, now],
        )?,
    };

    let path_str = path.to_string_lossy();
    let bound: Option<(i64, i64)> = tx
        .query_row(
            "SELECT id, file_id FROM source_path WHERE path = ?1",
            [path_str.as_ref()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (ref_grew, rebound_from) = match bound {
        Some((path_id, old_file_id)) if old_file_id == file_id => {
            tx.execute(
                "UPDATE source_path SET mtime = ?1 WHERE id = ?2",
                params![mtime, path_id],
            )?;
            (false, None)
        }
        Some((path_id, old_file_id)) => {
            tx.execute(
                "UPDATE source_path SET file_id = ?1, mtime = ?2 WHERE id = ?3",
                params![file_id, mtime, path_id],
            )?;
            (true, Some(old_file_id))
        }
        None => {
            tx.execute(
                "INSERT INTO source_path (file_id, path, mtime) VALUES (?1, ?2, ?3)",
                params![file_id, path_str.as_ref(), mtime],
            )?;
            (true, None)
        }
    };

    tx.commit()?;

    Ok(UpsertOutcome {
        file_id,
        is_new_digest,
        ref_grew,
        rebound_from,
    })
}

/// Removes a path binding. Returns the file it pointed at and the reference
/// count that remains; zero means the caller must enqueue a purge.
pub fn detach_path(conn: Connection, path: &Path) -> AppResult<Option<(i64, i64)>> {
    let tx = conn.transaction()?;

    let path_str = path.to_string_lossy();
    let file_id: Option<i64> = tx
        .query_row_get(
            "DELETE FROM source_path WHERE path = ?1 RETURNING file_id",
            [path_str.as_ref()],
        )
        .optional()?;

    let result = match file_id {
        Some(file_id) => {
            let remaining: i64 = tx.query_row_get(
                "SELECT COUNT(*) FROM source_path WHERE file_id = ?1",
                [file_id],
            )?;
            Some((file_id, remaining))
        }
        None => None,
    };

    tx.commit()?;
    Ok(result)
}

/// Compare-and-swap state transition; fails when the actual state moved on.
pub fn transition_file(
    conn: Connection,
    file_id: i64,
    from: FileState,
    to: FileState,
) -> AppResult<()> {
    let changed = conn.execute(
        "UPDATE source_file SET state = ?1 WHERE id = ?2 AND state = ?3",
        params![to, file_id, from],
    )?;
    if changed == 0 {
        return Err(AppError::Integrity(format!(
            "file {file_id} was not in state {} for transition to {}",
            from.name(),
            to.name()
        )));
    }
    Ok(())
}

/// Terminal transition with a reason; used for `skipped` and `failed`.
pub fn mark_file_terminal(
    conn: Connection,
    file_id: i64,
    state: FileState,
    reason: &str,
) -> AppResult<()> {
    conn.execute(
        "UPDATE source_file SET state = ?1, failure = ?2 WHERE id = ?3",
        params![state, reason, file_id],
    )?;
    Ok(())
}

/// Puts a failed or skipped file back to `pending` for an explicit requeue.
pub fn reset_for_requeue(conn: Connection, file_id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE source_file SET state = ?1, failure = NULL WHERE id = ?2",
        params![FileState::Pending, file_id],
    )?;
    Ok(())
}

pub fn file_row(conn: Connection, file_id: i64) -> AppResult<FileRow> {
    conn.prepare(&format!("SELECT {FILE_COLUMNS} FROM source_file WHERE id = ?1"))?
        .query_row_into([file_id])
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("file {file_id}")))
}

pub fn file_by_digest(conn: Connection, digest: Digest) -> AppResult<Option<FileRow>> {
    Ok(conn
        .prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM source_file WHERE digest = ?1"
        ))?
        .query_row_into([digest])
        .optional()?)
}

pub fn file_by_path(conn: Connection, path: &Path) -> AppResult<Option<FileRow>> {
    Ok(conn
        .prepare(&format!(
            "SELECT {FILE_COLUMNS} FROM source_file
             WHERE id = (SELECT file_id FROM source_path WHERE path = ?1)"
        ))?
        .query_row_into([path.to_string_lossy().as_ref()])
        .optional()?)
}

pub fn paths_for(conn: Connection, file_id: i64) -> AppResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT path FROM source_path WHERE file_id = ?1 ORDER BY path")?;
    let paths: Vec<String> = stmt
        .query_map_get([file_id])?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(paths)
}

pub fn ref_count(conn: Connection, file_id: i64) -> AppResult<i64> {
    Ok(conn.query_row_get(
        "SELECT COUNT(*) FROM source_path WHERE file_id = ?1",
        [file_id],
    )?)
}

/// Known mtime for a path, used by the scanner to skip unchanged files
/// without hashing them.
pub fn path_mtime(conn: Connection, path: &Path) -> AppResult<Option<u64>> {
    let mtime: Option<i64> = conn
        .query_row_get(
            "SELECT mtime FROM source_path WHERE path = ?1",
            [path.to_string_lossy().as_ref()],
        )
        .optional()?;
    Ok(mtime.map(|m| m as u64))
}

/// Deletes the file row itself; segments, paths and bindings cascade.
pub fn delete_file(conn: Connection, file_id: i64) -> AppResult<()> {
    conn.execute("DELETE FROM source_file WHERE id = ?1", [file_id])?;
    Ok(())
}

/// Every known path binding; the scanner diffs this against the
/// filesystem to prune bindings whose files vanished while nothing
/// watched.
pub fn all_paths(conn: Connection) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare("SELECT path FROM source_path ORDER BY path")?;
    let paths: Vec<String> = stmt
        .query_map_get([])?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(paths)
}

pub fn count_by_state(conn: Connection, state: FileState) -> AppResult<i64> {
    Ok(conn.query_row_get("SELECT COUNT(*) FROM source_file WHERE state = ?1", [state])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::path::PathBuf;

    fn digest(tag: u8) -> Digest {
        Digest([tag; 32])
    }

    #[test]
    fn upsert_tracks_reference_counts() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();

        let a = upsert_file(
            &mut conn,
            digest(1),
            &PathBuf::from("/tree/cat.jpg"),
            10,
            100,
            Modality::Image,
        )
        .unwrap();
        assert!(a.is_new_digest);
        assert!(a.ref_grew);

        // Same bytes under a second name: one file, two references.
        let b = upsert_file(
            &mut conn,
            digest(1),
            &PathBuf::from("/tree/cat_copy.jpg"),
            11,
            100,
            Modality::Image,
        )
        .unwrap();
        assert!(!b.is_new_digest);
        assert!(b.ref_grew);
        assert_eq!(a.file_id, b.file_id);
        assert_eq!(ref_count(&mut conn, a.file_id).unwrap(), 2);

        // Re-observing a known binding only refreshes the mtime.
        let c = upsert_file(
            &mut conn,
            digest(1),
            &PathBuf::from("/tree/cat.jpg"),
            12,
            100,
            Modality::Image,
        )
        .unwrap();
        assert!(!c.ref_grew);
        assert_eq!(ref_count(&mut conn, a.file_id).unwrap(), 2);
        assert_eq!(path_mtime(&mut conn, &PathBuf::from("/tree/cat.jpg")).unwrap(), Some(12));

        let detached = detach_path(&mut conn, &PathBuf::from("/tree/cat_copy.jpg"))
            .unwrap()
            .unwrap();
        assert_eq!(detached, (a.file_id, 1));
        let detached = detach_path(&mut conn, &PathBuf::from("/tree/cat.jpg"))
            .unwrap()
            .unwrap();
        assert_eq!(detached, (a.file_id, 0));
        assert!(detach_path(&mut conn, &PathBuf::from("/tree/cat.jpg"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn rebinding_a_path_reports_the_old_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();

        let path = PathBuf::from("/tree/edited.png");
        let old = upsert_file(&mut conn, digest(1), &path, 10, 50, Modality::Image).unwrap();
        let new = upsert_file(&mut conn, digest(2), &path, 20, 60, Modality::Image).unwrap();

        assert_ne!(old.file_id, new.file_id);
        assert_eq!(new.rebound_from, Some(old.file_id));
        assert_eq!(ref_count(&mut conn, old.file_id).unwrap(), 0);
        assert_eq!(ref_count(&mut conn, new.file_id).unwrap(), 1);
    }

    #[test]
    fn transition_is_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();

        let row = upsert_file(
            &mut conn,
            digest(3),
            &PathBuf::from("/tree/a.mp4"),
            1,
            1,
            Modality::Video,
        )
        .unwrap();

        transition_file(&mut conn, row.file_id, FileState::Pending, FileState::Processing)
            .unwrap();
        let err = transition_file(
            &mut conn,
            row.file_id,
            FileState::Pending,
            FileState::Processing,
        );
        assert!(matches!(err, Err(AppError::Integrity(_))));

        mark_file_terminal(&mut conn, row.file_id, FileState::Failed, "codec error").unwrap();
        let loaded = file_row(&mut conn, row.file_id).unwrap();
        assert_eq!(loaded.state, FileState::Failed);
        assert_eq!(loaded.failure.as_deref(), Some("codec error"));

        reset_for_requeue(&mut conn, row.file_id).unwrap();
        let loaded = file_row(&mut conn, row.file_id).unwrap();
        assert_eq!(loaded.state, FileState::Pending);
        assert!(loaded.failure.is_none());
    }
}
