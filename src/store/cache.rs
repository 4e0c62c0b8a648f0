use std::path::PathBuf;

use rusqlite::{params, OptionalExtension};

use crate::{
    database::{Connection, QueryRowGetConnExt},
    state::AppResult,
    store::Digest,
    utils::now_secs,
};

/// One derived artifact in the content store. `pins` counts running tasks
/// holding the entry open; the sweeper never touches a pinned entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub digest: Digest,
    pub tag: String,
    pub path: PathBuf,
    pub size: u64,
    pub last_access: u64,
}

pub fn note_entry(
    conn: Connection,
    digest: Digest,
    tag: &str,
    path: &std::path::Path,
    size: u64,
    ttl: Option<u64>,
) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO cache_entry (digest, tag, path, size, last_access, ttl, pins)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                 COALESCE((SELECT pins FROM cache_entry WHERE digest = ?1 AND tag = ?2), 0))",
        params![
            digest,
            tag,
            path.to_string_lossy().as_ref(),
            size as i64,
            now_secs(),
            ttl
        ],
    )?;
    Ok(())
}

/// Cache probe: a hit refreshes the last-access time and returns the
/// artifact path. A miss just means recompute.
pub fn touch(conn: Connection, digest: Digest, tag: &str) -> AppResult<Option<PathBuf>> {
    let path: Option<String> = conn
        .query_row_get(
            "UPDATE cache_entry SET last_access = ?1 WHERE digest = ?2 AND tag = ?3
             RETURNING path",
            params![now_secs(), digest, tag],
        )
        .optional()?;
    Ok(path.map(PathBuf::from))
}

pub fn pin(conn: Connection, digest: Digest, tag: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE cache_entry SET pins = pins + 1 WHERE digest = ?1 AND tag = ?2",
        params![digest, tag],
    )?;
    Ok(())
}

pub fn unpin(conn: Connection, digest: Digest, tag: &str) -> AppResult<()> {
    conn.execute(
        "UPDATE cache_entry SET pins = MAX(pins - 1, 0) WHERE digest = ?1 AND tag = ?2",
        params![digest, tag],
    )?;
    Ok(())
}

pub fn remove_entry(conn: Connection, digest: Digest, tag: &str) -> AppResult<()> {
    conn.execute(
        "DELETE FROM cache_entry WHERE digest = ?1 AND tag = ?2",
        params![digest, tag],
    )?;
    Ok(())
}

pub fn entries_for(conn: Connection, digest: Digest) -> AppResult<Vec<CacheEntry>> {
    let mut stmt = conn.prepare(
        "SELECT digest, tag, path, size, last_access FROM cache_entry WHERE digest = ?1",
    )?;
    let entries = stmt
        .query_map([digest], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn total_size(conn: Connection) -> AppResult<u64> {
    let total: i64 = conn.query_row_get("SELECT COALESCE(SUM(size), 0) FROM cache_entry", [])?;
    Ok(total as u64)
}

/// Unpinned entries that are past their TTL, oldest first. When the store
/// exceeds its size budget the caller keeps draining this list until it
/// fits again, so the result also includes enough non-expired entries to
/// cover the overflow.
pub fn sweep_candidates(
    conn: Connection,
    default_ttl: u64,
    max_total: u64,
) -> AppResult<Vec<CacheEntry>> {
    let now = now_secs();
    let total = total_size(conn)?;
    let overflow = total.saturating_sub(max_total);

    let mut stmt = conn.prepare(
        "SELECT digest, tag, path, size, last_access, ttl FROM cache_entry
         WHERE pins = 0 ORDER BY last_access ASC",
    )?;
    let entries = stmt
        .query_map([], row_to_entry_with_ttl)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut reclaimed = 0u64;
    let mut out = Vec::new();
    for (entry, ttl) in entries {
        let expired = now.saturating_sub(entry.last_access) > ttl.unwrap_or(default_ttl);
        if expired || reclaimed < overflow {
            reclaimed += entry.size;
            out.push(entry);
        }
    }
    Ok(out)
}

fn row_to_entry(row: &rusqlite::Row) -> Result<CacheEntry, rusqlite::Error> {
    Ok(CacheEntry {
        digest: row.get(0)?,
        tag: row.get(1)?,
        path: PathBuf::from(row.get::<_, String>(2)?),
        size: row.get::<_, i64>(3)? as u64,
        last_access: row.get::<_, i64>(4)? as u64,
    })
}

fn row_to_entry_with_ttl(
    row: &rusqlite::Row,
) -> Result<(CacheEntry, Option<u64>), rusqlite::Error> {
    let ttl = row.get::<_, Option<i64>>(5)?.map(|t| t as u64);
    Ok((row_to_entry(row)?, ttl))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use std::path::Path;

    #[test]
    fn touch_hits_and_misses() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let digest = Digest([1; 32]);

        assert!(touch(&mut conn, digest, "thumb_256x256").unwrap().is_none());

        note_entry(
            &mut conn,
            digest,
            "thumb_256x256",
            Path::new("/data/content/01/x/thumb"),
            512,
            None,
        )
        .unwrap();
        let hit = touch(&mut conn, digest, "thumb_256x256").unwrap();
        assert_eq!(hit, Some(PathBuf::from("/data/content/01/x/thumb")));
    }

    #[test]
    fn pinned_entries_survive_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let digest = Digest([2; 32]);

        note_entry(&mut conn, digest, "a", Path::new("/c/a"), 100, None).unwrap();
        note_entry(&mut conn, digest, "b", Path::new("/c/b"), 100, None).unwrap();
        pin(&mut conn, digest, "a").unwrap();

        // Zero budget: everything unpinned is a candidate.
        let candidates = sweep_candidates(&mut conn, 3600, 0).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].tag, "b");

        unpin(&mut conn, digest, "a").unwrap();
        let candidates = sweep_candidates(&mut conn, 3600, 0).unwrap();
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn sweep_respects_budget_and_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let digest = Digest([3; 32]);

        note_entry(&mut conn, digest, "x", Path::new("/c/x"), 600, None).unwrap();
        note_entry(&mut conn, digest, "y", Path::new("/c/y"), 600, None).unwrap();

        // Inside TTL and inside budget: nothing to do.
        assert!(sweep_candidates(&mut conn, 3600, 10_000).unwrap().is_empty());

        // Budget overflow reclaims oldest-first until it fits.
        let candidates = sweep_candidates(&mut conn, 3600, 1000).unwrap();
        assert_eq!(candidates.len(), 1);

        // Expired entries go regardless of budget.
        conn.execute("UPDATE cache_entry SET last_access = 0", []).unwrap();
        let candidates = sweep_candidates(&mut conn, 3600, 10_000).unwrap();
        assert_eq!(candidates.len(), 2);
    }
}
