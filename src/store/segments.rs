use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::{
    database::{Connection, QueryRowGetConnExt, QueryRowGetStmtExt},
    state::{AppError, AppResult},
    store::{Modality, SegmentKind},
    utils::now_secs,
};

/// One planned slice of a video or audio stream. For short videos there is
/// exactly one span covering the whole clip with `full_video` set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSpan {
    pub idx: i64,
    pub start_s: f64,
    pub end_s: f64,
    pub full_video: bool,
}

impl SegmentSpan {
    pub fn duration(&self) -> f64 {
        self.end_s - self.start_s
    }
}

#[derive(Debug, Clone)]
pub struct VideoMetadataRow {
    pub duration: f64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub segment_count: i64,
    pub short_video: bool,
    pub truncated_after: Option<f64>,
}

pub fn record_video_metadata(
    conn: &rusqlite::Connection,
    file_id: i64,
    meta: &VideoMetadataRow,
) -> AppResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO video_metadata
         (file_id, duration, frame_rate, width, height, segment_count, short_video, truncated_after)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            file_id,
            meta.duration,
            meta.frame_rate,
            meta.width,
            meta.height,
            meta.segment_count,
            meta.short_video,
            meta.truncated_after
        ],
    )?;
    Ok(())
}

pub fn video_metadata(conn: Connection, file_id: i64) -> AppResult<Option<VideoMetadataRow>> {
    Ok(conn
        .query_row(
            "SELECT duration, frame_rate, width, height, segment_count, short_video, truncated_after
             FROM video_metadata WHERE file_id = ?1",
            [file_id],
            |row| {
                Ok(VideoMetadataRow {
                    duration: row.get(0)?,
                    frame_rate: row.get(1)?,
                    width: row.get(2)?,
                    height: row.get(3)?,
                    segment_count: row.get(4)?,
                    short_video: row.get(5)?,
                    truncated_after: row.get(6)?,
                })
            },
        )
        .optional()?)
}

/// Inserts one segment row inside the caller's transaction and returns its
/// id. Paired with `insert_vector_binding` so segment, binding and
/// timestamp land atomically.
pub fn record_segment(
    tx: &Transaction,
    file_id: i64,
    kind: SegmentKind,
    span: &SegmentSpan,
    class: Option<&str>,
) -> AppResult<i64> {
    let id = match kind {
        SegmentKind::Video => tx.query_row_get(
            "INSERT INTO video_segment (file_id, idx, start_s, end_s, full_video)
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            params![file_id, span.idx, span.start_s, span.end_s, span.full_video],
        )?,
        SegmentKind::Audio => tx.query_row_get(
            "INSERT INTO audio_segment (file_id, idx, start_s, end_s, class)
             VALUES (?1, ?2, ?3, ?4, ?5) RETURNING id",
            params![file_id, span.idx, span.start_s, span.end_s, class],
        )?,
    };
    Ok(id)
}

/// Second half of the two-phase write: the vector already exists in the
/// vector store, this records the authoritative binding plus its timestamp
/// row when the vector describes a slice of time.
#[allow(clippy::too_many_arguments)]
pub fn insert_vector_binding(
    tx: &Transaction,
    collection: Modality,
    vector_id: i64,
    file_id: i64,
    segment: Option<(SegmentKind, i64)>,
    span: Option<&SegmentSpan>,
    modality: Modality,
) -> AppResult<()> {
    let (segment_table, segment_id) = match segment {
        Some((kind, id)) => (Some(kind), Some(id)),
        None => (None, None),
    };

    tx.execute(
        "INSERT OR REPLACE INTO vector_binding
         (collection, vector_id, file_id, segment_table, segment_id, created)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![collection, vector_id, file_id, segment_table, segment_id, now_secs()],
    )?;

    if segment.is_some() {
        let span = span.ok_or_else(|| {
            AppError::Integrity(format!(
                "vector {vector_id} has a segment reference but no time span"
            ))
        })?;
        tx.execute(
            "INSERT OR REPLACE INTO timestamp_map (collection, vector_id, start_s, end_s, modality)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, vector_id, span.start_s, span.end_s, modality],
        )?;
    }

    Ok(())
}

/// Removes every segment, binding and timestamp for a file, returning the
/// vector ids that must also leave the vector store. Used before a
/// re-index and by the purge pipeline.
pub fn clear_file_index(conn: Connection, file_id: i64) -> AppResult<Vec<(Modality, i64)>> {
    let tx = conn.transaction()?;

    let mut stmt =
        tx.prepare("SELECT collection, vector_id FROM vector_binding WHERE file_id = ?1")?;
    let removed = stmt
        .query_map([file_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(Modality, i64)>, _>>()?;
    drop(stmt);

    for (collection, vector_id) in &removed {
        tx.execute(
            "DELETE FROM timestamp_map WHERE collection = ?1 AND vector_id = ?2",
            params![collection, vector_id],
        )?;
    }
    tx.execute("DELETE FROM vector_binding WHERE file_id = ?1", [file_id])?;
    tx.execute("DELETE FROM video_segment WHERE file_id = ?1", [file_id])?;
    tx.execute("DELETE FROM audio_segment WHERE file_id = ?1", [file_id])?;
    tx.execute("DELETE FROM video_metadata WHERE file_id = ?1", [file_id])?;

    tx.commit()?;
    Ok(removed)
}

#[derive(Debug, Clone)]
pub struct BindingRow {
    pub file_id: i64,
    pub segment: Option<(SegmentKind, i64)>,
    pub span: Option<(f64, f64)>,
}

/// Resolves a search hit back to its file and temporal span.
pub fn binding_for(
    conn: Connection,
    collection: Modality,
    vector_id: i64,
) -> AppResult<Option<BindingRow>> {
    let row = conn
        .query_row(
            "SELECT file_id, segment_table, segment_id FROM vector_binding
             WHERE collection = ?1 AND vector_id = ?2",
            params![collection, vector_id],
            |row| {
                let segment_table: Option<SegmentKind> = row.get(1)?;
                let segment_id: Option<i64> = row.get(2)?;
                Ok((row.get::<_, i64>(0)?, segment_table.zip(segment_id)))
            },
        )
        .optional()?;

    let Some((file_id, segment)) = row else {
        return Ok(None);
    };

    let span = conn
        .query_row(
            "SELECT start_s, end_s FROM timestamp_map WHERE collection = ?1 AND vector_id = ?2",
            params![collection, vector_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(Some(BindingRow {
        file_id,
        segment,
        span,
    }))
}

pub fn video_segments(conn: Connection, file_id: i64) -> AppResult<Vec<SegmentSpan>> {
    let mut stmt = conn.prepare(
        "SELECT idx, start_s, end_s, full_video FROM video_segment
         WHERE file_id = ?1 ORDER BY idx",
    )?;
    let spans = stmt
        .query_map([file_id], |row| {
            Ok(SegmentSpan {
                idx: row.get(0)?,
                start_s: row.get(1)?,
                end_s: row.get(2)?,
                full_video: row.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(spans)
}

/// All vector ids the metadata store believes live in a collection; the
/// integrity sweeper diffs this against the vector store's own listing.
pub fn binding_ids(conn: Connection, collection: Modality) -> AppResult<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT vector_id FROM vector_binding WHERE collection = ?1")?;
    let ids: Vec<i64> = stmt
        .query_map_get([collection])?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Drops a binding that points at a vector the store no longer holds.
pub fn remove_binding(conn: Connection, collection: Modality, vector_id: i64) -> AppResult<()> {
    conn.execute(
        "DELETE FROM timestamp_map WHERE collection = ?1 AND vector_id = ?2",
        params![collection, vector_id],
    )?;
    conn.execute(
        "DELETE FROM vector_binding WHERE collection = ?1 AND vector_id = ?2",
        params![collection, vector_id],
    )?;
    Ok(())
}

pub fn vector_count(conn: Connection, collection: Modality) -> AppResult<i64> {
    Ok(conn.query_row_get(
        "SELECT COUNT(*) FROM vector_binding WHERE collection = ?1",
        [collection],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::store::files;
    use crate::store::{Digest, FileState, Modality};
    use std::path::PathBuf;

    fn setup_file(conn: Connection) -> i64 {
        files::upsert_file(
            conn,
            Digest([7; 32]),
            &PathBuf::from("/tree/talk.mp4"),
            1,
            1,
            Modality::Video,
        )
        .unwrap()
        .file_id
    }

    #[test]
    fn segment_binding_and_timestamp_are_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let file_id = setup_file(&mut conn);

        let span = SegmentSpan {
            idx: 0,
            start_s: 0.0,
            end_s: 4.0,
            full_video: true,
        };

        let tx = conn.transaction().unwrap();
        let segment_id =
            record_segment(&tx, file_id, SegmentKind::Video, &span, None).unwrap();
        insert_vector_binding(
            &tx,
            Modality::Video,
            11,
            file_id,
            Some((SegmentKind::Video, segment_id)),
            Some(&span),
            Modality::Video,
        )
        .unwrap();
        tx.commit().unwrap();

        let binding = binding_for(&mut conn, Modality::Video, 11).unwrap().unwrap();
        assert_eq!(binding.file_id, file_id);
        assert_eq!(binding.segment, Some((SegmentKind::Video, segment_id)));
        assert_eq!(binding.span, Some((0.0, 4.0)));

        let segments = video_segments(&mut conn, file_id).unwrap();
        assert_eq!(segments, vec![span]);
    }

    #[test]
    fn binding_without_span_is_rejected_for_segments() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let file_id = setup_file(&mut conn);

        let tx = conn.transaction().unwrap();
        let err = insert_vector_binding(
            &tx,
            Modality::Video,
            5,
            file_id,
            Some((SegmentKind::Video, 1)),
            None,
            Modality::Video,
        );
        assert!(matches!(err, Err(AppError::Integrity(_))));
    }

    #[test]
    fn clear_file_index_returns_vector_ids() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_in_dir(dir.path());
        let mut conn = db.get().unwrap();
        let file_id = setup_file(&mut conn);

        for idx in 0..3 {
            let span = SegmentSpan {
                idx,
                start_s: idx as f64 * 5.0,
                end_s: (idx + 1) as f64 * 5.0,
                full_video: false,
            };
            let tx = conn.transaction().unwrap();
            let segment_id =
                record_segment(&tx, file_id, SegmentKind::Video, &span, None).unwrap();
            insert_vector_binding(
                &tx,
                Modality::Video,
                100 + idx,
                file_id,
                Some((SegmentKind::Video, segment_id)),
                Some(&span),
                Modality::Video,
            )
            .unwrap();
            tx.commit().unwrap();
        }

        // The indexed state survives file transitions around the commit.
        files::transition_file(&mut conn, file_id, FileState::Pending, FileState::Processing)
            .unwrap();

        let removed = clear_file_index(&mut conn, file_id).unwrap();
        assert_eq!(removed.len(), 3);
        assert!(removed.iter().all(|(c, _)| *c == Modality::Video));
        assert!(video_segments(&mut conn, file_id).unwrap().is_empty());
        assert!(binding_for(&mut conn, Modality::Video, 100).unwrap().is_none());
        assert_eq!(vector_count(&mut conn, Modality::Video).unwrap(), 0);
    }
}
