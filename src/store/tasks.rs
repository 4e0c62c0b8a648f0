use std::collections::HashMap;

use itertools::Itertools;
use rusqlite::{params, types::FromSql, OptionalExtension, ToSql, TransactionBehavior};
use serde::Serialize;

use crate::{
    database::{Connection, QueryRowGetStmtExt, QueryRowIntoStmtExt},
    state::{AppError, AppResult},
    store::Digest,
    utils::now_secs,
};

/// Every job the engine knows how to run. The discriminants are the stored
/// representation; never reorder them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub enum TaskKind {
    ConfigLoad = 0,
    DatabaseInit = 1,
    VectorStoreInit = 2,
    FileEmbedText = 3,
    FileEmbedImage = 4,
    FileScan = 5,
    VideoSlice = 6,
    FileEmbedVideo = 7,
    AudioSegment = 8,
    FileEmbedAudio = 9,
    Search = 10,
    SearchMultimodal = 11,
    RankResults = 12,
    FilterResults = 13,
    ThumbnailGenerate = 14,
    PreviewGenerate = 15,
    FilePurge = 16,
}

impl TaskKind {
    pub const ALL: [TaskKind; 17] = [
        TaskKind::ConfigLoad,
        TaskKind::DatabaseInit,
        TaskKind::VectorStoreInit,
        TaskKind::FileEmbedText,
        TaskKind::FileEmbedImage,
        TaskKind::FileScan,
        TaskKind::VideoSlice,
        TaskKind::FileEmbedVideo,
        TaskKind::AudioSegment,
        TaskKind::FileEmbedAudio,
        TaskKind::Search,
        TaskKind::SearchMultimodal,
        TaskKind::RankResults,
        TaskKind::FilterResults,
        TaskKind::ThumbnailGenerate,
        TaskKind::PreviewGenerate,
        TaskKind::FilePurge,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ConfigLoad => "config_load",
            TaskKind::DatabaseInit => "database_init",
            TaskKind::VectorStoreInit => "vector_store_init",
            TaskKind::FileEmbedText => "file_embed_text",
            TaskKind::FileEmbedImage => "file_embed_image",
            TaskKind::FileScan => "file_scan",
            TaskKind::VideoSlice => "video_slice",
            TaskKind::FileEmbedVideo => "file_embed_video",
            TaskKind::AudioSegment => "audio_segment",
            TaskKind::FileEmbedAudio => "file_embed_audio",
            TaskKind::Search => "search",
            TaskKind::SearchMultimodal => "search_multimodal",
            TaskKind::RankResults => "rank_results",
            TaskKind::FilterResults => "filter_results",
            TaskKind::ThumbnailGenerate => "thumbnail_generate",
            TaskKind::PreviewGenerate => "preview_generate",
            TaskKind::FilePurge => "file_purge",
        }
    }

    pub fn from_name(name: &str) -> Option<TaskKind> {
        TaskKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Base dispatch priority; lower runs first.
    pub fn base_priority(&self) -> i64 {
        match self {
            TaskKind::ConfigLoad | TaskKind::DatabaseInit | TaskKind::VectorStoreInit => 0,
            TaskKind::FileEmbedText | TaskKind::FileEmbedImage => 1,
            TaskKind::FileScan | TaskKind::FilePurge => 2,
            TaskKind::VideoSlice | TaskKind::FileEmbedVideo => 3,
            TaskKind::AudioSegment | TaskKind::FileEmbedAudio => 4,
            TaskKind::Search | TaskKind::SearchMultimodal => 5,
            TaskKind::RankResults | TaskKind::FilterResults => 6,
            TaskKind::ThumbnailGenerate | TaskKind::PreviewGenerate => 7,
        }
    }

    pub fn pool(&self) -> WorkerPool {
        match self {
            TaskKind::FileEmbedText
            | TaskKind::FileEmbedImage
            | TaskKind::FileEmbedVideo
            | TaskKind::FileEmbedAudio
            | TaskKind::Search
            | TaskKind::SearchMultimodal => WorkerPool::Embedding,
            TaskKind::ConfigLoad
            | TaskKind::DatabaseInit
            | TaskKind::VectorStoreInit
            | TaskKind::FileScan
            | TaskKind::FilePurge => WorkerPool::Io,
            TaskKind::VideoSlice
            | TaskKind::AudioSegment
            | TaskKind::RankResults
            | TaskKind::FilterResults
            | TaskKind::ThumbnailGenerate
            | TaskKind::PreviewGenerate => WorkerPool::Task,
        }
    }

    pub fn is_embedding(&self) -> bool {
        matches!(
            self,
            TaskKind::FileEmbedText
                | TaskKind::FileEmbedImage
                | TaskKind::FileEmbedVideo
                | TaskKind::FileEmbedAudio
        )
    }
}

impl FromSql for TaskKind {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Integer(i) => TaskKind::ALL
                .into_iter()
                .find(|kind| *kind as i64 == i)
                .ok_or(rusqlite::types::FromSqlError::InvalidType),
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for TaskKind {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Integer(*self as i64),
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WorkerPool {
    Embedding,
    Io,
    Task,
}

impl WorkerPool {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerPool::Embedding => "embedding",
            WorkerPool::Io => "io",
            WorkerPool::Task => "task",
        }
    }

    pub fn kinds(&self) -> impl Iterator<Item = TaskKind> + '_ {
        TaskKind::ALL.into_iter().filter(|kind| kind.pool() == *self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum TaskStatus {
    Queued = 0,
    Running = 1,
    Succeeded = 2,
    Failed = 3,
    Cancelled = 4,
    Cancelling = 5,
}

impl TaskStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Cancelling => "cancelling",
        }
    }
}

impl FromSql for TaskStatus {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Integer(i) => match i {
                0 => Ok(TaskStatus::Queued),
                1 => Ok(TaskStatus::Running),
                2 => Ok(TaskStatus::Succeeded),
                3 => Ok(TaskStatus::Failed),
                4 => Ok(TaskStatus::Cancelled),
                5 => Ok(TaskStatus::Cancelling),
                _ => Err(rusqlite::types::FromSqlError::InvalidType),
            },
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for TaskStatus {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Integer(*self as i64),
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRow {
    pub id: i64,
    pub kind: TaskKind,
    pub target: Option<String>,
    pub file_id: Option<i64>,
    pub pipeline_group: Option<Digest>,
    pub status: TaskStatus,
    pub priority: i64,
    pub created: u64,
    pub updated: u64,
    pub not_before: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: f64,
    pub error: Option<String>,
    pub result: Option<String>,
}

impl TryFrom<&rusqlite::Row<'_>> for TaskRow {
    type Error = rusqlite::Error;

    fn try_from(row: &rusqlite::Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get("id")?,
            kind: row.get("kind")?,
            target: row.get("target")?,
            file_id: row.get("file_id")?,
            pipeline_group: row.get("pipeline_group")?,
            status: row.get("status")?,
            priority: row.get("priority")?,
            created: row.get::<_, i64>("created")? as u64,
            updated: row.get::<_, i64>("updated")? as u64,
            not_before: row.get::<_, i64>("not_before")? as u64,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            progress: row.get("progress")?,
            error: row.get("error")?,
            result: row.get("result")?,
        })
    }
}

const TASK_COLUMNS: &str = "id, kind, target, file_id, pipeline_group, status, priority, \
     created, updated, not_before, attempts, max_attempts, progress, error, result";

/// Bounded age compensation: one priority step per minute queued, capped,
/// so nothing starves behind a steady stream of hotter work.
const AGE_BONUS_UNIT_SECS: u64 = 60;
const AGE_BONUS_MAX: i64 = 3;

pub fn retry_backoff_secs(attempts: u32) -> u64 {
    2u64.saturating_pow(attempts).min(60)
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub kind: TaskKind,
    pub target: Option<String>,
    pub file_id: Option<i64>,
    pub pipeline_group: Option<Digest>,
    pub file_bonus: i64,
    pub max_attempts: u32,
    pub deps: Vec<i64>,
}

impl NewTask {
    pub fn bare(kind: TaskKind, max_attempts: u32) -> Self {
        Self {
            kind,
            target: None,
            file_id: None,
            pipeline_group: None,
            file_bonus: 0,
            max_attempts,
            deps: Vec::new(),
        }
    }

    /// A task scoped to one source file; the digest doubles as the
    /// pipeline-lock group.
    pub fn for_file(
        kind: TaskKind,
        digest: Digest,
        file_id: i64,
        target: impl Into<String>,
        max_attempts: u32,
    ) -> Self {
        Self {
            kind,
            target: Some(target.into()),
            file_id: Some(file_id),
            pipeline_group: Some(digest),
            file_bonus: 0,
            max_attempts,
            deps: Vec::new(),
        }
    }

    pub fn depends_on(mut self, deps: &[i64]) -> Self {
        self.deps.extend_from_slice(deps);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// Persists a task. An identical task already queued for the same target
/// is reused instead of duplicated, which keeps repeated scans idempotent.
pub fn enqueue(conn: Connection, new: NewTask) -> AppResult<i64> {
    let tx = conn.transaction()?;
    let now = now_secs();

    if let Some(target) = &new.target {
        let existing: Option<i64> = tx
            .prepare(
                "SELECT id FROM task WHERE kind = ?1 AND target = ?2 AND status = ?3 LIMIT 1",
            )?
            .query_row_get(params![new.kind, target, TaskStatus::Queued])
            .optional()?;
        if let Some(id) = existing {
            tx.commit()?;
            return Ok(id);
        }
    }

    let priority = new.kind.base_priority() - new.file_bonus;
    let id: i64 = tx
        .prepare(
            "INSERT INTO task
             (kind, target, file_id, pipeline_group, status, priority, created, updated,
              not_before, attempts, max_attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, 0, ?8) RETURNING id",
        )?
        .query_row_get(params![
            new.kind,
            new.target,
            new.file_id,
            new.pipeline_group,
            TaskStatus::Queued,
            priority,
            now,
            new.max_attempts,
        ])?;

    // Dependencies only point backwards in creation order, so the stored
    // graph cannot contain a cycle.
    for dep in &new.deps {
        if *dep >= id {
            return Err(AppError::Integrity(format!(
                "task {id} may not depend on {dep}"
            )));
        }
        tx.execute(
            "INSERT OR IGNORE INTO task_dependency (task_id, depends_on) VALUES (?1, ?2)",
            params![id, dep],
        )?;
    }

    tx.commit()?;
    Ok(id)
}

/// Claims the most urgent dispatchable task for a pool, marking it running
/// in the same transaction. Honors dependency completion, pipeline-group
/// exclusivity and per-type running caps; two callers can never claim the
/// same row.
pub fn next_task(
    conn: Connection,
    pool: WorkerPool,
    caps: &HashMap<TaskKind, usize>,
    now: u64,
) -> AppResult<Option<TaskRow>> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut running: HashMap<TaskKind, i64> = HashMap::new();
    {
        let mut stmt = tx.prepare(
            "SELECT kind, COUNT(*) FROM task WHERE status IN (?1, ?2) GROUP BY kind",
        )?;
        let rows = stmt.query_map(params![TaskStatus::Running, TaskStatus::Cancelling], |row| {
            Ok((row.get::<_, TaskKind>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (kind, count) = row?;
            running.insert(kind, count);
        }
    }

    let allowed = pool
        .kinds()
        .filter(|kind| {
            let cap = caps.get(kind).copied().unwrap_or(usize::MAX);
            (running.get(kind).copied().unwrap_or(0) as usize) < cap
        })
        .map(|kind| (kind as i64).to_string())
        .join(", ");
    if allowed.is_empty() {
        return Ok(None);
    }

    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM task t
         WHERE t.status = ?1
           AND t.kind IN ({allowed})
           AND t.not_before <= ?2
           AND NOT EXISTS (
               SELECT 1 FROM task_dependency d JOIN task dt ON dt.id = d.depends_on
               WHERE d.task_id = t.id AND dt.status != ?3)
           AND (t.pipeline_group IS NULL OR NOT EXISTS (
               SELECT 1 FROM task r
               WHERE r.pipeline_group = t.pipeline_group AND r.status IN (?4, ?5)))
         ORDER BY t.priority - MIN(?6, (?2 - t.created) / ?7) ASC, t.id ASC
         LIMIT 1"
    );

    let task: Option<TaskRow> = tx
        .prepare(&sql)?
        .query_row_into(params![
            TaskStatus::Queued,
            now,
            TaskStatus::Succeeded,
            TaskStatus::Running,
            TaskStatus::Cancelling,
            AGE_BONUS_MAX,
            AGE_BONUS_UNIT_SECS,
        ])
        .optional()?;

    let task = match task {
        Some(mut task) => {
            tx.execute(
                "UPDATE task SET status = ?1, updated = ?2, attempts = attempts + 1, progress = 0.0
                 WHERE id = ?3",
                params![TaskStatus::Running, now, task.id],
            )?;
            task.status = TaskStatus::Running;
            task.attempts += 1;
            Some(task)
        }
        None => None,
    };

    tx.commit()?;
    Ok(task)
}

pub fn complete_task(conn: Connection, id: i64, result: Option<&str>) -> AppResult<()> {
    conn.execute(
        "UPDATE task SET status = ?1, updated = ?2, progress = 1.0, result = ?3, error = NULL
         WHERE id = ?4",
        params![TaskStatus::Succeeded, now_secs(), result, id],
    )?;
    Ok(())
}

/// Records a failure. Retryable failures under the attempt cap go back to
/// the queue with backoff; everything else is permanent and cancels queued
/// dependents. Returns whether the task was requeued.
pub fn fail_task(conn: Connection, id: i64, error: &str, retryable: bool) -> AppResult<bool> {
    let tx = conn.transaction()?;
    let now = now_secs();

    let (attempts, max_attempts): (u32, u32) = tx.query_row(
        "SELECT attempts, max_attempts FROM task WHERE id = ?1",
        [id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let requeued = if retryable && attempts < max_attempts {
        tx.execute(
            "UPDATE task SET status = ?1, updated = ?2, not_before = ?3, error = ?4 WHERE id = ?5",
            params![
                TaskStatus::Queued,
                now,
                now + retry_backoff_secs(attempts),
                error,
                id
            ],
        )?;
        true
    } else {
        tx.execute(
            "UPDATE task SET status = ?1, updated = ?2, error = ?3 WHERE id = ?4",
            params![TaskStatus::Failed, now, error, id],
        )?;
        cancel_dependents(&tx, id, now)?;
        false
    };

    tx.commit()?;
    Ok(requeued)
}

/// Cancels every queued task that can no longer run because `root` will
/// never succeed, following the dependency edges transitively.
fn cancel_dependents(tx: &rusqlite::Transaction, root: i64, now: u64) -> AppResult<()> {
    let mut frontier = vec![root];
    while let Some(done) = frontier.pop() {
        let mut stmt = tx.prepare_cached(
            "SELECT d.task_id FROM task_dependency d JOIN task t ON t.id = d.task_id
             WHERE d.depends_on = ?1 AND t.status = ?2",
        )?;
        let dependents: Vec<i64> = stmt
            .query_map_get(params![done, TaskStatus::Queued])?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        for dependent in dependents {
            tx.execute(
                "UPDATE task SET status = ?1, updated = ?2, error = ?3 WHERE id = ?4",
                params![
                    TaskStatus::Cancelled,
                    now,
                    "dependency failed or was cancelled",
                    dependent
                ],
            )?;
            frontier.push(dependent);
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Was queued, now cancelled.
    Cancelled,
    /// Is running; marked cancelling, the worker observes the flag at its
    /// next checkpoint.
    Signalled,
    /// Already finished or unknown.
    Unchanged,
}

pub fn cancel_task(conn: Connection, id: i64) -> AppResult<CancelOutcome> {
    let tx = conn.transaction()?;
    let now = now_secs();

    let status: Option<TaskStatus> = tx
        .prepare("SELECT status FROM task WHERE id = ?1")?
        .query_row_get([id])
        .optional()?;

    let outcome = match status {
        Some(TaskStatus::Queued) => {
            tx.execute(
                "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3",
                params![TaskStatus::Cancelled, now, id],
            )?;
            cancel_dependents(&tx, id, now)?;
            CancelOutcome::Cancelled
        }
        Some(TaskStatus::Running) => {
            tx.execute(
                "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3",
                params![TaskStatus::Cancelling, now, id],
            )?;
            CancelOutcome::Signalled
        }
        _ => CancelOutcome::Unchanged,
    };

    tx.commit()?;
    Ok(outcome)
}

/// Queue-wide cancel for one kind; returns the ids of running tasks whose
/// workers still need their token cancelled.
pub fn cancel_tasks_by_kind(conn: Connection, kind: TaskKind) -> AppResult<Vec<i64>> {
    let tx = conn.transaction()?;
    let now = now_secs();

    let queued: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM task WHERE kind = ?1 AND status = ?2")?;
        let rows = stmt
            .query_map_get(params![kind, TaskStatus::Queued])?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for id in &queued {
        tx.execute(
            "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3",
            params![TaskStatus::Cancelled, now, id],
        )?;
        cancel_dependents(&tx, *id, now)?;
    }

    let running: Vec<i64> = {
        let mut stmt = tx.prepare("SELECT id FROM task WHERE kind = ?1 AND status = ?2")?;
        let rows = stmt
            .query_map_get(params![kind, TaskStatus::Running])?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for id in &running {
        tx.execute(
            "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3",
            params![TaskStatus::Cancelling, now, id],
        )?;
    }

    tx.commit()?;
    Ok(running)
}

/// A cancelling worker observed the flag; the task reaches its terminal
/// state here.
pub fn finalize_cancelled(conn: Connection, id: i64) -> AppResult<()> {
    let tx = conn.transaction()?;
    let now = now_secs();
    tx.execute(
        "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3",
        params![TaskStatus::Cancelled, now, id],
    )?;
    cancel_dependents(&tx, id, now)?;
    tx.commit()?;
    Ok(())
}

pub fn mark_cancelling(conn: Connection, id: i64) -> AppResult<()> {
    conn.execute(
        "UPDATE task SET status = ?1, updated = ?2 WHERE id = ?3 AND status = ?4",
        params![TaskStatus::Cancelling, now_secs(), id, TaskStatus::Running],
    )?;
    Ok(())
}

pub fn set_progress(conn: Connection, id: i64, progress: f64) -> AppResult<()> {
    conn.execute(
        "UPDATE task SET progress = ?1, updated = ?2 WHERE id = ?3",
        params![progress.clamp(0.0, 1.0), now_secs(), id],
    )?;
    Ok(())
}

/// Requeues everything a previous process left marked running; attempt
/// counters are preserved so the retry bound still holds after a crash.
pub fn recover_running(conn: Connection) -> AppResult<usize> {
    let changed = conn.execute(
        "UPDATE task SET status = ?1, updated = ?2 WHERE status IN (?3, ?4)",
        params![
            TaskStatus::Queued,
            now_secs(),
            TaskStatus::Running,
            TaskStatus::Cancelling
        ],
    )?;
    Ok(changed)
}

/// Bootstrap steps run synchronously at startup; their record lands here so
/// `get_tasks` shows the full history.
pub fn record_bootstrap(conn: Connection, kind: TaskKind) -> AppResult<()> {
    let now = now_secs();
    conn.execute(
        "INSERT INTO task (kind, status, priority, created, updated, not_before, attempts,
                           max_attempts, progress, result)
         VALUES (?1, ?2, ?3, ?4, ?4, 0, 1, 1, 1.0, 'ok')",
        params![kind, TaskStatus::Succeeded, kind.base_priority(), now],
    )?;
    Ok(())
}

pub fn task_row(conn: Connection, id: i64) -> AppResult<TaskRow> {
    conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM task WHERE id = ?1"))?
        .query_row_into([id])
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("task {id}")))
}

pub fn dependency_results(conn: Connection, id: i64) -> AppResult<Vec<(TaskKind, Option<String>)>> {
    let mut stmt = conn.prepare(
        "SELECT t.kind, t.result FROM task_dependency d JOIN task t ON t.id = d.depends_on
         WHERE d.task_id = ?1 ORDER BY t.id",
    )?;
    let results = stmt
        .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(results)
}

#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub kind: Option<TaskKind>,
    pub status: Option<TaskStatus>,
    pub file_id: Option<i64>,
    pub limit: Option<usize>,
}

pub fn get_tasks(conn: Connection, filter: &TaskFilter) -> AppResult<Vec<TaskRow>> {
    let mut clauses = Vec::new();
    let mut params_vec: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(kind) = filter.kind {
        params_vec.push(Box::new(kind));
        clauses.push(format!("kind = ?{}", params_vec.len()));
    }
    if let Some(status) = filter.status {
        params_vec.push(Box::new(status));
        clauses.push(format!("status = ?{}", params_vec.len()));
    }
    if let Some(file_id) = filter.file_id {
        params_vec.push(Box::new(file_id));
        clauses.push(format!("file_id = ?{}", params_vec.len()));
    }

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.iter().join(" AND "))
    };
    let limit = filter.limit.unwrap_or(1000);
    let sql = format!(
        "SELECT {TASK_COLUMNS} FROM task {where_clause} ORDER BY id DESC LIMIT {limit}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<TaskRow> = stmt
        .query_map_into(rusqlite::params_from_iter(
            params_vec.iter().map(|p| p.as_ref()),
        ))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn counts_by_status(conn: Connection) -> AppResult<Vec<(TaskStatus, i64)>> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM task GROUP BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

pub fn queued_count(conn: Connection) -> AppResult<i64> {
    Ok(conn
        .prepare("SELECT COUNT(*) FROM task WHERE status = ?1")?
        .query_row_get([TaskStatus::Queued])?)
}

pub fn queued_embed_count(conn: Connection) -> AppResult<i64> {
    let kinds = TaskKind::ALL
        .into_iter()
        .filter(TaskKind::is_embedding)
        .map(|kind| (kind as i64).to_string())
        .join(", ");
    Ok(conn
        .prepare(&format!(
            "SELECT COUNT(*) FROM task WHERE status = ?1 AND kind IN ({kinds})"
        ))?
        .query_row_get([TaskStatus::Queued])?)
}
