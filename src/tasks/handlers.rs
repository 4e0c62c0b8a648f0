use std::path::{Path, PathBuf};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    database::Connection,
    engine::Services,
    ingest,
    media::preprocess::Preprocessor,
    scanner,
    search::{self, RetrievedSet, SearchQuery, SearchResponse},
    state::{AppError, AppResult},
    store::{
        cache, files,
        files::FileRow,
        segments::{self, SegmentSpan, VideoMetadataRow},
        tasks::{self, TaskKind, TaskRow},
        Digest, FileState, Modality, SegmentKind,
    },
    tasks::TaskEngine,
    utils::HandleErr,
};

/// Frames sampled per video segment when the model pools frames.
const FRAMES_PER_SEGMENT: usize = 3;

/// Everything a handler gets to see. Checkpoints are the cancellation
/// boundaries: between hash and probe, between segments, between batches.
pub struct TaskCtx<'a> {
    pub engine: &'a TaskEngine,
    pub task: &'a TaskRow,
    pub token: &'a CancellationToken,
}

impl TaskCtx<'_> {
    pub fn services(&self) -> &Services {
        self.engine.services()
    }

    pub fn checkpoint(&self) -> AppResult<()> {
        if self.token.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        Ok(())
    }

    pub fn set_progress(&self, progress: f64) {
        if let Some(mut conn) = self.services().db.get().log_warn() {
            tasks::set_progress(&mut conn, self.task.id, progress)
                .log_warn_with_msg("failed to record task progress");
        }
    }
}

/// Result payload of `video_slice`, consumed by `file_embed_video` and
/// `thumbnail_generate` through the dependency edge.
#[derive(Debug, Serialize, Deserialize)]
pub struct SlicePlan {
    pub duration: f64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub short: bool,
    pub truncated_after: Option<f64>,
    pub spans: Vec<SegmentSpan>,
}

/// Result payload of `audio_segment`, consumed by `file_embed_audio`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AudioPlan {
    pub duration: f64,
    pub class: String,
    pub spans: Vec<SegmentSpan>,
}

pub fn run(ctx: &TaskCtx) -> AppResult<Option<String>> {
    ctx.checkpoint()?;
    match ctx.task.kind {
        // Bootstrap kinds normally run synchronously at startup and are
        // only dispatched when explicitly re-enqueued as health probes.
        TaskKind::ConfigLoad | TaskKind::DatabaseInit | TaskKind::VectorStoreInit => {
            Ok(Some("ok".to_owned()))
        }
        TaskKind::FileScan => file_scan(ctx),
        TaskKind::VideoSlice => video_slice(ctx),
        TaskKind::FileEmbedImage => file_embed_image(ctx),
        TaskKind::FileEmbedText => file_embed_text(ctx),
        TaskKind::FileEmbedVideo => file_embed_video(ctx),
        TaskKind::AudioSegment => audio_segment(ctx),
        TaskKind::FileEmbedAudio => file_embed_audio(ctx),
        TaskKind::ThumbnailGenerate => thumbnail_generate(ctx),
        TaskKind::PreviewGenerate => preview_generate(ctx),
        TaskKind::FilePurge => file_purge(ctx),
        TaskKind::Search | TaskKind::SearchMultimodal => search_retrieve(ctx),
        TaskKind::FilterResults => search_filter(ctx),
        TaskKind::RankResults => search_rank(ctx),
    }
}

fn target_path(ctx: &TaskCtx) -> AppResult<PathBuf> {
    ctx.task
        .target
        .as_ref()
        .map(PathBuf::from)
        .ok_or_else(|| AppError::Integrity(format!("task {} has no target", ctx.task.id)))
}

fn task_file(ctx: &TaskCtx, conn: Connection) -> AppResult<FileRow> {
    let file_id = ctx.task.file_id.ok_or_else(|| {
        AppError::Integrity(format!("task {} is not bound to a file", ctx.task.id))
    })?;
    files::file_row(conn, file_id)
}

/// First still-existing path of a file; bindings can go stale between
/// enqueue and dispatch.
fn primary_path(conn: Connection, file_id: i64) -> AppResult<PathBuf> {
    let paths = files::paths_for(conn, file_id)?;
    paths
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
        .ok_or_else(|| AppError::NotFound(format!("no live path for file {file_id}")))
}

fn dependency_payload<T: for<'de> Deserialize<'de>>(
    ctx: &TaskCtx,
    conn: Connection,
    kind: TaskKind,
) -> AppResult<T> {
    let results = tasks::dependency_results(conn, ctx.task.id)?;
    let raw = results
        .into_iter()
        .filter(|(k, _)| *k == kind)
        .filter_map(|(_, result)| result)
        .next_back()
        .ok_or_else(|| {
            AppError::Integrity(format!(
                "task {} is missing its {} dependency result",
                ctx.task.id,
                kind.name()
            ))
        })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Drops previously committed segments, bindings and vectors for a file so
/// a retried embed starts from a clean slate.
fn remove_existing_vectors(ctx: &TaskCtx, conn: Connection, file_id: i64) -> AppResult<()> {
    let removed = segments::clear_file_index(conn, file_id)?;
    for (modality, ids) in removed.into_iter().into_group_map() {
        if let Ok(collection) = ctx.services().vectors.collection(modality) {
            collection.delete(&ids)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// scan

/// Hash, dedupe, filter and fan out the per-modality pipeline. This is the
/// entry task of every file group; it carries no pipeline lock because the
/// digest is unknown until it has hashed the bytes.
fn file_scan(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let path = target_path(ctx)?;
    if !path.exists() {
        return Ok(Some("path vanished before scan".to_owned()));
    }
    let Some(modality) = Modality::from_path(&path) else {
        return Ok(Some("not an indexable file type".to_owned()));
    };

    let digest = scanner::hash_file(&path)?;
    ctx.checkpoint()?;

    let metadata = std::fs::metadata(&path)?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    let mut conn = services.db.get()?;
    let outcome = files::upsert_file(&mut conn, digest, &path, mtime, metadata.len(), modality)?;

    // The path previously carried different bytes; purge the old identity
    // once nothing references it anymore.
    if let Some(old_id) = outcome.rebound_from {
        if files::ref_count(&mut conn, old_id)? == 0 {
            let old = files::file_row(&mut conn, old_id)?;
            ingest::enqueue_purge(
                ctx.engine,
                old.digest,
                old_id,
                services.config.tasks.max_attempts,
            )?;
        }
    }

    let row = files::file_row(&mut conn, outcome.file_id)?;
    match row.state {
        FileState::Indexed | FileState::Processing => {
            // Known content: the new path is attached, nothing to re-embed.
            return Ok(Some(scan_result(&digest, "deduplicated")));
        }
        FileState::Skipped | FileState::Failed => {
            // Terminal states only leave through an explicit requeue.
            return Ok(Some(scan_result(&digest, row.state.name())));
        }
        FileState::Pending => {}
    }

    let verdict = apply_noise_filter(services, &path, modality, metadata.len())?;
    match verdict {
        crate::media::filter::Verdict::Reject(reason) => {
            info!("skipping {path:?}: {reason}");
            files::mark_file_terminal(&mut conn, row.id, FileState::Skipped, &reason)?;
            Ok(Some(scan_result(&digest, "filtered")))
        }
        crate::media::filter::Verdict::Accept => {
            // Two paths to the same bytes can be scanned concurrently; the
            // compare-and-swap decides which scan owns the pipeline, the
            // loser is a plain dedup.
            if files::transition_file(&mut conn, row.id, FileState::Pending, FileState::Processing)
                .is_err()
            {
                return Ok(Some(scan_result(&digest, "deduplicated")));
            }
            drop(conn);
            ingest::enqueue_pipeline(
                ctx.engine,
                digest,
                row.id,
                modality,
                row.priority_bonus,
                services.config.tasks.max_attempts,
            )?;
            Ok(Some(scan_result(&digest, "accepted")))
        }
    }
}

fn scan_result(digest: &Digest, outcome: &str) -> String {
    serde_json::json!({ "digest": digest.to_hex(), "outcome": outcome }).to_string()
}

fn apply_noise_filter(
    services: &Services,
    path: &Path,
    modality: Modality,
    size: u64,
) -> AppResult<crate::media::filter::Verdict> {
    let filter = &services.filter;
    let verdict = match modality {
        Modality::Image => {
            let probe = services.preprocessor.decoder().probe_image(path)?;
            filter.check_image(&probe, size)
        }
        Modality::Video => {
            let probe = services.preprocessor.decoder().probe_video(path)?;
            filter.check_video(&probe)
        }
        Modality::Audio => {
            let probe = services.preprocessor.audio_loader().probe_audio(path)?;
            filter.check_audio(&probe)
        }
        Modality::Text => {
            let text = read_text(path)?;
            filter.check_text(&text)
        }
    };
    Ok(verdict)
}

/// Plain-text families are read directly; everything else needs an
/// extractor plug-in and is a codec failure without one.
fn read_text(path: &Path) -> AppResult<String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    match ext.as_str() {
        "txt" | "md" | "csv" => Ok(std::fs::read_to_string(path)?),
        other => Err(AppError::Codec(format!(
            "no text extractor available for .{other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// video

fn video_slice(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;
    drop(conn);

    let probe = services.preprocessor.decoder().probe_video(&path)?;
    ctx.checkpoint()?;
    let plan = services.preprocessor.plan_video(&path, &probe, row.size)?;

    let result = SlicePlan {
        duration: probe.duration_s,
        frame_rate: probe.frame_rate,
        width: probe.width,
        height: probe.height,
        short: plan.short,
        truncated_after: plan.truncated_after,
        spans: plan.spans,
    };
    Ok(Some(serde_json::to_string(&result)?))
}

fn file_embed_video(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;
    let plan: SlicePlan = dependency_payload(ctx, &mut conn, TaskKind::VideoSlice)?;

    remove_existing_vectors(ctx, &mut conn, row.id)?;

    let video_collection = services.vectors.collection(Modality::Video)?;
    let max_long_side = services.config.image.max_long_side;
    let total = plan.spans.len().max(1);

    let mut batch = Vec::with_capacity(plan.spans.len());
    for (i, span) in plan.spans.iter().enumerate() {
        ctx.checkpoint()?;
        let timestamps = sample_times(span);
        let frames = services
            .preprocessor
            .decoder()
            .sample_frames(&path, &timestamps, max_long_side)?;
        let vector = services.embedder.embed_video_segment(&frames)?;
        let id = video_collection.allocate_id();
        batch.push((
            id,
            vector,
            crate::vector::VectorPayload {
                digest: row.digest,
                file_id: row.id,
                segment: Some((SegmentKind::Video, span.idx)),
            },
        ));
        ctx.set_progress(0.7 * (i + 1) as f64 / total as f64);
    }

    let video_ids: Vec<i64> = batch.iter().map(|(id, _, _)| *id).collect();
    let outcome = video_collection.upsert(batch)?;
    if let Some((id, reason)) = outcome.failed.first() {
        return Err(AppError::Integrity(format!(
            "vector {id} rejected by video collection: {reason}"
        )));
    }
    debug!("wrote {} video vectors for {}", outcome.written, row.digest.to_hex());

    // The audio track of the same clip lands in the audio collection so
    // audio queries can surface video segments. Skipped for truncated
    // inputs and clips without a decodable track.
    let audio_ids = embed_video_audio_track(ctx, &row, &path, &plan)?;
    ctx.set_progress(0.9);

    let tx = conn.transaction()?;
    for ((span, video_id), audio_id) in plan
        .spans
        .iter()
        .zip(&video_ids)
        .zip(audio_ids.iter().chain(std::iter::repeat(&None)))
    {
        let segment_id = segments::record_segment(&tx, row.id, SegmentKind::Video, span, None)?;
        segments::insert_vector_binding(
            &tx,
            Modality::Video,
            *video_id,
            row.id,
            Some((SegmentKind::Video, segment_id)),
            Some(span),
            Modality::Video,
        )?;
        if let Some(audio_id) = audio_id {
            segments::insert_vector_binding(
                &tx,
                Modality::Audio,
                *audio_id,
                row.id,
                Some((SegmentKind::Video, segment_id)),
                Some(span),
                Modality::Audio,
            )?;
        }
    }
    segments::record_video_metadata(
        &tx,
        row.id,
        &VideoMetadataRow {
            duration: plan.duration,
            frame_rate: plan.frame_rate,
            width: plan.width,
            height: plan.height,
            segment_count: plan.spans.len() as i64,
            short_video: plan.short,
            truncated_after: plan.truncated_after,
        },
    )?;
    tx.commit()?;

    files::transition_file(&mut conn, row.id, FileState::Processing, FileState::Indexed)?;
    Ok(Some(
        serde_json::json!({ "segments": plan.spans.len() }).to_string(),
    ))
}

/// Uniformly spaced sample points strictly inside the span.
fn sample_times(span: &SegmentSpan) -> Vec<f64> {
    let len = span.duration();
    (1..=FRAMES_PER_SEGMENT)
        .map(|i| span.start_s + len * i as f64 / (FRAMES_PER_SEGMENT + 1) as f64)
        .collect()
}

/// Per-segment audio-track embeddings for a video file. Returns one entry
/// per span (None when the track is unusable) already written to the audio
/// collection.
fn embed_video_audio_track(
    ctx: &TaskCtx,
    row: &FileRow,
    path: &Path,
    plan: &SlicePlan,
) -> AppResult<Vec<Option<i64>>> {
    let services = ctx.services();
    if plan.truncated_after.is_some() || !services.embedder.is_ready(Modality::Audio) {
        return Ok(vec![None; plan.spans.len()]);
    }
    let Ok(waveform) = services.preprocessor.load_audio(path) else {
        debug!("no decodable audio track in {path:?}");
        return Ok(vec![None; plan.spans.len()]);
    };

    let audio_collection = services.vectors.collection(Modality::Audio)?;
    let rate = waveform.sample_rate as f64;
    let mut batch = Vec::new();
    let mut ids = Vec::with_capacity(plan.spans.len());

    for span in &plan.spans {
        ctx.checkpoint()?;
        let from = (span.start_s * rate) as usize;
        let to = ((span.end_s * rate) as usize).min(waveform.samples.len());
        if from >= to {
            ids.push(None);
            continue;
        }
        let slice = crate::media::Waveform {
            sample_rate: waveform.sample_rate,
            samples: waveform.samples[from..to].to_vec(),
        };
        let vector = services.embedder.embed_audio(&slice)?;
        let id = audio_collection.allocate_id();
        batch.push((
            id,
            vector,
            crate::vector::VectorPayload {
                digest: row.digest,
                file_id: row.id,
                segment: Some((SegmentKind::Video, span.idx)),
            },
        ));
        ids.push(Some(id));
    }

    if !batch.is_empty() {
        let outcome = audio_collection.upsert(batch)?;
        if let Some((id, reason)) = outcome.failed.first() {
            return Err(AppError::Integrity(format!(
                "vector {id} rejected by audio collection: {reason}"
            )));
        }
    }
    Ok(ids)
}

// ---------------------------------------------------------------------------
// image and text

fn file_embed_image(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;

    let image = services.preprocessor.decode_image(&path)?;
    ctx.checkpoint()?;
    let vector = services.embedder.embed_image(&image)?;

    commit_single_vector(ctx, &mut conn, &row, Modality::Image, vector)
}

fn file_embed_text(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;

    let text = read_text(&path)?;
    ctx.checkpoint()?;
    let vector = services.embedder.embed_text(&text)?;

    commit_single_vector(ctx, &mut conn, &row, Modality::Text, vector)
}

/// Two-phase commit for segment-less files: vector first, then the binding
/// in one metadata transaction, then the state transition.
fn commit_single_vector(
    ctx: &TaskCtx,
    conn: Connection,
    row: &FileRow,
    collection_modality: Modality,
    vector: Vec<f32>,
) -> AppResult<Option<String>> {
    remove_existing_vectors(ctx, conn, row.id)?;

    let collection = ctx.services().vectors.collection(collection_modality)?;
    let id = collection.allocate_id();
    let outcome = collection.upsert(vec![(
        id,
        vector,
        crate::vector::VectorPayload {
            digest: row.digest,
            file_id: row.id,
            segment: None,
        },
    )])?;
    if let Some((id, reason)) = outcome.failed.first() {
        return Err(AppError::Integrity(format!(
            "vector {id} rejected by {} collection: {reason}",
            collection_modality.name()
        )));
    }

    let tx = conn.transaction()?;
    segments::insert_vector_binding(
        &tx,
        collection_modality,
        id,
        row.id,
        None,
        None,
        collection_modality,
    )?;
    tx.commit()?;

    files::transition_file(conn, row.id, FileState::Processing, FileState::Indexed)?;
    Ok(Some(serde_json::json!({ "vector_id": id }).to_string()))
}

// ---------------------------------------------------------------------------
// audio

fn audio_segment(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;

    let probe = services.preprocessor.audio_loader().probe_audio(&path)?;
    ctx.checkpoint()?;
    let waveform = services.preprocessor.load_audio(&path)?;
    let class = Preprocessor::classify_audio(&waveform);
    ctx.checkpoint()?;

    // Resampled artifact, cached by (digest, tag); a hit skips the work.
    // A cache row whose artifact vanished is just a miss to recompute.
    // The pin keeps the maintenance sweep away until this task is done.
    let tag = services.preprocessor.audio_artifact_tag();
    let artifact_present = cache::touch(&mut conn, row.digest, &tag)?.is_some()
        && services.content.exists(row.digest, &tag);
    if !artifact_present {
        let staged = services.content.stage(row.digest, &tag)?;
        match services.preprocessor.transcode_audio(&path, &staged.temp) {
            Ok(()) => {
                let artifact = staged.commit()?;
                let size = std::fs::metadata(&artifact)?.len();
                cache::note_entry(&mut conn, row.digest, &tag, &artifact, size, None)?;
            }
            Err(e) => {
                staged.abort();
                return Err(e);
            }
        }
    }
    cache::pin(&mut conn, row.digest, &tag)?;

    let plan = AudioPlan {
        duration: probe.duration_s,
        class: class.name().to_owned(),
        spans: services.preprocessor.plan_audio(probe.duration_s),
    };
    let result = serde_json::to_string(&plan)?;
    cache::unpin(&mut conn, row.digest, &tag)?;
    Ok(Some(result))
}

fn file_embed_audio(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;
    let plan: AudioPlan = dependency_payload(ctx, &mut conn, TaskKind::AudioSegment)?;

    let waveform = services.preprocessor.load_audio(&path)?;
    remove_existing_vectors(ctx, &mut conn, row.id)?;

    let collection = services.vectors.collection(Modality::Audio)?;
    let rate = waveform.sample_rate as f64;
    let total = plan.spans.len().max(1);
    let mut batch = Vec::with_capacity(plan.spans.len());

    for (i, span) in plan.spans.iter().enumerate() {
        ctx.checkpoint()?;
        let from = (span.start_s * rate) as usize;
        let to = ((span.end_s * rate) as usize).min(waveform.samples.len());
        if from >= to {
            continue;
        }
        let slice = crate::media::Waveform {
            sample_rate: waveform.sample_rate,
            samples: waveform.samples[from..to].to_vec(),
        };
        let vector = services.embedder.embed_audio(&slice)?;
        let id = collection.allocate_id();
        batch.push((
            id,
            vector,
            crate::vector::VectorPayload {
                digest: row.digest,
                file_id: row.id,
                segment: Some((SegmentKind::Audio, span.idx)),
            },
        ));
        ctx.set_progress(0.8 * (i + 1) as f64 / total as f64);
    }

    let ids: Vec<i64> = batch.iter().map(|(id, _, _)| *id).collect();
    let spans_written: Vec<SegmentSpan> = plan
        .spans
        .iter()
        .filter(|span| {
            let from = (span.start_s * rate) as usize;
            from < ((span.end_s * rate) as usize).min(waveform.samples.len())
        })
        .cloned()
        .collect();

    let outcome = collection.upsert(batch)?;
    if let Some((id, reason)) = outcome.failed.first() {
        return Err(AppError::Integrity(format!(
            "vector {id} rejected by audio collection: {reason}"
        )));
    }

    let tx = conn.transaction()?;
    for (span, id) in spans_written.iter().zip(&ids) {
        let segment_id =
            segments::record_segment(&tx, row.id, SegmentKind::Audio, span, Some(&plan.class))?;
        segments::insert_vector_binding(
            &tx,
            Modality::Audio,
            *id,
            row.id,
            Some((SegmentKind::Audio, segment_id)),
            Some(span),
            Modality::Audio,
        )?;
    }
    tx.commit()?;

    files::transition_file(&mut conn, row.id, FileState::Processing, FileState::Indexed)?;
    Ok(Some(
        serde_json::json!({ "segments": spans_written.len(), "class": plan.class }).to_string(),
    ))
}

// ---------------------------------------------------------------------------
// thumbnails and previews

fn thumbnail_generate(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;

    let at = match row.modality {
        Modality::Image => None,
        Modality::Video => {
            // The slice dependency tells us where the first segment sits.
            let plan: SlicePlan = dependency_payload(ctx, &mut conn, TaskKind::VideoSlice)?;
            Some(
                plan.spans
                    .first()
                    .map(|span| (span.start_s + span.end_s) / 2.0)
                    .unwrap_or_default(),
            )
        }
        Modality::Audio | Modality::Text => {
            return Ok(Some("no thumbnail for this modality".to_owned()))
        }
    };
    drop(conn);

    let bytes = services.preprocessor.thumbnail(&path, at)?;
    ctx.checkpoint()?;

    let dir = services.thumbs_dir.join(row.digest.shard());
    std::fs::create_dir_all(&dir)?;
    let dest = dir.join(format!("{}.jpg", row.digest.to_hex()));
    let temp = dir.join(format!(".{}.tmp", row.digest.to_hex()));
    std::fs::write(&temp, &bytes)?;
    std::fs::rename(&temp, &dest)?;

    Ok(Some(dest.to_string_lossy().into_owned()))
}

/// Larger rendition kept in the content store for hover previews.
fn preview_generate(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;
    let row = task_file(ctx, &mut conn)?;
    let path = primary_path(&mut conn, row.id)?;

    let at = match row.modality {
        Modality::Image => None,
        Modality::Video => {
            // Prefer what the index already knows over another probe.
            let spans = segments::video_segments(&mut conn, row.id)?;
            let mid = match spans.first() {
                Some(span) => (span.start_s + span.end_s) / 2.0,
                None => match segments::video_metadata(&mut conn, row.id)? {
                    Some(meta) => meta.duration / 2.0,
                    None => {
                        services.preprocessor.decoder().probe_video(&path)?.duration_s / 2.0
                    }
                },
            };
            Some(mid)
        }
        Modality::Audio | Modality::Text => {
            return Ok(Some("no preview for this modality".to_owned()))
        }
    };

    let size = services.config.image.thumb_size * 2;
    let tag = format!("preview_{size}x{size}");
    if let Some(existing) = cache::touch(&mut conn, row.digest, &tag)? {
        // Artifact loss only costs recomputation; fall through on a miss.
        if services.content.get(row.digest, &tag)?.is_some() {
            return Ok(Some(existing.to_string_lossy().into_owned()));
        }
    }

    let bytes = services
        .preprocessor
        .decoder()
        .thumbnail(&path, at, size)?;
    ctx.checkpoint()?;
    let artifact = services.content.put(row.digest, &tag, &bytes)?;
    cache::note_entry(&mut conn, row.digest, &tag, &artifact, bytes.len() as u64, None)?;
    Ok(Some(artifact.to_string_lossy().into_owned()))
}

// ---------------------------------------------------------------------------
// purge

fn file_purge(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let services = ctx.services();
    let mut conn = services.db.get()?;

    // The file-id binding is severed if the row vanished already; the
    // digest in the target still finds it.
    let row = match ctx.task.file_id {
        Some(file_id) => files::file_row(&mut conn, file_id).ok(),
        None => {
            let digest = ctx
                .task
                .pipeline_group
                .ok_or_else(|| AppError::Integrity("purge task without digest".to_owned()))?;
            files::file_by_digest(&mut conn, digest)?
        }
    };
    let Some(row) = row else {
        return Ok(Some("purge target already gone".to_owned()));
    };
    let file_id = row.id;

    // The path may have come back between enqueue and dispatch.
    if files::ref_count(&mut conn, file_id)? > 0 {
        return Ok(Some("file is referenced again, purge skipped".to_owned()));
    }

    remove_existing_vectors(ctx, &mut conn, file_id)?;

    for entry in cache::entries_for(&mut conn, row.digest)? {
        cache::remove_entry(&mut conn, row.digest, &entry.tag)?;
    }
    services.content.delete_all(row.digest)?;

    let thumb = services
        .thumbs_dir
        .join(row.digest.shard())
        .join(format!("{}.jpg", row.digest.to_hex()));
    if thumb.exists() {
        std::fs::remove_file(&thumb)?;
    }

    files::delete_file(&mut conn, file_id)?;
    info!("purged {} ({})", row.digest.to_hex(), row.modality.name());
    Ok(Some("purged".to_owned()))
}

// ---------------------------------------------------------------------------
// search as tasks

fn search_query(ctx: &TaskCtx) -> AppResult<SearchQuery> {
    let raw = ctx.task.target.as_ref().ok_or_else(|| {
        AppError::Integrity(format!("search task {} has no query", ctx.task.id))
    })?;
    Ok(serde_json::from_str(raw)?)
}

fn search_retrieve(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let query = search_query(ctx)?;
    let retrieved = search::retrieve(ctx.services(), &query)?;
    Ok(Some(serde_json::to_string(&retrieved)?))
}

fn search_filter(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let query = search_query(ctx)?;
    let mut conn = ctx.services().db.get()?;
    let retrieved: RetrievedSet = dependency_payload(ctx, &mut conn, TaskKind::Search)
        .or_else(|_| dependency_payload(ctx, &mut conn, TaskKind::SearchMultimodal))?;
    drop(conn);

    let filtered = RetrievedSet {
        hits: search::filter_hits(retrieved.hits, &query),
        warnings: retrieved.warnings,
    };
    Ok(Some(serde_json::to_string(&filtered)?))
}

fn search_rank(ctx: &TaskCtx) -> AppResult<Option<String>> {
    let query = search_query(ctx)?;
    let mut conn = ctx.services().db.get()?;
    let retrieved: RetrievedSet = dependency_payload(ctx, &mut conn, TaskKind::FilterResults)
        .or_else(|_| dependency_payload(ctx, &mut conn, TaskKind::Search))
        .or_else(|_| dependency_payload(ctx, &mut conn, TaskKind::SearchMultimodal))?;
    drop(conn);

    let results = search::fuse(ctx.services(), retrieved.hits);
    let timeline = search::assemble_timeline(&results);
    let mut results = results;
    results.truncate(query.k);

    let response = SearchResponse {
        results,
        timeline,
        warnings: retrieved.warnings,
    };
    Ok(Some(serde_json::to_string(&response)?))
}
