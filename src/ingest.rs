use tracing::debug;

use crate::{
    state::AppResult,
    store::{tasks::NewTask, tasks::TaskKind, Digest, Modality},
    tasks::TaskEngine,
};

/// Builds the persistent task group that carries one file from accepted to
/// indexed. Each step is its own durable task with explicit dependency
/// edges; the pipeline-group digest keeps at most one of them running, so
/// the chain is serializable per file while distinct files proceed in
/// parallel.
///
/// The group shapes are:
///   image: file_embed_image -> thumbnail_generate
///   video: video_slice -> {file_embed_video, thumbnail_generate, preview_generate}
///   audio: audio_segment -> file_embed_audio
///   text:  file_embed_text
pub fn enqueue_pipeline(
    engine: &TaskEngine,
    digest: Digest,
    file_id: i64,
    modality: Modality,
    file_bonus: i64,
    max_attempts: u32,
) -> AppResult<Vec<i64>> {
    let hex = digest.to_hex();
    let task = |kind: TaskKind| {
        let mut task = NewTask::for_file(kind, digest, file_id, hex.clone(), max_attempts);
        task.file_bonus = file_bonus;
        task
    };

    let mut ids = Vec::new();
    match modality {
        Modality::Image => {
            let embed = engine.enqueue_unchecked(task(TaskKind::FileEmbedImage))?;
            let thumb = engine
                .enqueue_unchecked(task(TaskKind::ThumbnailGenerate).depends_on(&[embed]))?;
            ids.extend([embed, thumb]);
        }
        Modality::Video => {
            let slice = engine.enqueue_unchecked(task(TaskKind::VideoSlice))?;
            let embed =
                engine.enqueue_unchecked(task(TaskKind::FileEmbedVideo).depends_on(&[slice]))?;
            let thumb = engine
                .enqueue_unchecked(task(TaskKind::ThumbnailGenerate).depends_on(&[slice]))?;
            let preview = engine
                .enqueue_unchecked(task(TaskKind::PreviewGenerate).depends_on(&[slice]))?;
            ids.extend([slice, embed, thumb, preview]);
        }
        Modality::Audio => {
            let segment = engine.enqueue_unchecked(task(TaskKind::AudioSegment))?;
            let embed =
                engine.enqueue_unchecked(task(TaskKind::FileEmbedAudio).depends_on(&[segment]))?;
            ids.extend([segment, embed]);
        }
        Modality::Text => {
            ids.push(engine.enqueue_unchecked(task(TaskKind::FileEmbedText))?);
        }
    }

    debug!(
        "enqueued {} pipeline ({} tasks) for {}",
        modality.name(),
        ids.len(),
        &hex[..12]
    );
    Ok(ids)
}

/// Purge of an unreferenced file: vectors, bindings, segments, artifacts,
/// thumbnail and finally the file row itself.
pub fn enqueue_purge(
    engine: &TaskEngine,
    digest: Digest,
    file_id: i64,
    max_attempts: u32,
) -> AppResult<i64> {
    engine.enqueue_unchecked(NewTask::for_file(
        TaskKind::FilePurge,
        digest,
        file_id,
        digest.to_hex(),
        max_attempts,
    ))
}
