use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use tracing::{debug, error, info_span, warn};

use crate::{
    state::{AppError, AppResult},
    store::{files, tasks, tasks::TaskKind, tasks::TaskRow, tasks::WorkerPool, FileState},
    tasks::{handlers, handlers::TaskCtx, TaskEngine},
    utils::{now_secs, HandleErr},
};

/// One pool thread: claim, execute, record, repeat. Claims go through the
/// single-transaction dispatch query, so workers across pools never race
/// on the same row.
pub(crate) fn worker_loop(engine: Arc<TaskEngine>, pool: WorkerPool) {
    debug!("{} worker up", pool.name());
    while !engine.shutdown_handle().is_shutdown() {
        let claimed = claim(&engine, pool);
        match claimed {
            Ok(Some(task)) => execute(&engine, task, pool),
            Ok(None) => engine.idle_wait(),
            Err(e) => {
                warn!("task claim failed: {e}");
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
    debug!("{} worker down", pool.name());
}

fn claim(engine: &TaskEngine, pool: WorkerPool) -> AppResult<Option<TaskRow>> {
    let mut conn = engine.services().db.get()?;
    tasks::next_task(&mut conn, pool, engine.caps(), now_secs())
}

fn execute(engine: &TaskEngine, task: TaskRow, pool: WorkerPool) {
    let span = info_span!("task", id = task.id, kind = task.kind.name());
    let _enter = span.enter();

    let token = engine.register_running(task.id, task.kind, pool);
    let ctx = TaskCtx {
        engine,
        task: &task,
        token: &token,
    };

    // A panicking handler must not take the worker thread down with it;
    // the panic is recorded as a permanent failure on the task.
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handlers::run(&ctx)))
        .unwrap_or_else(|panic| {
            let message = panic
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| panic.downcast_ref::<&str>().map(|s| (*s).to_owned()))
                .unwrap_or_else(|| "task handler panicked".to_owned());
            error!("task {} panicked: {message}", task.id);
            Err(AppError::Integrity(message))
        });

    engine.unregister_running(task.id);
    finish(engine, &task, result);
}

fn finish(engine: &TaskEngine, task: &TaskRow, result: AppResult<Option<String>>) {
    let Some(mut conn) = engine
        .services()
        .db
        .get()
        .log_err_with_msg("cannot record task outcome")
    else {
        return;
    };

    match result {
        Ok(result) => {
            debug!("task {} succeeded", task.id);
            tasks::complete_task(&mut conn, task.id, result.as_deref())
                .log_err_with_msg("failed to record task success");
        }
        Err(AppError::Cancelled) => {
            if engine.take_timed_out(task.id) {
                // A timeout is a transient condition: the work is abandoned
                // here but the task goes back through the retry path.
                warn!("task {} abandoned after timeout", task.id);
                tasks::fail_task(&mut conn, task.id, "timed out", true)
                    .log_err_with_msg("failed to record task timeout");
            } else {
                debug!("task {} observed cancellation", task.id);
                tasks::finalize_cancelled(&mut conn, task.id)
                    .log_err_with_msg("failed to record task cancellation");
            }
        }
        Err(e) => {
            let retryable = e.is_retryable();
            let message = e.to_string();
            warn!("task {} failed ({}retryable): {message}", task.id, if retryable { "" } else { "not " });

            let requeued = tasks::fail_task(&mut conn, task.id, &message, retryable)
                .log_err_with_msg("failed to record task failure")
                .unwrap_or(false);

            // Permanent failure in the indexing chain lands on the file:
            // codec problems mean "skipped", everything else "failed".
            if !requeued && affects_file_state(task.kind) {
                if let Some(file_id) = task.file_id {
                    let state = match e {
                        AppError::Codec(_) => FileState::Skipped,
                        _ => FileState::Failed,
                    };
                    files::mark_file_terminal(&mut conn, file_id, state, &message)
                        .log_warn_with_msg("failed to record file failure");
                }
            }
        }
    }
}

fn affects_file_state(kind: TaskKind) -> bool {
    matches!(
        kind,
        TaskKind::FileScan
            | TaskKind::VideoSlice
            | TaskKind::FileEmbedVideo
            | TaskKind::FileEmbedImage
            | TaskKind::FileEmbedText
            | TaskKind::AudioSegment
            | TaskKind::FileEmbedAudio
    )
}
