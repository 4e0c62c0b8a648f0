use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};

use crate::{
    config::ConfigFile,
    engine::{Engine, Plugins},
    search::SearchQuery,
    state::{AppResult, Shutdown},
    store::tasks::{TaskFilter, TaskKind},
    utils::{init_tracing, HandleErr},
};

mod config;
mod content;
mod database;
mod embedding;
mod engine;
mod ingest;
mod media;
mod scanner;
mod search;
mod state;
mod store;
mod tasks;
mod utils;
mod vector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Logging {
    None,
    Info,
    Debug,
    All,
}

#[derive(Parser)]
#[command(
    name = "media_search_engine",
    about = "Cross-modal media search: watches directories, indexes images, videos, audio and text, serves similarity queries"
)]
struct Cli {
    /// Path to the configuration file; a default one is written if absent.
    #[arg(long, default_value = "msearch.toml")]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = Logging::Info)]
    log: Logging,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the configured directories and keep the index current
    Run,
    /// Index a file or directory and wait until the queue drains
    Index { path: PathBuf },
    /// Remove a file or directory from the index
    Unindex { path: PathBuf },
    /// Put a failed or skipped file back through the pipeline
    Requeue { path: PathBuf },
    /// Query the index
    Search {
        /// Free-text query
        #[arg(long)]
        text: Option<String>,
        /// Query by example image
        #[arg(long)]
        image: Option<PathBuf>,
        /// Query by example audio clip
        #[arg(long)]
        audio: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        k: usize,
        /// Run through the persistent task queue instead of inline
        #[arg(long)]
        queued: bool,
    },
    /// List recent tasks
    Tasks {
        /// Restrict to one task kind (e.g. file_scan, file_embed_image)
        #[arg(long)]
        kind: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Cancel one task by id, or every queued/running task of a kind
    Cancel {
        #[arg(long)]
        id: Option<i64>,
        #[arg(long)]
        kind: Option<String>,
    },
    /// Report health, store statistics and queue state
    Status {
        /// Also reconcile the vector store against the metadata store
        #[arg(long)]
        check: bool,
    },
    /// Delete the metadata database and vector snapshots
    DeleteDb,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log);

    let code = match run_cli(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run_cli(cli: Cli) -> AppResult<()> {
    let config = ConfigFile::load(&cli.config)?;

    if let Command::DeleteDb = cli.command {
        delete_database(&config);
        return Ok(());
    }

    let engine = Engine::new(config, Plugins::default_stack())?;

    match cli.command {
        Command::Run => {
            tokio::spawn(shutdown_signal(engine.shutdown_handle()));
            engine.run().await?;
        }
        Command::Index { path } => {
            let path = path.canonicalize()?;
            let summary = engine.index_path(&path)?;
            info!(
                "{} files seen, {} scans enqueued, {} stale bindings pruned",
                summary.seen, summary.enqueued, summary.pruned
            );
            engine.run_until_idle()?;
            engine.stop_and_join()?;
            print_status(&engine, false)?;
        }
        Command::Unindex { path } => {
            let path = path.canonicalize().unwrap_or(path);
            let removed = engine.unindex_path(&path)?;
            info!("detached {removed} paths");
            engine.run_until_idle()?;
            engine.stop_and_join()?;
        }
        Command::Requeue { path } => {
            let path = path.canonicalize()?;
            engine.requeue_path(&path)?;
            engine.run_until_idle()?;
            engine.stop_and_join()?;
        }
        Command::Search {
            text,
            image,
            audio,
            k,
            queued,
        } => {
            let query = SearchQuery {
                text,
                image_path: image,
                audio_path: audio,
                k,
                ..SearchQuery::default()
            };
            if queued {
                let task_id = engine.search_async(&query)?;
                engine.run_until_idle()?;
                engine.stop_and_join()?;
                let task = engine.get_task(task_id)?;
                let raw = task.result.ok_or_else(|| {
                    crate::state::AppError::Integrity(format!(
                        "search task {task_id} finished without a result: {}",
                        task.error.unwrap_or_default()
                    ))
                })?;
                let response: serde_json::Value = serde_json::from_str(&raw)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response).expect("response serializes")
                );
            } else {
                // Media legs go through the bytes API, the same surface a
                // remote front-end would use.
                let response = if query.image_path.is_some() || query.audio_path.is_some() {
                    let image_bytes = query.image_path.as_ref().map(std::fs::read).transpose()?;
                    let audio_bytes = query.audio_path.as_ref().map(std::fs::read).transpose()?;
                    engine.search_bytes(query.text.clone(), image_bytes, audio_bytes, k)?
                } else {
                    engine.search(&query)?
                };
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response).expect("response serializes")
                );
            }
        }
        Command::Tasks { kind, limit } => {
            let filter = TaskFilter {
                kind: kind.as_deref().and_then(TaskKind::from_name),
                limit: Some(limit),
                ..TaskFilter::default()
            };
            for task in engine.get_tasks(&filter)? {
                println!(
                    "#{:<6} {:<20} {:<10} p{:<3} {:>3.0}% attempts {}/{} {}",
                    task.id,
                    task.kind.name(),
                    task.status.name(),
                    task.priority,
                    task.progress * 100.0,
                    task.attempts,
                    task.max_attempts,
                    task.error.or(task.target).unwrap_or_default()
                );
            }
        }
        Command::Cancel { id, kind } => {
            if let Some(id) = id {
                let outcome = engine.cancel_task(id)?;
                info!("cancel task {id}: {outcome:?}");
            }
            if let Some(name) = kind {
                let kind = TaskKind::from_name(&name).ok_or_else(|| {
                    crate::state::AppError::NotFound(format!("task kind '{name}'"))
                })?;
                engine.cancel_tasks_by_type(kind)?;
                info!("cancelled queued {name} tasks");
            }
        }
        Command::Status { check } => print_status(&engine, check)?,
        Command::DeleteDb => unreachable!("handled before engine construction"),
    }

    Ok(())
}

fn print_status(engine: &Engine, check: bool) -> AppResult<()> {
    let health = engine.health();
    let pools = engine.get_thread_pool_status();
    let vectors: Vec<_> = engine
        .services()
        .vectors
        .stats()
        .into_iter()
        .map(|(modality, stats)| {
            serde_json::json!({
                "collection": modality.name(),
                "vectors": stats.vectors,
                "dimension": stats.dimension,
            })
        })
        .collect();

    let library = engine.library_stats()?;
    let mut report = serde_json::json!({
        "health": health,
        "pools": pools,
        "collections": vectors,
        "library": library,
    });

    if check {
        let integrity = engine.integrity_check()?;
        report["integrity"] = serde_json::to_value(integrity).expect("report serializes");
        println!(
            "{}",
            serde_json::to_string_pretty(&report).expect("report serializes")
        );
        if !integrity.is_clean() {
            return Err(crate::state::AppError::Integrity(format!(
                "repaired {} orphan vectors and {} dangling bindings",
                integrity.orphan_vectors_removed, integrity.dangling_bindings_removed
            )));
        }
        return Ok(());
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&report).expect("report serializes")
    );

    if !health.is_healthy() {
        return Err(if health.model_ready {
            crate::state::AppError::Integrity("stores are not ready".to_owned())
        } else {
            crate::state::AppError::ModelNotReady("embedding models".to_owned())
        });
    }
    Ok(())
}

fn delete_database(config: &ConfigFile) {
    let db = config.metadata_path();
    std::fs::remove_file(&db).log_warn_with_msg("failed to delete database");
    std::fs::remove_file(db.with_extension("db-journal"))
        .log_warn_with_msg("failed to delete journal");
    std::fs::remove_file(db.with_extension("db-wal")).log_warn_with_msg("failed to delete wal");
    std::fs::remove_file(db.with_extension("db-shm")).log_warn_with_msg("failed to delete shm");
    // Without bindings every vector is an orphan; drop the snapshots too.
    std::fs::remove_dir_all(config.vectors_dir())
        .log_warn_with_msg("failed to delete vector snapshots");
    info!("index state deleted");
}

async fn shutdown_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting to shut down...");
    shutdown.shutdown();
}
