use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use notify::{
    event::{ModifyKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use tracing::{debug, info, warn};

use crate::{
    scanner::{ChangeEvent, Scanner},
    state::{AppError, AppResult, Shutdown},
    utils::{HandleErr, Ignore},
};

/// Flush poll interval; actual emission waits for each path's quiet
/// window.
const FLUSH_TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Created,
    Modified,
    Removed,
}

struct Pending {
    kind: PendingKind,
    deadline: Instant,
}

/// Per-path debouncing with burst coalescing. Editor save dances (write
/// temp, rename over) collapse into one change per path once the quiet
/// window passes; renames flush immediately since they are already
/// atomic observations.
pub(crate) struct Debouncer {
    quiet: Duration,
    batch: usize,
    pending: HashMap<PathBuf, Pending>,
    moves: Vec<ChangeEvent>,
}

impl Debouncer {
    pub(crate) fn new(quiet: Duration, batch: usize) -> Self {
        Self {
            quiet,
            batch,
            pending: HashMap::new(),
            moves: Vec::new(),
        }
    }

    pub(crate) fn note(&mut self, event: &notify::Event) {
        match &event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.push(path.clone(), PendingKind::Created);
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.push(path.clone(), PendingKind::Removed);
                }
            }
            EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
                (RenameMode::Both, [from, to]) => {
                    self.pending.remove(from);
                    self.pending.remove(to);
                    self.moves.push(ChangeEvent::Moved {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
                (RenameMode::From, [from]) => self.push(from.clone(), PendingKind::Removed),
                (RenameMode::To, [to]) => self.push(to.clone(), PendingKind::Created),
                _ => {
                    for path in &event.paths {
                        self.push(path.clone(), PendingKind::Modified);
                    }
                }
            },
            EventKind::Modify(_) => {
                for path in &event.paths {
                    self.push(path.clone(), PendingKind::Modified);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }

    fn push(&mut self, path: PathBuf, kind: PendingKind) {
        let deadline = Instant::now() + self.quiet;
        let entry = self.pending.entry(path).or_insert(Pending { kind, deadline });
        entry.deadline = deadline;
        entry.kind = match (entry.kind, kind) {
            // A deletion wins over anything queued before it.
            (_, PendingKind::Removed) => PendingKind::Removed,
            // Created followed by writes is still a creation.
            (PendingKind::Created, PendingKind::Modified) => PendingKind::Created,
            // Removed then recreated means the content changed.
            (PendingKind::Removed, PendingKind::Created) => PendingKind::Modified,
            (_, new) => new,
        };
    }

    /// Emits every change whose quiet window elapsed, up to the batch
    /// size; pending moves always go first.
    pub(crate) fn drain_due(&mut self, now: Instant) -> Vec<ChangeEvent> {
        let mut out: Vec<ChangeEvent> = self.moves.drain(..).collect();

        let mut due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        due.sort();

        for path in due.into_iter().take(self.batch.saturating_sub(out.len())) {
            let pending = self.pending.remove(&path).expect("path was just listed");
            out.push(match pending.kind {
                PendingKind::Created => ChangeEvent::Created(path),
                PendingKind::Modified => ChangeEvent::Modified(path),
                PendingKind::Removed => ChangeEvent::Removed(path),
            });
        }
        out
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Live filesystem monitor: a notify watcher feeding the debouncer, with
/// batches applied through the scanner on a blocking worker.
pub struct WatchHandle {
    watcher: Mutex<RecommendedWatcher>,
    task: tokio::task::JoinHandle<()>,
}

impl WatchHandle {
    pub fn spawn(scanner: Arc<Scanner>, roots: &[PathBuf], quiet: Duration, batch: usize, shutdown: Shutdown) -> AppResult<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Send failures only happen at shutdown when the loop is gone.
            tx.send(res).ignore();
        })
        .map_err(watch_error)?;

        for root in roots {
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => info!("watching {root:?}"),
                Err(e) => warn!("cannot watch {root:?}: {e}"),
            }
        }

        let task = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(quiet, batch);
            let mut tick = tokio::time::interval(FLUSH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(Ok(event)) => debouncer.note(&event),
                        Some(Err(e)) => warn!("watch error: {e}"),
                        None => break,
                    },
                    _ = tick.tick() => {
                        let due = debouncer.drain_due(Instant::now());
                        if due.is_empty() {
                            continue;
                        }
                        debug!("dispatching {} filesystem changes", due.len());
                        let scanner = scanner.clone();
                        let join = tokio::task::spawn_blocking(move || {
                            for event in due {
                                scanner
                                    .apply_event(event)
                                    .log_warn_with_msg("failed to apply filesystem event");
                            }
                        })
                        .await;
                        join.log_warn_with_msg("event batch worker panicked");
                    }
                }
            }
            debug!("watch loop stopped");
        });

        Ok(Self {
            watcher: Mutex::new(watcher),
            task,
        })
    }

    /// Hot path for `index_path`: starts watching a new root immediately.
    pub fn watch_root(&self, root: &Path) -> AppResult<()> {
        self.watcher
            .lock()
            .expect("watcher lock poisoned")
            .watch(root, RecursiveMode::Recursive)
            .map_err(watch_error)?;
        info!("watching {root:?}");
        Ok(())
    }

    pub fn unwatch_root(&self, root: &Path) -> AppResult<()> {
        self.watcher
            .lock()
            .expect("watcher lock poisoned")
            .unwatch(root)
            .map_err(watch_error)?;
        info!("stopped watching {root:?}");
        Ok(())
    }

    pub async fn stop(self) {
        // Dropping the watcher closes the event channel; the loop then
        // exits on its own, but shutdown has usually fired already.
        drop(self.watcher);
        self.task
            .await
            .log_warn_with_msg("watch loop ended abnormally");
    }
}

fn watch_error(e: notify::Error) -> AppError {
    AppError::Io(std::io::Error::other(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut event = notify::Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    #[test]
    fn bursts_coalesce_per_path() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500), 100);
        let create = EventKind::Create(notify::event::CreateKind::File);
        let modify = EventKind::Modify(ModifyKind::Data(notify::event::DataChange::Any));

        debouncer.note(&event(create, &["/tree/a.jpg"]));
        debouncer.note(&event(modify, &["/tree/a.jpg"]));
        debouncer.note(&event(modify, &["/tree/a.jpg"]));
        assert_eq!(debouncer.pending_len(), 1);

        // Nothing flushes before the quiet window.
        assert!(debouncer.drain_due(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_millis(600);
        let events = debouncer.drain_due(later);
        assert_eq!(events, vec![ChangeEvent::Created(PathBuf::from("/tree/a.jpg"))]);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[test]
    fn removal_wins_and_replacement_becomes_modify() {
        let mut debouncer = Debouncer::new(Duration::from_millis(10), 100);
        let create = EventKind::Create(notify::event::CreateKind::File);
        let remove = EventKind::Remove(notify::event::RemoveKind::File);

        debouncer.note(&event(create, &["/x"]));
        debouncer.note(&event(remove, &["/x"]));
        debouncer.note(&event(create, &["/x"]));

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(
            debouncer.drain_due(later),
            vec![ChangeEvent::Modified(PathBuf::from("/x"))]
        );
    }

    #[test]
    fn renames_flush_immediately_as_moves() {
        let mut debouncer = Debouncer::new(Duration::from_millis(500), 100);
        let rename = EventKind::Modify(ModifyKind::Name(RenameMode::Both));

        debouncer.note(&event(rename, &["/old.mp4", "/new.mp4"]));
        let events = debouncer.drain_due(Instant::now());
        assert_eq!(
            events,
            vec![ChangeEvent::Moved {
                from: PathBuf::from("/old.mp4"),
                to: PathBuf::from("/new.mp4"),
            }]
        );
    }

    #[test]
    fn batches_are_bounded() {
        let mut debouncer = Debouncer::new(Duration::from_millis(1), 3);
        let create = EventKind::Create(notify::event::CreateKind::File);
        for i in 0..10 {
            debouncer.note(&event(create, &[&format!("/f{i}.jpg")]));
        }

        let later = Instant::now() + Duration::from_millis(50);
        assert_eq!(debouncer.drain_due(later).len(), 3);
        assert_eq!(debouncer.drain_due(later).len(), 3);
        assert_eq!(debouncer.drain_due(later).len(), 3);
        assert_eq!(debouncer.drain_due(later).len(), 1);
        assert!(debouncer.drain_due(later).is_empty());
    }
}
