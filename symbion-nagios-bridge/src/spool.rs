//! Spool directory consumption
//!
//! The monitoring side drops one JSON check result per file. Only a finished
//! file is picked up: either closed after writing or renamed into the
//! directory. Each file is read, decoded, published and then removed, whether
//! or not the broker was reachable.

use crate::connection::{ConnectionManager, Delivery};
use crate::event;
use crate::topic;
use crate::transport::Connector;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("cannot watch spool directory: {0}")]
    Watch(#[from] notify::Error),
    #[error("spool I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spool watcher stopped")]
    WatchClosed,
}

/// Non-recursive watch on the spool directory.
pub struct SpoolWatcher {
    directory: PathBuf,
    _watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    pending: VecDeque<PathBuf>,
}

impl SpoolWatcher {
    pub fn watch(directory: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let directory = directory.into();
        let (tx, events) = mpsc::unbounded_channel();

        // runs on notify's own thread
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(&directory, RecursiveMode::NonRecursive)?;
        info!("Watching spool directory {}", directory.display());

        Ok(Self {
            directory,
            _watcher: watcher,
            events,
            pending: VecDeque::new(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Next finished file, in arrival order. Cancel safe.
    pub async fn next_arrival(&mut self) -> Result<PathBuf, SpoolError> {
        loop {
            if let Some(path) = self.pending.pop_front() {
                return Ok(path);
            }
            match self.events.recv().await {
                Some(Ok(event)) if event.need_rescan() => warn!(
                    "Spool watch lost events (queue overflow), files in {} may be left \
                     behind until a startup sweep",
                    self.directory.display()
                ),
                Some(Ok(event)) => self.pending.extend(arrived_paths(&event)),
                Some(Err(e)) => warn!("Spool watcher error: {}", e),
                None => return Err(SpoolError::WatchClosed),
            }
        }
    }
}

/// Paths made available by `event`: close-after-write or moved-in only.
pub fn arrived_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        _ => Vec::new(),
    }
}

/// Regular files already in `directory`, sorted by name.
pub async fn existing_files(directory: &Path) -> Result<Vec<PathBuf>, SpoolError> {
    let mut entries = tokio::fs::read_dir(directory).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Decoded and handed to the connection manager; the file is gone
    Published { topic: String, delivery: Delivery },
    /// Removed, or moved to quarantine
    Undecodable,
    /// Already gone when we tried to read it
    Vanished,
    /// Could not be read; left in place
    Unreadable,
}

pub struct SpoolProcessor {
    base_topic: String,
    quarantine: Option<PathBuf>,
}

impl SpoolProcessor {
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self {
            base_topic: base_topic.into(),
            quarantine: None,
        }
    }

    pub fn with_quarantine(mut self, directory: Option<PathBuf>) -> Self {
        self.quarantine = directory;
        self
    }

    pub async fn process<C: Connector>(
        &self,
        path: &Path,
        manager: &mut ConnectionManager<C>,
    ) -> Outcome {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Spool file {} vanished before it was read", path.display());
                return Outcome::Vanished;
            }
            Err(e) => {
                error!("Cannot read spool file {}: {}", path.display(), e);
                return Outcome::Unreadable;
            }
        };

        let encoded = event::decode(&raw).and_then(|check| {
            let payload = check.encode()?;
            Ok((topic::check_topic(&self.base_topic, &check), payload))
        });

        let (topic, payload) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Discarding {}: {}", path.display(), e);
                self.dispose_undecodable(path).await;
                return Outcome::Undecodable;
            }
        };

        let delivery = manager.publish(&topic, payload).await;
        debug!("{} -> {} ({:?})", path.display(), topic, delivery);
        remove(path).await;

        Outcome::Published { topic, delivery }
    }

    async fn dispose_undecodable(&self, path: &Path) {
        let (Some(quarantine), Some(name)) = (&self.quarantine, path.file_name()) else {
            remove(path).await;
            return;
        };

        let target = quarantine.join(name);
        let moved = async {
            tokio::fs::create_dir_all(quarantine).await?;
            tokio::fs::rename(path, &target).await
        };
        match moved.await {
            Ok(()) => info!("Quarantined {} to {}", path.display(), target.display()),
            Err(e) => {
                warn!("Cannot quarantine {}: {}", path.display(), e);
                remove(path).await;
            }
        }
    }
}

async fn remove(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Cannot remove spool file {}: {}", path.display(), e),
    }
}
