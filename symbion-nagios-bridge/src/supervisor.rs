//! Top-level event loop
//!
//! One task interleaves three sources: spool arrivals, broker events (including
//! the reconnect timer) and the shutdown trigger. Files are processed one at
//! a time in arrival order; the connection manager is never shared. Only the
//! waits race each other, handlers always run to completion.

use crate::connection::{ConnectionManager, ConnectionState};
use crate::spool::{self, SpoolError, SpoolProcessor, SpoolWatcher};
use crate::transport::Connector;
use std::future::Future;
use tracing::{error, info};

pub struct Supervisor<C: Connector> {
    manager: ConnectionManager<C>,
    watcher: SpoolWatcher,
    processor: SpoolProcessor,
    sweep_pending: bool,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(manager: ConnectionManager<C>, watcher: SpoolWatcher, processor: SpoolProcessor) -> Self {
        Self {
            manager,
            watcher,
            processor,
            sweep_pending: false,
        }
    }

    /// Process files already in the spool once the broker first accepts us.
    pub fn with_startup_sweep(mut self, enabled: bool) -> Self {
        self.sweep_pending = enabled;
        self
    }

    pub fn manager(&self) -> &ConnectionManager<C> {
        &self.manager
    }

    /// Runs until `shutdown` completes or the watcher fails, then closes the
    /// broker session cleanly.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), SpoolError>
    where
        F: Future<Output = ()>,
    {
        self.manager.connect();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                arrival = self.watcher.next_arrival() => match arrival {
                    Ok(path) => {
                        self.processor.process(&path, &mut self.manager).await;
                    }
                    Err(e) => {
                        error!("Spool watcher failed: {}", e);
                        break Err(e);
                    }
                },
                wakeup = self.manager.wait() => {
                    self.manager.handle(wakeup).await;
                    if self.sweep_pending && self.manager.state() == ConnectionState::Connected {
                        self.sweep_pending = false;
                        self.sweep().await;
                    }
                }
            }
        };

        self.manager.shutdown().await;
        result
    }

    async fn sweep(&mut self) {
        let files = match spool::existing_files(self.watcher.directory()).await {
            Ok(files) => files,
            Err(e) => {
                error!("Startup sweep of {} failed: {}", self.watcher.directory().display(), e);
                return;
            }
        };
        info!("Startup sweep: {} file(s) already in the spool", files.len());
        for path in files {
            self.processor.process(&path, &mut self.manager).await;
        }
    }
}
