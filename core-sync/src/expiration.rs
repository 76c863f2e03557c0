//! # Expiration Sweeper
//!
//! Evicts paths nobody has watched for a while.
//!
//! Every WATCH stamps the current runtime sequence on the entry. An epoch
//! ticker advances the sequence on a fixed period, and an independent sweep
//! removes entries whose stamp fell `max_expire_count` epochs behind,
//! together with their owners, watchlist entry and cached file. An expiring
//! folder takes its expired or never-watched children with it.
//!
//! Sweeps never overlap; a sweep requested while one is running is skipped.

use bridge_traits::{FileSystemAccess, Scheduler};
use core_runtime::config::ExpirationSettings;
use core_runtime::events::{CoreEvent, EventBus, ExpirationEvent};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::models::FileEntry;
use crate::paths::{is_folder, CacheLayout};
use crate::repositories::Stores;

/// Whether an entry stamped at `watch_sequence` has expired.
///
/// Entries that were never watched (`0`) do not expire on their own.
pub fn is_expired(watch_sequence: i64, runtime_sequence: i64, max_expire_count: i64) -> bool {
    watch_sequence > 0 && runtime_sequence - watch_sequence >= max_expire_count
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Paths removed, children before their folder
    pub expired: Vec<String>,
    /// Paths whose cleanup failed; retried on the next sweep
    pub failed: usize,
    /// The sweep did not run because another one was in progress
    pub skipped: bool,
}

pub struct ExpirationSweeper {
    stores: Stores,
    fs: Arc<dyn FileSystemAccess>,
    layout: CacheLayout,
    settings: ExpirationSettings,
    scheduler: Arc<dyn Scheduler>,
    events: EventBus,
    running: AtomicBool,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ExpirationSweeper {
    pub fn new(
        stores: Stores,
        fs: Arc<dyn FileSystemAccess>,
        layout: CacheLayout,
        settings: ExpirationSettings,
        scheduler: Arc<dyn Scheduler>,
        events: EventBus,
    ) -> Self {
        Self {
            stores,
            fs,
            layout,
            settings,
            scheduler,
            events,
            running: AtomicBool::new(false),
        }
    }

    /// Advance the runtime sequence by one epoch.
    pub async fn advance_epoch(&self) -> Result<i64> {
        let runtime_sequence = self.stores.watchlist.increment_runtime_sequence().await?;
        info!(runtime_sequence, "Epoch advanced");
        self.events
            .emit(CoreEvent::Expiration(ExpirationEvent::EpochAdvanced {
                runtime_sequence,
            }))
            .ok();
        Ok(runtime_sequence)
    }

    /// Remove every expired path.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sweep already running");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        }
        let _running = RunningFlag(&self.running);

        let runtime_sequence = self.stores.watchlist.runtime_sequence().await?;
        let max = self.settings.max_expire_count;
        let watched = self.stores.metadata.find_watched().await?;

        let mut report = SweepReport::default();
        let mut removed = HashSet::new();

        for entry in watched {
            if removed.contains(&entry.file_path)
                || !is_expired(entry.watch_sequence, runtime_sequence, max)
            {
                continue;
            }

            if is_folder(&entry.file_path) {
                match self.expired_children(&entry, runtime_sequence).await {
                    Ok(children) => {
                        for child in children {
                            if !removed.contains(&child) {
                                self.expire_path(&child, &mut report, &mut removed).await;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(file_path = %entry.file_path, error = %error, "Failed to list folder");
                        report.failed += 1;
                        continue;
                    }
                }
            }

            self.expire_path(&entry.file_path, &mut report, &mut removed)
                .await;
        }

        info!(
            expired = report.expired.len(),
            failed = report.failed,
            runtime_sequence,
            "Expiration sweep finished"
        );
        self.events
            .emit(CoreEvent::Expiration(ExpirationEvent::SweepCompleted {
                expired: report.expired.len(),
                failed: report.failed,
            }))
            .ok();

        Ok(report)
    }

    /// Children of `folder` that go with it, deepest paths first.
    async fn expired_children(&self, folder: &FileEntry, runtime_sequence: i64) -> Result<Vec<String>> {
        let max = self.settings.max_expire_count;
        let mut children: Vec<String> = self
            .stores
            .metadata
            .find_by_prefix(&folder.file_path)
            .await?
            .into_iter()
            .filter(|child| child.file_path != folder.file_path)
            .filter(|child| {
                child.watch_sequence == 0 || is_expired(child.watch_sequence, runtime_sequence, max)
            })
            .map(|child| child.file_path)
            .collect();
        children.reverse();
        Ok(children)
    }

    async fn expire_path(
        &self,
        file_path: &str,
        report: &mut SweepReport,
        removed: &mut HashSet<String>,
    ) {
        match self.remove(file_path).await {
            Ok(()) => {
                debug!(file_path = %file_path, "Expired");
                removed.insert(file_path.to_string());
                report.expired.push(file_path.to_string());
            }
            Err(error) => {
                warn!(file_path = %file_path, error = %error, "Failed to expire path");
                report.failed += 1;
            }
        }
    }

    /// Cached file first, so a path whose file cannot be removed keeps its
    /// records and is retried by the next sweep.
    async fn remove(&self, file_path: &str) -> Result<()> {
        self.fs
            .delete_file(&self.layout.cache_path(file_path))
            .await
            .map_err(SyncError::io)?;
        self.stores.purge(file_path).await
    }

    /// Advance the epoch every `epoch_interval` until `shutdown` fires.
    pub async fn run_epoch_ticker(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.scheduler.sleep(self.settings.epoch_interval) => {
                    if let Err(error) = self.advance_epoch().await {
                        warn!(error = %error, "Failed to advance epoch");
                    }
                }
            }
        }
        debug!("Epoch ticker stopped");
    }

    /// Sweep every `sweep_interval` until `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.scheduler.sleep(self.settings.sweep_interval) => {
                    if let Err(error) = self.sweep().await {
                        warn!(error = %error, "Expiration sweep failed");
                    }
                }
            }
        }
        debug!("Expiration sweeper stopped");
    }
}
