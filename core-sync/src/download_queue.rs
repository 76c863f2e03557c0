//! # Download Queue
//!
//! Polls the metadata store for STALE/UNKNOWN entries with a token and
//! drives each one through the [`FileFetcher`].
//!
//! ## Single-flight
//!
//! A path is claimed in an in-memory set before its fetch starts and
//! released once the resulting state is recorded. A second request for a
//! claimed path returns [`DownloadOutcome::AlreadyInFlight`] without
//! touching the network. Claims are check-and-set under one lock.
//!
//! ## Polling
//!
//! [`DownloadQueue::run`] keeps up to `max_concurrent_downloads` fetches
//! going. When nothing is pending it sleeps for `idle_interval`; after a
//! failure the slot rests for the same interval before taking new work.

use bridge_traits::Scheduler;
use core_runtime::config::DownloadSettings;
use core_runtime::events::{CoreEvent, DownloadEvent, EventBus};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::fetcher::FileFetcher;
use crate::models::{FileEntry, FileStatus};
use crate::repositories::MetadataStore;
use crate::state_machine::SyncStateMachine;

/// Candidates fetched per poll beyond the concurrency bound, so claimed
/// paths at the head of the list do not hide unclaimed ones.
const CANDIDATE_SLACK: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The download finished; carries the recorded status
    Completed(FileStatus),
    /// The entry was deleted while downloading
    Discarded,
    /// The download failed and the entry was demoted
    Failed(String),
    /// Another fetch for the same path is running
    AlreadyInFlight,
}

type ProcessingSet = Arc<Mutex<HashSet<String>>>;

/// Claim on a path; released on drop.
struct ProcessingGuard {
    processing: ProcessingSet,
    file_path: String,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.processing.lock().remove(&self.file_path);
    }
}

pub struct DownloadQueue {
    metadata: Arc<dyn MetadataStore>,
    fetcher: Arc<FileFetcher>,
    state_machine: Arc<SyncStateMachine>,
    scheduler: Arc<dyn Scheduler>,
    settings: DownloadSettings,
    processing: ProcessingSet,
    events: EventBus,
}

impl DownloadQueue {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        fetcher: Arc<FileFetcher>,
        state_machine: Arc<SyncStateMachine>,
        scheduler: Arc<dyn Scheduler>,
        settings: DownloadSettings,
        events: EventBus,
    ) -> Self {
        Self {
            metadata,
            fetcher,
            state_machine,
            scheduler,
            settings,
            processing: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    pub fn fetcher(&self) -> &Arc<FileFetcher> {
        &self.fetcher
    }

    pub fn is_processing(&self, file_path: &str) -> bool {
        self.processing.lock().contains(file_path)
    }

    pub fn processing_count(&self) -> usize {
        self.processing.lock().len()
    }

    fn claim(&self, file_path: &str) -> Option<ProcessingGuard> {
        let mut processing = self.processing.lock();
        if !processing.insert(file_path.to_string()) {
            return None;
        }
        Some(ProcessingGuard {
            processing: self.processing.clone(),
            file_path: file_path.to_string(),
        })
    }

    /// Download `entry` unless its path is already being downloaded.
    pub async fn download(&self, entry: FileEntry) -> Result<DownloadOutcome> {
        let Some(guard) = self.claim(&entry.file_path) else {
            debug!(file_path = %entry.file_path, "Download already in flight");
            return Ok(DownloadOutcome::AlreadyInFlight);
        };
        self.run_claimed(entry, guard).await
    }

    /// Download the oldest pending entry, if any.
    pub async fn process_next(&self) -> Result<Option<(String, DownloadOutcome)>> {
        let Some((entry, guard)) = self.claim_next().await? else {
            return Ok(None);
        };
        let file_path = entry.file_path.clone();
        let outcome = self.run_claimed(entry, guard).await?;
        Ok(Some((file_path, outcome)))
    }

    async fn claim_next(&self) -> Result<Option<(FileEntry, ProcessingGuard)>> {
        let limit = (self.settings.max_concurrent_downloads as u32).saturating_add(CANDIDATE_SLACK);
        let candidates = self.metadata.find_download_candidates(limit).await?;

        for entry in candidates {
            if let Some(guard) = self.claim(&entry.file_path) {
                return Ok(Some((entry, guard)));
            }
        }
        Ok(None)
    }

    #[instrument(skip(self, entry, _guard), fields(file_path = %entry.file_path, version = %entry.target_version()))]
    async fn run_claimed(&self, entry: FileEntry, _guard: ProcessingGuard) -> Result<DownloadOutcome> {
        self.events
            .emit(CoreEvent::Download(DownloadEvent::Started {
                file_path: entry.file_path.clone(),
                version: entry.target_version().to_string(),
            }))
            .ok();

        match self.fetcher.fetch(&entry).await {
            Ok(fetched) => {
                let status = self
                    .state_machine
                    .complete_download(&entry.file_path, &fetched.version)
                    .await?;

                self.events
                    .emit(CoreEvent::Download(DownloadEvent::Completed {
                        file_path: entry.file_path.clone(),
                        version: fetched.version.clone(),
                        bytes: fetched.bytes,
                        from_cache: fetched.from_cache,
                    }))
                    .ok();

                Ok(match status {
                    Some(status) => DownloadOutcome::Completed(status),
                    None => DownloadOutcome::Discarded,
                })
            }
            Err(failure) => {
                self.state_machine
                    .fail_download(&entry.file_path, &failure)
                    .await?;

                self.events
                    .emit(CoreEvent::Download(DownloadEvent::Failed {
                        file_path: entry.file_path.clone(),
                        message: failure.to_string(),
                        will_retry: entry.token.is_some(),
                    }))
                    .ok();

                Ok(DownloadOutcome::Failed(failure.to_string()))
            }
        }
    }

    /// Poll and download until `shutdown` fires. Fetches already running are
    /// awaited before returning.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let slots = self.settings.max_concurrent_downloads.max(1);
        let permits = Arc::new(Semaphore::new(slots));
        let mut tasks = JoinSet::new();
        info!(slots, "Download queue started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                if let Err(join_error) = joined {
                    error!(error = %join_error, "Download task panicked");
                }
            }

            let next = match self.claim_next().await {
                Ok(next) => next,
                Err(poll_error) => {
                    warn!(error = %poll_error, "Failed to poll for downloads");
                    None
                }
            };

            match next {
                Some((entry, guard)) => {
                    let queue = self.clone();
                    let stop = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        let file_path = entry.file_path.clone();
                        let rest = match queue.run_claimed(entry, guard).await {
                            Ok(DownloadOutcome::Failed(_)) => true,
                            Ok(_) => false,
                            Err(state_error) => {
                                error!(
                                    file_path = %file_path,
                                    error = %state_error,
                                    "Failed to record download result"
                                );
                                true
                            }
                        };
                        if rest {
                            tokio::select! {
                                _ = stop.cancelled() => {}
                                _ = queue.scheduler.sleep(queue.settings.idle_interval) => {}
                            }
                        }
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.scheduler.sleep(self.settings.idle_interval) => {}
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                error!(error = %join_error, "Download task panicked");
            }
        }
        info!("Download queue stopped");
    }
}
