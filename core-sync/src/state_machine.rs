//! # Sync State Machine
//!
//! Applies inbound protocol messages to the stores and announces the
//! resulting status to local consumers.
//!
//! ## Messages
//!
//! - `WATCH`: register the consumer as owner; answer from local state when
//!   the path is already known, otherwise forward the watch to the origin
//! - `WATCH-RESULT`: record what the origin knows about a file or folder
//! - `MSFILEUPDATE` add/update: mark the path STALE with the new token
//! - `MSFILEUPDATE` delete: purge the path (or folder subtree) and its cache
//!
//! The download pipeline reports back through
//! [`complete_download`](SyncStateMachine::complete_download) and
//! [`fail_download`](SyncStateMachine::fail_download).
//!
//! Every change-set message may carry `watchlistLastChanged`; the ledger
//! cursor is ratcheted forward after the message has been applied.

use bridge_traits::FileSystemAccess;
use core_runtime::events::{CoreEvent, EventBus, WatchlistEvent};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::{BroadcastRouter, MessageTransport};
use crate::error::{Result, SyncError};
use crate::messages::{
    FileUpdateNotice, FileUpdatePayload, FolderItem, InboundMessage, OutboundMessage,
    RemoteWatchPayload, UpdateKind, WatchRequest, WatchResult, WatchlistComparePayload,
};
use crate::models::{DownloadToken, FileEntry, FileStatus, WatchlistEntry};
use crate::paths::{is_folder, validate_storage_path, CacheLayout};
use crate::repositories::Stores;

pub struct SyncStateMachine {
    stores: Stores,
    router: Arc<BroadcastRouter>,
    transport: Arc<dyn MessageTransport>,
    fs: Arc<dyn FileSystemAccess>,
    layout: CacheLayout,
    display_id: String,
    events: EventBus,
}

impl SyncStateMachine {
    pub fn new(
        stores: Stores,
        router: Arc<BroadcastRouter>,
        transport: Arc<dyn MessageTransport>,
        fs: Arc<dyn FileSystemAccess>,
        layout: CacheLayout,
        display_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        Self {
            stores,
            router,
            transport,
            fs,
            layout,
            display_id: display_id.into(),
            events,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Apply one inbound message.
    pub async fn handle(&self, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Watch(request) => self.watch(request).await,
            InboundMessage::WatchResult(result) => self.watch_result(result).await,
            InboundMessage::FileUpdate(notice) => match notice.kind {
                UpdateKind::Add => self.add(notice).await,
                UpdateKind::Update => self.update(notice).await,
                UpdateKind::Delete => self.delete(notice).await,
            },
        }
    }

    // ------------------------------------------------------------------------
    // WATCH
    // ------------------------------------------------------------------------

    #[instrument(skip(self, request), fields(file_path = %request.file_path, from = %request.from))]
    pub async fn watch(&self, request: WatchRequest) -> Result<()> {
        validate_storage_path(&request.file_path)?;
        if request.from.is_empty() {
            return Err(SyncError::Validation("WATCH without sender".to_string()));
        }

        let path = request.file_path.as_str();
        let sequence = self.stores.watchlist.runtime_sequence().await?;
        self.stores.owners.add_owner(path, &request.from).await?;

        if is_folder(path) {
            return self.watch_folder(path, sequence).await;
        }

        let acknowledged = self.stores.watchlist.get(path).await?;
        let entry = self.stores.metadata.get(path).await?;

        match (acknowledged, entry) {
            (Some(_), Some(entry)) => {
                debug!(status = %entry.status, "Answering watch from local state");
                self.stores.metadata.set_watch_sequence(path, sequence).await?;
                self.announce(&entry).await?;
            }
            _ => {
                self.stores
                    .metadata
                    .upsert_status(path, FileStatus::Unknown)
                    .await?;
                self.stores.metadata.set_watch_sequence(path, sequence).await?;
                self.request_remote_watch(path).await?;
            }
        }

        Ok(())
    }

    async fn watch_folder(&self, folder: &str, sequence: i64) -> Result<()> {
        let known = self
            .stores
            .metadata
            .get(folder)
            .await?
            .filter(|entry| entry.status != FileStatus::Unknown);

        if known.is_none() {
            self.stores
                .metadata
                .upsert_status(folder, FileStatus::Unknown)
                .await?;
            self.stores.metadata.set_watch_sequence(folder, sequence).await?;
            return self.request_remote_watch(folder).await;
        }

        self.stores.metadata.set_watch_sequence(folder, sequence).await?;
        let owners = self.stores.owners.get(folder).await?;

        for child in self.stores.metadata.find_by_prefix(folder).await? {
            if child.file_path == folder {
                continue;
            }
            if let Some(owners) = &owners {
                self.stores
                    .owners
                    .add_owners(&child.file_path, &owners.owners)
                    .await?;
            }
            self.announce(&child).await?;
            if child.status == FileStatus::Unknown {
                self.request_remote_watch(&child.file_path).await?;
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // WATCH-RESULT
    // ------------------------------------------------------------------------

    #[instrument(skip(self, result), fields(file_path = %result.file_path))]
    pub async fn watch_result(&self, result: WatchResult) -> Result<()> {
        validate_storage_path(&result.file_path)?;
        let path = result.file_path.as_str();

        if let Some(code) = result.error_msg.as_deref() {
            match code.parse::<FileStatus>() {
                Ok(status) => {
                    info!(status = %status, "Origin reported status");
                    self.stores.metadata.upsert_status(path, status).await?;
                    self.router
                        .file_update(FileUpdatePayload::new(path, status))
                        .await?;
                }
                Err(_) => {
                    warn!(error_msg = %code, "Origin reported an error");
                    self.router.file_error(path, code, None).await?;
                }
            }
            return Ok(());
        }

        if let Some(items) = result.folder_data {
            if !is_folder(path) {
                return Err(SyncError::Validation(
                    "folderData on a non-folder path".to_string(),
                ));
            }
            self.apply_folder(path, result.version.as_deref(), items)
                .await?;
            return self.ratchet(result.watchlist_last_changed.as_deref()).await;
        }

        let version = non_empty(result.version, "version")?;
        if let Some(token) = &result.token {
            token.validate()?;
        }

        let status = if result.token.is_some() {
            FileStatus::Stale
        } else {
            FileStatus::Current
        };
        let mut entry = FileEntry::new(path, status, version.as_str());
        entry.token = result.token;

        self.stores.metadata.upsert(&entry).await?;
        self.stores
            .watchlist
            .upsert(&WatchlistEntry::new(path, version.as_str()))
            .await?;
        self.ratchet(result.watchlist_last_changed.as_deref()).await?;
        self.announce(&entry).await
    }

    async fn apply_folder(
        &self,
        folder: &str,
        folder_version: Option<&str>,
        items: Vec<FolderItem>,
    ) -> Result<()> {
        let owners = self.stores.owners.get(folder).await?;

        for item in items {
            if let Err(error) = self.check_folder_item(folder, &item) {
                warn!(file_path = %item.file_path, error = %error, "Skipping folder item");
                continue;
            }

            let unchanged = self
                .stores
                .metadata
                .get(&item.file_path)
                .await?
                .map(|existing| {
                    existing.status == FileStatus::Current && existing.version == item.version
                })
                .unwrap_or(false);
            let status = if unchanged {
                FileStatus::Current
            } else {
                FileStatus::Stale
            };

            let mut entry = FileEntry::new(item.file_path.as_str(), status, item.version.as_str());
            entry.token = item.token;
            self.stores.metadata.upsert(&entry).await?;
            self.stores
                .watchlist
                .upsert(&WatchlistEntry::new(item.file_path.as_str(), item.version.as_str()))
                .await?;
            if let Some(owners) = &owners {
                self.stores
                    .owners
                    .add_owners(&item.file_path, &owners.owners)
                    .await?;
            }

            self.announce(&entry).await?;
        }

        let folder_entry = FileEntry::new(folder, FileStatus::Current, folder_version.unwrap_or("0"));
        self.stores.metadata.upsert(&folder_entry).await
    }

    fn check_folder_item(&self, folder: &str, item: &FolderItem) -> Result<()> {
        validate_storage_path(&item.file_path)?;
        if !item.file_path.starts_with(folder) || item.file_path == folder {
            return Err(SyncError::Validation(format!(
                "{} is not inside {}",
                item.file_path, folder
            )));
        }
        if item.version.is_empty() {
            return Err(SyncError::Validation("folder item without version".to_string()));
        }
        if let Some(token) = &item.token {
            token.validate()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // MSFILEUPDATE
    // ------------------------------------------------------------------------

    #[instrument(skip(self, notice), fields(file_path = %notice.file_path))]
    pub async fn add(&self, notice: FileUpdateNotice) -> Result<()> {
        let (version, token) = validate_update(&notice)?;

        if !self
            .stores
            .owners
            .assign_from_parent(&notice.file_path)
            .await?
        {
            warn!("Ignoring add outside any watched folder");
            return Ok(());
        }

        self.apply_update(&notice.file_path, version, token, notice.watchlist_last_changed.as_deref())
            .await
    }

    #[instrument(skip(self, notice), fields(file_path = %notice.file_path))]
    pub async fn update(&self, notice: FileUpdateNotice) -> Result<()> {
        let (version, token) = validate_update(&notice)?;
        self.apply_update(&notice.file_path, version, token, notice.watchlist_last_changed.as_deref())
            .await
    }

    async fn apply_update(
        &self,
        path: &str,
        version: String,
        token: DownloadToken,
        last_changed: Option<&str>,
    ) -> Result<()> {
        let entry = FileEntry::new(path, FileStatus::Stale, version.as_str()).with_token(token);
        self.stores.metadata.upsert(&entry).await?;
        self.stores
            .watchlist
            .upsert(&WatchlistEntry::new(path, version.as_str()))
            .await?;

        info!(version = %version, "File marked stale");
        self.router
            .file_update(FileUpdatePayload::new(path, FileStatus::Stale).with_version(version))
            .await?;
        self.ratchet(last_changed).await
    }

    /// Remove a path, or a folder and everything under it.
    ///
    /// Deleting something that is not there changes nothing.
    #[instrument(skip(self, notice), fields(file_path = %notice.file_path))]
    pub async fn delete(&self, notice: FileUpdateNotice) -> Result<()> {
        validate_storage_path(&notice.file_path)?;
        let path = notice.file_path.as_str();

        let targets: Vec<String> = if is_folder(path) {
            self.stores
                .metadata
                .find_by_prefix(path)
                .await?
                .into_iter()
                .map(|entry| entry.file_path)
                .collect()
        } else {
            self.stores
                .metadata
                .get(path)
                .await?
                .map(|entry| vec![entry.file_path])
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!("Nothing to delete");
            return self.ratchet(notice.watchlist_last_changed.as_deref()).await;
        }

        // Owners go away with the records, so capture them for the broadcast.
        let mut removed = Vec::with_capacity(targets.len());
        for target in targets {
            let owners = self.stores.owners.get(&target).await?;
            self.stores.purge(&target).await?;
            self.remove_cached(&target).await;
            removed.push((target, owners));
        }
        if is_folder(path) {
            self.stores.owners.delete_prefix(path).await?;
            self.stores.watchlist.delete_prefix(path).await?;
        }

        info!(count = removed.len(), "Deleted paths");
        for (target, owners) in &removed {
            self.router
                .file_update_with_owners(
                    FileUpdatePayload::new(target.as_str(), FileStatus::Deleted),
                    owners.as_ref(),
                )
                .await?;
        }

        self.ratchet(notice.watchlist_last_changed.as_deref()).await
    }

    // ------------------------------------------------------------------------
    // Download pipeline callbacks
    // ------------------------------------------------------------------------

    /// Record a promoted download and announce the result.
    ///
    /// Returns the new status, or `None` if the entry was deleted while the
    /// download ran, in which case the promoted file is removed again.
    #[instrument(skip(self))]
    pub async fn complete_download(
        &self,
        file_path: &str,
        downloaded_version: &str,
    ) -> Result<Option<FileStatus>> {
        let Some(entry) = self
            .stores
            .metadata
            .complete_download(file_path, downloaded_version)
            .await?
        else {
            warn!("Entry deleted during download");
            self.remove_cached(file_path).await;
            return Ok(None);
        };

        if entry.status == FileStatus::Current {
            self.stores
                .watchlist
                .upsert(&WatchlistEntry::new(file_path, entry.version.as_str()))
                .await?;
        } else {
            info!(
                stored_version = %entry.version,
                "Newer version arrived during download"
            );
        }

        self.announce(&entry).await?;
        Ok(Some(entry.status))
    }

    /// Demote an entry whose download failed and tell its owners.
    #[instrument(skip(self, error))]
    pub async fn fail_download(&self, file_path: &str, error: &SyncError) -> Result<()> {
        warn!(error = %error, "Download failed");

        self.stores.metadata.mark_failed(file_path).await?;
        if self.stores.watchlist.get(file_path).await?.is_some() {
            self.stores
                .watchlist
                .upsert(&WatchlistEntry::new(file_path, "0"))
                .await?;
        }

        self.router
            .file_error(file_path, error.summary(), Some(error.detail()))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Origin requests
    // ------------------------------------------------------------------------

    /// Send every acknowledged version to the origin.
    pub async fn send_watchlist_compare(&self) -> Result<usize> {
        let watchlist = self.stores.watchlist.all().await?;
        let entries = watchlist.len();

        self.transport
            .send_to_origin(&OutboundMessage::WatchlistCompare(WatchlistComparePayload {
                watchlist,
            }))
            .await?;

        info!(entries, "Sent watchlist compare");
        self.events
            .emit(CoreEvent::Watchlist(WatchlistEvent::CompareSent { entries }))
            .ok();
        Ok(entries)
    }

    async fn request_remote_watch(&self, file_path: &str) -> Result<()> {
        debug!(file_path = %file_path, "Forwarding watch to origin");
        self.transport
            .send_to_origin(&OutboundMessage::RemoteWatch(RemoteWatchPayload {
                file_path: file_path.to_string(),
                display_id: self.display_id.clone(),
            }))
            .await
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn announce(&self, entry: &FileEntry) -> Result<()> {
        let mut payload = FileUpdatePayload::new(entry.file_path.as_str(), entry.status);
        if entry.version != "0" {
            payload = payload.with_version(entry.version.as_str());
        }
        self.router.file_update(payload).await?;
        Ok(())
    }

    async fn ratchet(&self, last_changed: Option<&str>) -> Result<()> {
        let Some(marker) = last_changed.filter(|marker| !marker.is_empty()) else {
            return Ok(());
        };

        if self.stores.watchlist.set_last_changed(marker).await? {
            debug!(last_changed = %marker, "Advanced lastChanged");
            self.events
                .emit(CoreEvent::Watchlist(WatchlistEvent::LastChangedAdvanced {
                    last_changed: marker.to_string(),
                }))
                .ok();
        }
        Ok(())
    }

    async fn remove_cached(&self, file_path: &str) {
        let cache_path = self.layout.cache_path(file_path);
        if let Err(error) = self.fs.delete_file(&cache_path).await {
            warn!(file_path = %file_path, error = %error, "Failed to remove cached file");
        }
    }
}

fn non_empty(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SyncError::Validation(format!("missing {}", field)))
}

/// Required fields of an add/update, checked before anything is written.
fn validate_update(notice: &FileUpdateNotice) -> Result<(String, DownloadToken)> {
    validate_storage_path(&notice.file_path)?;
    if is_folder(&notice.file_path) {
        return Err(SyncError::Validation(
            "add/update must name a file".to_string(),
        ));
    }

    let version = non_empty(notice.version.clone(), "version")?;
    let token = notice
        .token
        .clone()
        .ok_or_else(|| SyncError::Validation("missing token".to_string()))?;
    token.validate()?;

    Ok((version, token))
}
