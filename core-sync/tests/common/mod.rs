#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::{ReqwestHttpClient, TokioFileSystem};
use bridge_traits::error::{BridgeError, Result as BridgeResult};
use bridge_traits::storage::FileMetadata;
use bridge_traits::{FileSystemAccess, Scheduler};
use bytes::Bytes;
use core_runtime::config::{CoreConfig, DownloadSettings, ExpirationSettings};
use core_sync::messages::{FileUpdatePayload, OutboundMessage};
use core_sync::paths::cache_file_name;
use core_sync::{
    CacheLayout, DownloadToken, MessageTransport, Result, SyncService, TokenData,
};
use parking_lot::Mutex;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWrite;
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub const DISPLAY_ID: &str = "display-1";
pub const DIRECT_OWNER: &str = "player";

pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

pub fn token(file_path: &str) -> DownloadToken {
    DownloadToken {
        hash: "c2lnbmF0dXJl".to_string(),
        data: TokenData {
            timestamp: 1_700_000_000_000,
            file_path: file_path.to_string(),
            display_id: DISPLAY_ID.to_string(),
        },
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    General,
    Direct,
    Origin,
}

#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Channel, OutboundMessage)>>,
}

impl RecordingTransport {
    pub fn sent(&self) -> Vec<(Channel, OutboundMessage)> {
        self.sent.lock().clone()
    }

    pub fn on(&self, channel: Channel) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// FILE-UPDATE payloads on the local channels, in order.
    pub fn file_updates(&self) -> Vec<FileUpdatePayload> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c != Channel::Origin)
            .filter_map(|(_, m)| match m {
                OutboundMessage::FileUpdate(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl MessageTransport for RecordingTransport {
    async fn broadcast(&self, message: &OutboundMessage) -> Result<()> {
        self.sent.lock().push((Channel::General, message.clone()));
        Ok(())
    }

    async fn send_direct(&self, message: &OutboundMessage) -> Result<()> {
        self.sent.lock().push((Channel::Direct, message.clone()));
        Ok(())
    }

    async fn send_to_origin(&self, message: &OutboundMessage) -> Result<()> {
        self.sent.lock().push((Channel::Origin, message.clone()));
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Returns immediately and records every requested delay.
#[derive(Default)]
pub struct InstantScheduler {
    sleeps: Mutex<Vec<Duration>>,
}

impl InstantScheduler {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Scheduler for InstantScheduler {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// File system
// ============================================================================

/// Pauses `delete_file` until released, to hold a sweep mid-flight.
#[derive(Clone, Default)]
pub struct DeleteGate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Real file system with scripted free space and delete behaviour.
pub struct ScriptedFs {
    inner: TokioFileSystem,
    available: Option<u64>,
    failing_delete: Option<String>,
    delete_gate: Option<DeleteGate>,
}

#[async_trait]
impl FileSystemAccess for ScriptedFs {
    async fn exists(&self, path: &Path) -> BridgeResult<bool> {
        self.inner.exists(path).await
    }

    async fn metadata(&self, path: &Path) -> BridgeResult<FileMetadata> {
        self.inner.metadata(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> BridgeResult<()> {
        self.inner.create_dir_all(path).await
    }

    async fn read_file(&self, path: &Path) -> BridgeResult<Bytes> {
        self.inner.read_file(path).await
    }

    async fn write_file(&self, path: &Path, data: Bytes) -> BridgeResult<()> {
        self.inner.write_file(path, data).await
    }

    async fn delete_file(&self, path: &Path) -> BridgeResult<()> {
        if let Some(gate) = &self.delete_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let file_name = path.file_name().and_then(|name| name.to_str());
        if file_name.is_some() && file_name == self.failing_delete.as_deref() {
            return Err(BridgeError::OperationFailed("device busy".to_string()));
        }
        self.inner.delete_file(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> BridgeResult<()> {
        self.inner.rename(from, to).await
    }

    async fn available_space(&self, path: &Path) -> BridgeResult<u64> {
        match self.available {
            Some(available) => Ok(available),
            None => self.inner.available_space(path).await,
        }
    }

    async fn open_write_stream(
        &self,
        path: &Path,
    ) -> BridgeResult<Box<dyn AsyncWrite + Send + Unpin>> {
        self.inner.open_write_stream(path).await
    }
}

// ============================================================================
// Origin
// ============================================================================

/// Credential endpoint answering with `<origin>/files/<token filePath>`.
struct SignedUrlResponder {
    origin: String,
    calls: Arc<AtomicUsize>,
}

impl Respond for SignedUrlResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let token: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(token) => token,
            Err(_) => return ResponseTemplate::new(400),
        };
        let file_path = token["data"]["filePath"].as_str().unwrap_or_default();
        ResponseTemplate::new(200)
            .set_body_json(json!({ "url": format!("{}/files/{}", self.origin, file_path) }))
    }
}

pub struct HarnessOptions {
    pub available_space: Option<u64>,
    /// Storage path whose cached file cannot be deleted
    pub failing_delete: Option<&'static str>,
    pub delete_gate: Option<DeleteGate>,
    pub download: DownloadSettings,
    pub scheduler: Option<Arc<dyn Scheduler>>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            available_space: None,
            failing_delete: None,
            delete_gate: None,
            download: DownloadSettings::default(),
            scheduler: None,
        }
    }
}

pub struct Harness {
    pub service: SyncService,
    pub transport: Arc<RecordingTransport>,
    pub scheduler: Arc<InstantScheduler>,
    pub server: MockServer,
    pub layout: CacheLayout,
    pub credential_calls: Arc<AtomicUsize>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = MockServer::start().await;
        let credential_calls = Arc::new(AtomicUsize::new(0));

        Mock::given(method("POST"))
            .and(path("/sign"))
            .respond_with(SignedUrlResponder {
                origin: server.uri(),
                calls: credential_calls.clone(),
            })
            .mount(&server)
            .await;

        let transport = Arc::new(RecordingTransport::default());
        let scheduler = Arc::new(InstantScheduler::default());
        let file_system: Arc<dyn FileSystemAccess> = Arc::new(ScriptedFs {
            inner: TokioFileSystem::new(),
            available: options.available_space,
            failing_delete: options.failing_delete.map(cache_file_name),
            delete_gate: options.delete_gate,
        });
        let cache_dir = dir.path().join("cache");
        let download_dir = dir.path().join("downloads");

        let config = CoreConfig::builder()
            .display_id(DISPLAY_ID)
            .database_path(dir.path().join("sync.db"))
            .cache_dir(&cache_dir)
            .download_dir(&download_dir)
            .credential_endpoint(format!("{}/sign", server.uri()))
            .direct_channel_id(DIRECT_OWNER)
            .http_client(Arc::new(ReqwestHttpClient::new()))
            .file_system(file_system)
            .scheduler(
                options
                    .scheduler
                    .unwrap_or_else(|| scheduler.clone() as Arc<dyn Scheduler>),
            )
            .download_settings(options.download)
            .expiration_settings(ExpirationSettings::default())
            .build()
            .unwrap();

        let service = SyncService::builder(config)
            .transport(transport.clone())
            .pool(memory_pool().await)
            .build()
            .await
            .unwrap();

        Self {
            service,
            transport,
            scheduler,
            server,
            layout: CacheLayout::new(cache_dir, download_dir),
            credential_calls,
            dir,
        }
    }

    /// Serve `body` for `file_path` from the origin.
    pub async fn serve_file(&self, file_path: &str, body: &'static [u8]) {
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", file_path)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
    }

    /// Apply a raw message and wait for it to finish.
    pub async fn send(&self, raw: serde_json::Value) {
        let message = core_sync::InboundMessage::from_json(&raw.to_string()).unwrap();
        self.service.handle(message).await.unwrap();
    }

    pub async fn update(&self, file_path: &str, version: &str) {
        self.send(json!({
            "topic": "MSFILEUPDATE",
            "type": "update",
            "filePath": file_path,
            "version": version,
            "token": token(file_path),
        }))
        .await;
    }
}
