//! # Broadcast Router
//!
//! Delivers outbound notifications to local consumers.
//!
//! ## Routing
//!
//! The owners of the message's path decide the channel:
//!
//! - owners include the direct channel id and nobody else: direct only
//! - owners include the direct channel id and others: direct and general
//! - anything else, including no owners at all: general only
//!
//! FILE-UPDATE payloads with a version are enriched with the local cache
//! path and a `file://` URL before routing.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

use crate::error::Result;
use crate::messages::{FileErrorPayload, FileUpdatePayload, OutboundMessage};
use crate::models::OwnerEntry;
use crate::paths::CacheLayout;
use crate::repositories::OwnerRegistry;

/// Seam to the external message transport.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// General channel, seen by every local consumer.
    async fn broadcast(&self, message: &OutboundMessage) -> Result<()>;

    /// Local direct channel.
    async fn send_direct(&self, message: &OutboundMessage) -> Result<()>;

    /// Remote origin.
    async fn send_to_origin(&self, message: &OutboundMessage) -> Result<()>;
}

/// Channels a message went out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    General,
    Both,
}

pub struct BroadcastRouter {
    owners: Arc<dyn OwnerRegistry>,
    transport: Arc<dyn MessageTransport>,
    direct_channel_id: Option<String>,
    layout: CacheLayout,
}

impl BroadcastRouter {
    pub fn new(
        owners: Arc<dyn OwnerRegistry>,
        transport: Arc<dyn MessageTransport>,
        direct_channel_id: Option<String>,
        layout: CacheLayout,
    ) -> Self {
        Self {
            owners,
            transport,
            direct_channel_id,
            layout,
        }
    }

    /// Route `message` according to the current owners of its path.
    #[instrument(skip(self, message), fields(topic = message.topic()))]
    pub async fn broadcast(&self, message: OutboundMessage) -> Result<Delivery> {
        let owners = match message.file_path() {
            Some(path) => self.owners.get(path).await?,
            None => None,
        };
        self.route_with_owners(message, owners.as_ref()).await
    }

    /// Route `message` using an owner snapshot taken earlier, for paths whose
    /// ownership records are already gone.
    pub async fn route_with_owners(
        &self,
        message: OutboundMessage,
        owners: Option<&OwnerEntry>,
    ) -> Result<Delivery> {
        let direct_owned = match (&self.direct_channel_id, owners) {
            (Some(direct), Some(entry)) => entry.contains(direct),
            _ => false,
        };

        let delivery = if direct_owned {
            self.transport.send_direct(&message).await?;
            let sole_owner = owners.map(|entry| entry.owners.len() == 1).unwrap_or(false);
            if sole_owner {
                Delivery::Direct
            } else {
                self.transport.broadcast(&message).await?;
                Delivery::Both
            }
        } else {
            self.transport.broadcast(&message).await?;
            Delivery::General
        };

        debug!(
            topic = message.topic(),
            file_path = message.file_path().unwrap_or_default(),
            delivery = ?delivery,
            "Routed message"
        );
        Ok(delivery)
    }

    /// Broadcast a FILE-UPDATE.
    pub async fn file_update(&self, payload: FileUpdatePayload) -> Result<Delivery> {
        self.broadcast(OutboundMessage::FileUpdate(self.enrich(payload)))
            .await
    }

    /// Broadcast a FILE-UPDATE to a previously captured owner set.
    pub async fn file_update_with_owners(
        &self,
        payload: FileUpdatePayload,
        owners: Option<&OwnerEntry>,
    ) -> Result<Delivery> {
        self.route_with_owners(OutboundMessage::FileUpdate(self.enrich(payload)), owners)
            .await
    }

    /// Broadcast a FILE-ERROR.
    pub async fn file_error(
        &self,
        file_path: &str,
        msg: impl Into<String>,
        detail: Option<String>,
    ) -> Result<Delivery> {
        self.broadcast(OutboundMessage::FileError(FileErrorPayload {
            file_path: file_path.to_string(),
            msg: msg.into(),
            detail,
        }))
        .await
    }

    fn enrich(&self, mut payload: FileUpdatePayload) -> FileUpdatePayload {
        if payload.version.is_some() {
            let path = self.layout.cache_path(&payload.file_path);
            payload.osurl = Url::from_file_path(&path).ok().map(String::from);
            payload.ospath = Some(path.to_string_lossy().into_owned());
        }
        payload
    }
}
