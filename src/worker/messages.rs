//! Messages exchanged with the frame cache worker.
//!
//! Both directions are internally tagged by a `type` field, e.g.
//! `{"type": "cache_sticker", "id": "s1", "src": "wave.gif", "width": 64}`.

use bytes::Bytes;
use mediaferry_common::StickerId;
use mediaferry_media::FrameHeader;
use serde::{Deserialize, Serialize};

/// Inbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Rasterize every frame of `src` into `width`x`width` frames.
    CacheSticker {
        id: StickerId,
        src: String,
        width: u16,
    },
    /// Any message type the worker does not know. Ignored.
    #[serde(other)]
    Unknown,
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// One compressed frame. Sent in increasing `frame` order.
    CachedFrame {
        id: StickerId,
        frame: u16,
        data: Bytes,
        header: FrameHeader,
    },
    /// Every frame of `id` was sent.
    CacheComplete { id: StickerId },
    /// Loading or rendering `id` failed; no further frames follow.
    CacheFailed { id: StickerId, error: String },
}

impl WorkerMessage {
    pub fn sticker_id(&self) -> &StickerId {
        match self {
            Self::CachedFrame { id, .. }
            | Self::CacheComplete { id }
            | Self::CacheFailed { id, .. } => id,
        }
    }

    /// Whether this is the last message for its sticker.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CacheComplete { .. } | Self::CacheFailed { .. })
    }
}
