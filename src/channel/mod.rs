//! Media channels and the channel registry

pub mod media_channel;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use media_channel::{AudioChannel, Channel, ChannelStats, MediaChannel, VideoChannel};
pub use registry::ChannelRegistry;

/// Channel identifier. Allocated by the registry, never reused.
pub type ChannelId = i32;

/// Media type carried by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}
