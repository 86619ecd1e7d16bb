//! RTP transceivers
//!
//! A transceiver pairs a sender and a receiver and points at the channel
//! carrying their media. The channel reference is a plain id: the registry
//! owns channels, transceivers only look them up.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::channel::{ChannelId, MediaKind};
use crate::codec::Codec;

/// Media direction of a transceiver or content section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn sends(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn receives(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }

    /// Direction as seen from the other end
    pub fn reversed(self) -> Self {
        match self {
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            other => other,
        }
    }
}

#[derive(Debug, Default)]
struct SenderState {
    ssrc: Option<u32>,
    stream_ids: Vec<String>,
    codec: Option<Codec>,
}

/// Outbound half of a transceiver
#[derive(Debug)]
pub struct RtpSender {
    kind: MediaKind,
    state: Mutex<SenderState>,
}

impl RtpSender {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            state: Mutex::new(SenderState::default()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.state.lock().ssrc
    }

    pub fn stream_ids(&self) -> Vec<String> {
        self.state.lock().stream_ids.clone()
    }

    pub fn codec(&self) -> Option<Codec> {
        self.state.lock().codec.clone()
    }

    /// Apply a negotiated SSRC, stream ids and codec. Returns the previous SSRC.
    pub fn set_parameters(&self, ssrc: u32, stream_ids: Vec<String>, codec: Option<Codec>) -> Option<u32> {
        let mut state = self.state.lock();
        let previous = state.ssrc.replace(ssrc);
        state.stream_ids = stream_ids;
        if codec.is_some() {
            state.codec = codec;
        }
        previous
    }
}

/// Inbound half of a transceiver
#[derive(Debug)]
pub struct RtpReceiver {
    kind: MediaKind,
    ssrc: Mutex<Option<u32>>,
}

impl RtpReceiver {
    fn new(kind: MediaKind) -> Self {
        Self {
            kind,
            ssrc: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn ssrc(&self) -> Option<u32> {
        *self.ssrc.lock()
    }

    pub fn set_ssrc(&self, ssrc: u32) -> Option<u32> {
        self.ssrc.lock().replace(ssrc)
    }
}

/// Sender + receiver bound to at most one channel
#[derive(Debug)]
pub struct Transceiver {
    mid: String,
    kind: MediaKind,
    sender: RtpSender,
    receiver: RtpReceiver,
    channel: Mutex<Option<ChannelId>>,
    direction: Mutex<Direction>,
}

impl Transceiver {
    pub fn new(kind: MediaKind, direction: Direction) -> Self {
        Self {
            mid: Uuid::new_v4().simple().to_string(),
            kind,
            sender: RtpSender::new(kind),
            receiver: RtpReceiver::new(kind),
            channel: Mutex::new(None),
            direction: Mutex::new(direction),
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn sender(&self) -> &RtpSender {
        &self.sender
    }

    pub fn receiver(&self) -> &RtpReceiver {
        &self.receiver
    }

    pub fn channel(&self) -> Option<ChannelId> {
        *self.channel.lock()
    }

    pub fn set_channel(&self, channel: Option<ChannelId>) {
        *self.channel.lock() = channel;
    }

    pub fn direction(&self) -> Direction {
        *self.direction.lock()
    }

    pub fn set_direction(&self, direction: Direction) {
        *self.direction.lock() = direction;
    }
}

/// The engine's transceivers, in creation order
#[derive(Debug, Default)]
pub struct TransceiverList {
    items: Mutex<Vec<Arc<Transceiver>>>,
}

impl TransceiverList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, transceiver: Arc<Transceiver>) {
        self.items.lock().push(transceiver);
    }

    /// First transceiver whose channel is `channel`
    pub fn find_by_channel(&self, channel: ChannelId) -> Option<Arc<Transceiver>> {
        self.items
            .lock()
            .iter()
            .find(|t| t.channel() == Some(channel))
            .cloned()
    }

    /// Clear every back-reference to `channel`. Returns how many were bound.
    pub fn unbind_channel(&self, channel: ChannelId) -> usize {
        let items = self.items.lock();
        let mut count = 0;
        for transceiver in items.iter().filter(|t| t.channel() == Some(channel)) {
            transceiver.set_channel(None);
            count += 1;
        }
        count
    }

    pub fn all(&self) -> Vec<Arc<Transceiver>> {
        self.items.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        assert!(Direction::SendRecv.sends() && Direction::SendRecv.receives());
        assert!(Direction::SendOnly.sends() && !Direction::SendOnly.receives());
        assert!(!Direction::Inactive.sends() && !Direction::Inactive.receives());
        assert_eq!(Direction::RecvOnly.reversed(), Direction::SendOnly);
        assert_eq!(Direction::SendRecv.reversed(), Direction::SendRecv);
    }

    #[test]
    fn test_find_and_unbind() {
        let list = TransceiverList::new();
        let a = Arc::new(Transceiver::new(MediaKind::Audio, Direction::SendRecv));
        let b = Arc::new(Transceiver::new(MediaKind::Video, Direction::SendOnly));
        a.set_channel(Some(1));
        b.set_channel(Some(2));
        list.add(a.clone());
        list.add(b);

        assert_eq!(list.find_by_channel(1).unwrap().mid(), a.mid());
        assert!(list.find_by_channel(3).is_none());

        assert_eq!(list.unbind_channel(1), 1);
        assert!(list.find_by_channel(1).is_none());
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_sender_returns_previous_ssrc() {
        let t = Transceiver::new(MediaKind::Audio, Direction::SendRecv);
        assert_eq!(t.sender().set_parameters(10, vec!["s".into()], None), None);
        assert_eq!(t.sender().set_parameters(11, vec![], None), Some(10));
        assert_eq!(t.sender().ssrc(), Some(11));
    }
}
