//! Call-level services shared by all channels
//!
//! A [`Call`] is created once during engine initialization on the worker
//! context. It carries the RTC event log and the video bitrate allocator.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::channel::{ChannelId, MediaKind};
use crate::config::CallConfig;

/// Events recorded in the RTC event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RtcEvent {
    ChannelCreated { channel: ChannelId, kind: MediaKind },
    ChannelDeleted { channel: ChannelId },
    SendStateChanged { channel: ChannelId, sending: bool },
    ReceiveStateChanged { channel: ChannelId, receiving: bool },
    CodecNegotiated { channel: ChannelId, codec: String, ssrc: u32 },
    BitrateAllocated { bitrate_bps: u32, senders: usize },
}

/// Structured event sink on the `rtc_event_log` tracing target
#[derive(Debug, Default)]
pub struct EventLog {
    count: AtomicU64,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self, event: RtcEvent) {
        self.count.fetch_add(1, Ordering::Relaxed);
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "rtc_event_log", event = %json),
            Err(e) => tracing::warn!(target: "rtc_event_log", "Unserializable event {:?}: {}", event, e),
        }
    }

    /// Events logged so far
    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits the configured bitrate across the active video senders
#[derive(Debug)]
pub struct BitrateAllocator {
    config: CallConfig,
    senders: Mutex<BTreeSet<ChannelId>>,
}

impl BitrateAllocator {
    pub fn new(config: CallConfig) -> Self {
        Self {
            config,
            senders: Mutex::new(BTreeSet::new()),
        }
    }

    /// Per-sender bitrate. With no senders this is the start bitrate.
    pub fn allocation(&self) -> u32 {
        let count = self.senders.lock().len() as u32;
        self.allocation_for(count)
    }

    fn allocation_for(&self, count: u32) -> u32 {
        if count == 0 {
            return self.config.start_bitrate_bps;
        }
        (self.config.max_bitrate_bps / count).max(self.config.min_bitrate_bps)
    }

    /// Add a sender and return the new per-sender allocation
    pub fn add_sender(&self, channel: ChannelId) -> u32 {
        let mut senders = self.senders.lock();
        senders.insert(channel);
        self.allocation_for(senders.len() as u32)
    }

    pub fn remove_sender(&self, channel: ChannelId) -> u32 {
        let mut senders = self.senders.lock();
        senders.remove(&channel);
        self.allocation_for(senders.len() as u32)
    }

    pub fn senders(&self) -> Vec<ChannelId> {
        self.senders.lock().iter().copied().collect()
    }
}

/// Per-engine call object
#[derive(Debug)]
pub struct Call {
    event_log: EventLog,
    bitrate: BitrateAllocator,
}

impl Call {
    pub fn new(config: CallConfig) -> Self {
        tracing::debug!(
            start = config.start_bitrate_bps,
            min = config.min_bitrate_bps,
            max = config.max_bitrate_bps,
            "Call created"
        );
        Self {
            event_log: EventLog::new(),
            bitrate: BitrateAllocator::new(config),
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.event_log
    }

    pub fn bitrate_allocator(&self) -> &BitrateAllocator {
        &self.bitrate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_splits_and_clamps() {
        let allocator = BitrateAllocator::new(CallConfig {
            start_bitrate_bps: 300_000,
            min_bitrate_bps: 400_000,
            max_bitrate_bps: 1_000_000,
        });
        assert_eq!(allocator.allocation(), 300_000);
        assert_eq!(allocator.add_sender(1), 1_000_000);
        assert_eq!(allocator.add_sender(2), 500_000);
        assert_eq!(allocator.add_sender(3), 400_000);
        assert_eq!(allocator.add_sender(3), 400_000);
        assert_eq!(allocator.remove_sender(1), 500_000);
        assert_eq!(allocator.senders(), vec![2, 3]);
    }

    #[test]
    fn test_event_log_counts() {
        let log = EventLog::new();
        assert!(log.is_empty());
        log.log(RtcEvent::ChannelCreated {
            channel: 0,
            kind: MediaKind::Audio,
        });
        log.log(RtcEvent::ChannelDeleted { channel: 0 });
        assert_eq!(log.len(), 2);
    }
}
