//! Audio and video channels
//!
//! A [`Channel`] wraps the media engine's per-session endpoint: it holds the
//! negotiated local/remote content, the send and receive streams, and the
//! RTP/RTCP transport pair its packets travel on. The kind-specific part is
//! the [`MediaChannel`] variant.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::channel::{ChannelId, MediaKind};
use crate::codec::{AudioCodec, Codec, MediaContentDescription, StreamParams, VideoCodec};
use crate::error::CodecError;
use crate::network::transport::{Component, DtlsSrtpTransport};
use crate::network::ReceivedPacket;
use crate::signal::Connection;

/// Audio specific channel state
#[derive(Debug, Default)]
pub struct AudioChannel {
    send_codec: Mutex<Option<AudioCodec>>,
}

impl AudioChannel {
    pub fn send_codec(&self) -> Option<AudioCodec> {
        self.send_codec.lock().clone()
    }
}

/// Video specific channel state
#[derive(Debug, Default)]
pub struct VideoChannel {
    send_codec: Mutex<Option<VideoCodec>>,
    target_bitrate_bps: AtomicU64,
}

impl VideoChannel {
    pub fn send_codec(&self) -> Option<VideoCodec> {
        self.send_codec.lock().clone()
    }

    /// Bitrate handed out by the call's allocator
    pub fn target_bitrate_bps(&self) -> u64 {
        self.target_bitrate_bps.load(Ordering::Relaxed)
    }

    pub fn set_target_bitrate_bps(&self, bps: u64) {
        self.target_bitrate_bps.store(bps, Ordering::Relaxed);
    }
}

/// Kind-specific half of a channel
#[derive(Debug)]
pub enum MediaChannel {
    Audio(AudioChannel),
    Video(VideoChannel),
}

impl MediaChannel {
    pub fn new(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaChannel::Audio(AudioChannel::default()),
            MediaKind::Video => MediaChannel::Video(VideoChannel::default()),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaChannel::Audio(_) => MediaKind::Audio,
            MediaChannel::Video(_) => MediaKind::Video,
        }
    }

    /// Install the send codec; the codec must match the channel kind
    pub fn set_send_codec(&self, codec: &Codec) -> Result<(), CodecError> {
        match (self, codec) {
            (MediaChannel::Audio(audio), Codec::Audio(c)) => {
                *audio.send_codec.lock() = Some(c.clone());
                Ok(())
            }
            (MediaChannel::Video(video), Codec::Video(c)) => {
                *video.send_codec.lock() = Some(c.clone());
                Ok(())
            }
            (channel, codec) => Err(CodecError::KindMismatch(format!(
                "{} codec on {} channel",
                codec.kind(),
                channel.kind()
            ))),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    local_content: Option<MediaContentDescription>,
    remote_content: Option<MediaContentDescription>,
    send_streams: Vec<StreamParams>,
    recv_streams: Vec<StreamParams>,
    enabled: bool,
    sending: bool,
    receiving: bool,
}

#[derive(Default)]
struct Counters {
    rtp_sent: AtomicU64,
    rtcp_sent: AtomicU64,
    bytes_sent: AtomicU64,
    rtp_received: AtomicU64,
    rtcp_received: AtomicU64,
    bytes_received: AtomicU64,
}

/// Channel counters and flags
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStats {
    pub id: ChannelId,
    pub kind: MediaKind,
    pub enabled: bool,
    pub sending: bool,
    pub receiving: bool,
    pub send_ssrcs: Vec<u32>,
    pub recv_ssrcs: Vec<u32>,
    pub rtp_packets_sent: u64,
    pub rtcp_packets_sent: u64,
    pub bytes_sent: u64,
    pub rtp_packets_received: u64,
    pub rtcp_packets_received: u64,
    pub bytes_received: u64,
}

/// One audio or video channel
pub struct Channel {
    id: ChannelId,
    media: MediaChannel,
    transport: Arc<DtlsSrtpTransport>,
    state: Mutex<ChannelState>,
    counters: Counters,
    connections: Mutex<Vec<Connection>>,
}

impl Channel {
    /// Create a channel and hook its media sink to the transport pair
    pub fn new(id: ChannelId, kind: MediaKind, transport: Arc<DtlsSrtpTransport>) -> Arc<Self> {
        let channel = Arc::new(Self {
            id,
            media: MediaChannel::new(kind),
            transport,
            state: Mutex::new(ChannelState::default()),
            counters: Counters::default(),
            connections: Mutex::new(Vec::new()),
        });
        channel.connect_transport();
        channel
    }

    fn connect_transport(self: &Arc<Self>) {
        let mut connections = Vec::new();
        for component in [Component::Rtp, Component::Rtcp] {
            if let Some(endpoint) = self.transport.endpoint(component) {
                let weak: Weak<Self> = Arc::downgrade(self);
                connections.push(endpoint.signals().read_packet.connect(move |packet| {
                    if let Some(channel) = weak.upgrade() {
                        channel.on_packet_received(component, packet);
                    }
                }));
            }
        }
        *self.connections.lock() = connections;
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.media.kind()
    }

    pub fn media(&self) -> &MediaChannel {
        &self.media
    }

    pub fn transport(&self) -> &Arc<DtlsSrtpTransport> {
        &self.transport
    }

    pub fn set_local_content(&self, content: MediaContentDescription) -> Result<(), CodecError> {
        if let Some(codec) = content.codecs.first() {
            self.media.set_send_codec(codec)?;
        }
        let mut state = self.state.lock();
        state.send_streams = content.streams.clone();
        state.local_content = Some(content);
        Ok(())
    }

    pub fn set_remote_content(&self, content: MediaContentDescription) -> Result<(), CodecError> {
        if let Some(codec) = content.codecs.first() {
            if codec.kind() != self.kind() {
                return Err(CodecError::KindMismatch(format!(
                    "remote {} content on {} channel",
                    codec.kind(),
                    self.kind()
                )));
            }
        }
        self.state.lock().remote_content = Some(content);
        Ok(())
    }

    pub fn local_content(&self) -> Option<MediaContentDescription> {
        self.state.lock().local_content.clone()
    }

    pub fn remote_content(&self) -> Option<MediaContentDescription> {
        self.state.lock().remote_content.clone()
    }

    pub fn add_send_stream(&self, stream: StreamParams) -> bool {
        let mut state = self.state.lock();
        if state.send_streams.iter().any(|s| s.shares_ssrc(&stream)) {
            return false;
        }
        state.send_streams.push(stream);
        true
    }

    /// Register a stream the media sink accepts. False if its SSRC is taken.
    pub fn add_recv_stream(&self, stream: StreamParams) -> bool {
        let mut state = self.state.lock();
        if state.recv_streams.iter().any(|s| s.shares_ssrc(&stream)) {
            return false;
        }
        tracing::debug!(channel = self.id, ssrcs = ?stream.ssrcs, "Receive stream added");
        state.recv_streams.push(stream);
        true
    }

    pub fn remove_recv_stream(&self, ssrc: u32) -> bool {
        let mut state = self.state.lock();
        let before = state.recv_streams.len();
        state.recv_streams.retain(|s| !s.has_ssrc(ssrc));
        state.recv_streams.len() != before
    }

    pub fn send_ssrcs(&self) -> Vec<u32> {
        self.state
            .lock()
            .send_streams
            .iter()
            .flat_map(|s| s.ssrcs.iter().copied())
            .collect()
    }

    pub fn recv_ssrcs(&self) -> Vec<u32> {
        self.state
            .lock()
            .recv_streams
            .iter()
            .flat_map(|s| s.ssrcs.iter().copied())
            .collect()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Returns whether the flag changed
    pub fn set_sending(&self, sending: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.sending != sending;
        state.sending = sending;
        state.enabled = state.sending || state.receiving;
        changed
    }

    pub fn is_sending(&self) -> bool {
        self.state.lock().sending
    }

    /// Returns whether the flag changed
    pub fn set_receiving(&self, receiving: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.receiving != receiving;
        state.receiving = receiving;
        state.enabled = state.sending || state.receiving;
        changed
    }

    pub fn is_receiving(&self) -> bool {
        self.state.lock().receiving
    }

    pub fn record_sent(&self, component: Component, bytes: usize) {
        match component {
            Component::Rtp => self.counters.rtp_sent.fetch_add(1, Ordering::Relaxed),
            Component::Rtcp => self.counters.rtcp_sent.fetch_add(1, Ordering::Relaxed),
        };
        self.counters
            .bytes_sent
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Media sink entry point, called on the network context
    pub fn on_packet_received(&self, component: Component, packet: &ReceivedPacket) {
        if !self.is_receiving() {
            return;
        }
        match component {
            Component::Rtp => self.counters.rtp_received.fetch_add(1, Ordering::Relaxed),
            Component::Rtcp => self.counters.rtcp_received.fetch_add(1, Ordering::Relaxed),
        };
        self.counters
            .bytes_received
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ChannelStats {
        let (enabled, sending, receiving) = {
            let state = self.state.lock();
            (state.enabled, state.sending, state.receiving)
        };
        ChannelStats {
            id: self.id,
            kind: self.kind(),
            enabled,
            sending,
            receiving,
            send_ssrcs: self.send_ssrcs(),
            recv_ssrcs: self.recv_ssrcs(),
            rtp_packets_sent: self.counters.rtp_sent.load(Ordering::Relaxed),
            rtcp_packets_sent: self.counters.rtcp_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            rtp_packets_received: self.counters.rtp_received.load(Ordering::Relaxed),
            rtcp_packets_received: self.counters.rtcp_received.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("transport", &self.transport.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RealClock;
    use crate::codec::{default_audio_codecs, default_video_codecs};
    use crate::network::transport::DtlsTransport;
    use crate::network::PacketTransport;
    use crate::thread::{Context, ContextKind};
    use bytes::Bytes;

    fn pair(ctx: &Context) -> Arc<DtlsSrtpTransport> {
        let rtp = PacketTransport::new("rtp", ctx.handle(), RealClock::shared());
        let rtcp = PacketTransport::new("rtcp", ctx.handle(), RealClock::shared());
        Arc::new(DtlsSrtpTransport::new(
            "test",
            Some(DtlsTransport::new(Component::Rtp, rtp)),
            Some(DtlsTransport::new(Component::Rtcp, rtcp)),
        ))
    }

    #[test]
    fn test_send_codec_must_match_kind() {
        let media = MediaChannel::new(MediaKind::Audio);
        let opus = Codec::Audio(default_audio_codecs()[0].clone());
        let vp8 = Codec::Video(default_video_codecs()[0].clone());

        assert!(media.set_send_codec(&opus).is_ok());
        assert!(matches!(
            media.set_send_codec(&vp8),
            Err(CodecError::KindMismatch(_))
        ));
    }

    #[test]
    fn test_recv_stream_ssrc_unique() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let channel = Channel::new(0, MediaKind::Audio, pair(&ctx));

        assert!(channel.add_recv_stream(StreamParams::with_ssrc(1234, "a")));
        assert!(!channel.add_recv_stream(StreamParams::with_ssrc(1234, "b")));
        assert_eq!(channel.recv_ssrcs(), vec![1234]);

        assert!(channel.remove_recv_stream(1234));
        assert!(channel.recv_ssrcs().is_empty());
    }

    #[test]
    fn test_enabled_follows_send_and_receive() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let channel = Channel::new(0, MediaKind::Video, pair(&ctx));
        assert!(!channel.is_enabled());

        assert!(channel.set_sending(true));
        assert!(!channel.set_sending(true));
        assert!(channel.is_enabled());

        channel.set_receiving(true);
        channel.set_sending(false);
        assert!(channel.is_enabled());

        channel.set_receiving(false);
        assert!(!channel.is_enabled());
    }

    #[test]
    fn test_media_sink_counts_only_while_receiving() {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let transport = pair(&ctx);
        let channel = Channel::new(0, MediaKind::Audio, transport.clone());
        let rtp = transport.rtp().unwrap().clone();

        let from = "127.0.0.1:7000".parse().unwrap();
        rtp.on_read_packet(Bytes::from_static(b"early"), from, 1);
        assert_eq!(channel.stats().rtp_packets_received, 0);

        channel.set_receiving(true);
        rtp.on_read_packet(Bytes::from_static(b"media"), from, 2);
        let stats = channel.stats();
        assert_eq!(stats.rtp_packets_received, 1);
        assert_eq!(stats.bytes_received, 5);
    }
}
