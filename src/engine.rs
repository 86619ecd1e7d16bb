//! Session engine
//!
//! [`SessionEngine`] is the one object callers hold. It owns the three
//! execution contexts and everything that runs on them, and exposes the
//! channel, transport and negotiation operations.
//!
//! Threading: every operation that touches the channel registry is
//! marshaled onto the worker context first. Transport state is only
//! touched on the network context, through [`TransportController`].
//! Transceivers are created on the signaling context. Calls made from any
//! of the three contexts, or from an outside thread, are safe.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::call::{Call, RtcEvent};
use crate::channel::{Channel, ChannelId, ChannelRegistry, ChannelStats, MediaChannel, MediaKind};
use crate::clock::{RealClock, SharedClock};
use crate::codec::{self, CodecSetting, NegotiatedStream, SsrcGenerator};
use crate::config::EngineConfig;
use crate::device::{AudioDeviceModule, DeviceEvent, NullAudioDevice};
use crate::error::{ChannelError, Error, Result, TransportError};
use crate::network::{Component, TestClient, TransportController};
use crate::signal::Connection;
use crate::thread::{ContextKind, Dispatcher};
use crate::transceiver::{Direction, Transceiver, TransceiverList};

/// Engine-wide counters and per-channel stats
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub initialized: bool,
    pub channels: Vec<ChannelStats>,
    pub transceivers: usize,
    pub ssrcs_allocated: usize,
    pub device_warnings: u64,
    pub device_errors: u64,
    pub events_logged: u64,
    pub video_bitrate_bps: u32,
}

/// State shared by closures running on the contexts
struct Shared {
    config: EngineConfig,
    registry: ChannelRegistry,
    transports: TransportController,
    transceivers: TransceiverList,
    ssrcs: SsrcGenerator,
    device: Arc<dyn AudioDeviceModule>,
    call: Mutex<Option<Arc<Call>>>,
    initialized: AtomicBool,
    audio_senders: Mutex<BTreeSet<ChannelId>>,
    audio_receivers: Mutex<BTreeSet<ChannelId>>,
    device_warnings: Arc<AtomicU64>,
    device_errors: Arc<AtomicU64>,
}

impl Shared {
    fn call(&self) -> Result<Arc<Call>> {
        self.call.lock().clone().ok_or(Error::NotInitialized)
    }

    fn log(&self, event: RtcEvent) {
        if let Some(call) = self.call.lock().as_ref() {
            call.event_log().log(event);
        }
    }

    fn channel(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.registry
            .find(id)
            .ok_or_else(|| ChannelError::NotFound(id).into())
    }

    fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.device.init()?;
        *self.call.lock() = Some(Arc::new(Call::new(self.config.call.clone())));
        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!("Session engine initialized");
        Ok(())
    }

    fn create_channel(&self, kind: MediaKind) -> Result<ChannelId> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(Error::NotInitialized);
        }
        let channel = self
            .registry
            .create_channel(kind, |id| self.transports.create_pair(id))?;
        self.log(RtcEvent::ChannelCreated {
            channel: channel.id(),
            kind,
        });
        Ok(channel.id())
    }

    fn delete_channel(&self, id: ChannelId) -> Result<()> {
        let Some(channel) = self.registry.delete(id) else {
            return Ok(());
        };

        if channel.is_sending() {
            self.release_sender(&channel)?;
        }
        if channel.is_receiving() {
            self.release_receiver(&channel)?;
        }
        let unbound = self.transceivers.unbind_channel(id);
        self.transports.destroy(id)?;

        tracing::debug!(channel = id, unbound, "Channel resources released");
        self.log(RtcEvent::ChannelDeleted { channel: id });
        Ok(())
    }

    fn start_send(&self, id: ChannelId) -> Result<()> {
        let channel = self.channel(id)?;
        if channel.is_sending() {
            return Ok(());
        }

        match channel.kind() {
            MediaKind::Audio => {
                let mut senders = self.audio_senders.lock();
                if senders.is_empty() {
                    self.device.start_recording()?;
                }
                senders.insert(id);
            }
            MediaKind::Video => {
                let bitrate = self.call()?.bitrate_allocator().add_sender(id);
                self.apply_video_bitrate(bitrate);
            }
        }

        self.transports.set_writable(id, true)?;
        channel.set_sending(true);
        self.log(RtcEvent::SendStateChanged {
            channel: id,
            sending: true,
        });
        Ok(())
    }

    fn stop_send(&self, id: ChannelId) -> Result<()> {
        let channel = self.channel(id)?;
        if !channel.is_sending() {
            return Ok(());
        }
        self.release_sender(&channel)?;
        self.log(RtcEvent::SendStateChanged {
            channel: id,
            sending: false,
        });
        Ok(())
    }

    fn release_sender(&self, channel: &Channel) -> Result<()> {
        let id = channel.id();
        self.transports.set_writable(id, false)?;
        channel.set_sending(false);

        match channel.kind() {
            MediaKind::Audio => {
                let mut senders = self.audio_senders.lock();
                if senders.remove(&id) && senders.is_empty() {
                    self.device.stop_recording()?;
                }
            }
            MediaKind::Video => {
                let bitrate = self.call()?.bitrate_allocator().remove_sender(id);
                self.apply_video_bitrate(bitrate);
            }
        }
        Ok(())
    }

    fn start_receive(&self, id: ChannelId) -> Result<()> {
        let channel = self.channel(id)?;
        if channel.is_receiving() {
            return Ok(());
        }

        match channel.kind() {
            MediaKind::Audio => {
                let mut receivers = self.audio_receivers.lock();
                if receivers.is_empty() {
                    self.device.start_playout()?;
                }
                receivers.insert(id);
            }
            MediaKind::Video => self.setup_video_receiver(&channel)?,
        }

        self.transports.set_receiving(id, true)?;
        channel.set_receiving(true);
        self.log(RtcEvent::ReceiveStateChanged {
            channel: id,
            receiving: true,
        });
        Ok(())
    }

    /// Point the bound receiver at the channel's first local SSRC
    fn setup_video_receiver(&self, channel: &Channel) -> Result<()> {
        let id = channel.id();
        let transceiver = self
            .transceivers
            .find_by_channel(id)
            .ok_or(ChannelError::NoTransceiver(id))?;
        let ssrc = channel
            .local_content()
            .and_then(|content| content.first_ssrc())
            .ok_or(ChannelError::NoLocalStream(id))?;

        let previous = transceiver.receiver().set_ssrc(ssrc);
        tracing::debug!(channel = id, ssrc, ?previous, "Video receiver set up");
        Ok(())
    }

    fn stop_receive(&self, id: ChannelId) -> Result<()> {
        let channel = self.channel(id)?;
        if !channel.is_receiving() {
            return Ok(());
        }
        self.release_receiver(&channel)?;
        self.log(RtcEvent::ReceiveStateChanged {
            channel: id,
            receiving: false,
        });
        Ok(())
    }

    fn release_receiver(&self, channel: &Channel) -> Result<()> {
        let id = channel.id();
        self.transports.set_receiving(id, false)?;
        channel.set_receiving(false);

        if channel.kind() == MediaKind::Audio {
            let mut receivers = self.audio_receivers.lock();
            if receivers.remove(&id) && receivers.is_empty() {
                self.device.stop_playout()?;
            }
        }
        Ok(())
    }

    fn apply_video_bitrate(&self, bitrate: u32) {
        let Ok(call) = self.call() else {
            return;
        };
        let senders = call.bitrate_allocator().senders();
        for id in &senders {
            if let Some(channel) = self.registry.find(*id) {
                if let MediaChannel::Video(video) = channel.media() {
                    video.set_target_bitrate_bps(u64::from(bitrate));
                }
            }
        }
        call.event_log().log(RtcEvent::BitrateAllocated {
            bitrate_bps: bitrate,
            senders: senders.len(),
        });
    }

    fn negotiated(&self, id: ChannelId, stream: &NegotiatedStream) {
        self.log(RtcEvent::CodecNegotiated {
            channel: id,
            codec: stream.codec.name().to_string(),
            ssrc: stream.local_ssrc,
        });
    }

    fn send(&self, id: ChannelId, component: Component, payload: Bytes) -> Result<usize> {
        let channel = self.channel(id)?;
        if !channel.is_sending() {
            return Err(ChannelError::NotSending(id).into());
        }
        let sent = self.transports.send(id, component, payload)?;
        channel.record_sent(component, sent);
        Ok(sent)
    }

    fn stats(&self) -> EngineStats {
        let call = self.call.lock().clone();
        EngineStats {
            initialized: self.initialized.load(Ordering::SeqCst),
            channels: self.registry.channels().iter().map(|c| c.stats()).collect(),
            transceivers: self.transceivers.len(),
            ssrcs_allocated: self.ssrcs.len(),
            device_warnings: self.device_warnings.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            events_logged: call.as_ref().map_or(0, |c| c.event_log().len()),
            video_bitrate_bps: call.as_ref().map_or(0, |c| c.bitrate_allocator().allocation()),
        }
    }
}

/// The media session engine
///
/// Field order is drop order: shared state goes first, the contexts that
/// ran it go last.
pub struct SessionEngine {
    shared: Arc<Shared>,
    _device_events: Connection,
    dispatcher: Dispatcher,
}

impl SessionEngine {
    /// Build an engine with the null audio device and the wall clock
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(NullAudioDevice::new()), RealClock::shared())
    }

    pub fn with_parts(
        config: EngineConfig,
        device: Arc<dyn AudioDeviceModule>,
        clock: SharedClock,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::new()?;
        let transports = TransportController::new(dispatcher.network(), clock, config.transport.clone());

        let device_warnings = Arc::new(AtomicU64::new(0));
        let device_errors = Arc::new(AtomicU64::new(0));
        let warnings = device_warnings.clone();
        let errors = device_errors.clone();
        let device_events = device.events().connect(move |event| match event {
            DeviceEvent::Warning(code) => {
                warnings.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(code = code.code(), "Audio device warning");
            }
            DeviceEvent::Error(e) => {
                errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(code = e.status_code().code(), "Audio device error: {}", e);
            }
        });

        let shared = Arc::new(Shared {
            config,
            registry: ChannelRegistry::new(),
            transports,
            transceivers: TransceiverList::new(),
            ssrcs: SsrcGenerator::new(),
            device,
            call: Mutex::new(None),
            initialized: AtomicBool::new(false),
            audio_senders: Mutex::new(BTreeSet::new()),
            audio_receivers: Mutex::new(BTreeSet::new()),
            device_warnings,
            device_errors,
        });

        Ok(Self {
            shared,
            _device_events: device_events,
            dispatcher,
        })
    }

    fn on<R, F>(&self, kind: ContextKind, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Shared) -> Result<R> + Send + 'static,
    {
        let shared = self.shared.clone();
        self.dispatcher.run_on(kind, move || f(&shared))?
    }

    fn on_worker<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Shared) -> Result<R> + Send + 'static,
    {
        self.on(ContextKind::Worker, f)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn device(&self) -> &Arc<dyn AudioDeviceModule> {
        &self.shared.device
    }

    /// Initialize the device and create the call. Safe to call twice.
    pub fn initialize(&self) -> Result<()> {
        self.on_worker(|shared| shared.initialize())
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// Create a channel with its RTP/RTCP transport pair and return its id
    pub fn create_channel(&self, kind: MediaKind) -> Result<ChannelId> {
        self.on_worker(move |shared| shared.create_channel(kind))
    }

    /// Delete a channel. Unknown ids are a logged no-op.
    pub fn delete_channel(&self, id: ChannelId) -> Result<()> {
        self.on_worker(move |shared| shared.delete_channel(id))
    }

    pub fn channel(&self, id: ChannelId) -> Result<Arc<Channel>> {
        self.on_worker(move |shared| shared.channel(id))
    }

    pub fn channel_ids(&self) -> Result<Vec<ChannelId>> {
        self.on_worker(|shared| Ok(shared.registry.ids()))
    }

    /// Bind the channel's RTP and RTCP sockets on the configured local
    /// address. Port 0 picks an ephemeral port. Returns the bound addresses.
    pub fn set_local_address(
        &self,
        id: ChannelId,
        rtp_port: u16,
        rtcp_port: u16,
        is_ipv6: bool,
    ) -> Result<(SocketAddr, SocketAddr)> {
        self.on_worker(move |shared| {
            shared.channel(id)?;
            let ip = shared.config.network.bind_ip(is_ipv6);
            shared.transports.create_rtp_rtcp_client(
                id,
                SocketAddr::new(ip, rtp_port),
                SocketAddr::new(ip, rtcp_port),
            )
        })
    }

    pub fn set_remote_address(
        &self,
        id: ChannelId,
        rtp_addr: &str,
        rtp_port: u16,
        rtcp_addr: &str,
        rtcp_port: u16,
    ) -> Result<()> {
        let rtp = parse_addr(rtp_addr, rtp_port)?;
        let rtcp = parse_addr(rtcp_addr, rtcp_port)?;
        self.on_worker(move |shared| {
            shared.channel(id)?;
            shared.transports.set_remote_address(id, rtp, rtcp)
        })
    }

    pub fn start_send(&self, id: ChannelId) -> Result<()> {
        self.on_worker(move |shared| shared.start_send(id))
    }

    pub fn stop_send(&self, id: ChannelId) -> Result<()> {
        self.on_worker(move |shared| shared.stop_send(id))
    }

    pub fn start_receive(&self, id: ChannelId) -> Result<()> {
        self.on_worker(move |shared| shared.start_receive(id))
    }

    pub fn stop_receive(&self, id: ChannelId) -> Result<()> {
        self.on_worker(move |shared| shared.stop_receive(id))
    }

    /// Bind a new transceiver to a channel. Returns the transceiver's mid.
    pub fn add_transceiver(&self, id: ChannelId, direction: Direction) -> Result<String> {
        self.on(ContextKind::Signaling, move |shared| {
            let channel = shared.channel(id)?;
            let transceiver = Arc::new(Transceiver::new(channel.kind(), direction));
            transceiver.set_channel(Some(id));
            let mid = transceiver.mid().to_string();
            shared.transceivers.add(transceiver);
            tracing::debug!(channel = id, %mid, ?direction, "Transceiver added");
            Ok(mid)
        })
    }

    /// Negotiate `setting` on a channel with a generated SSRC
    pub fn set_codec(&self, id: ChannelId, setting: CodecSetting) -> Result<NegotiatedStream> {
        self.on_worker(move |shared| {
            let channel = shared.channel(id)?;
            let stream = codec::set_codec(&channel, &shared.transceivers, &shared.ssrcs, &setting)?;
            shared.negotiated(id, &stream);
            Ok(stream)
        })
    }

    /// Install explicit SSRCs on a channel
    pub fn set_ssrc(&self, id: ChannelId, local_ssrc: u32, remote_ssrc: u32) -> Result<NegotiatedStream> {
        self.on_worker(move |shared| {
            let channel = shared.channel(id)?;
            let stream = codec::set_ssrc(&channel, &shared.transceivers, &shared.ssrcs, local_ssrc, remote_ssrc)?;
            shared.negotiated(id, &stream);
            Ok(stream)
        })
    }

    /// Accepted for API parity; the receive side follows the send codec
    pub fn set_receive_codec(&self, id: ChannelId, setting: CodecSetting) -> Result<()> {
        self.on_worker(move |_| {
            tracing::debug!(channel = id, codec = %setting.name, "Receive codec request ignored");
            Ok(())
        })
    }

    /// Accepted for API parity; remote video SSRCs come from `set_ssrc`
    pub fn request_remote_video_ssrc(&self, id: ChannelId, ssrc: u32) -> Result<()> {
        self.on_worker(move |_| {
            tracing::debug!(channel = id, ssrc, "Remote video SSRC request ignored");
            Ok(())
        })
    }

    pub fn send_rtp(&self, id: ChannelId, payload: Bytes) -> Result<usize> {
        self.on_worker(move |shared| shared.send(id, Component::Rtp, payload))
    }

    pub fn send_rtcp(&self, id: ChannelId, payload: Bytes) -> Result<usize> {
        self.on_worker(move |shared| shared.send(id, Component::Rtcp, payload))
    }

    /// Attach an inspection client to one of a channel's endpoints, using
    /// the configured test-client timeouts
    pub fn test_client(&self, id: ChannelId, component: Component) -> Result<TestClient> {
        self.on_worker(move |shared| {
            let channel = shared.channel(id)?;
            let endpoint = channel
                .transport()
                .endpoint(component)
                .cloned()
                .ok_or(TransportError::Absent(component.name()))?;
            Ok(TestClient::with_config(endpoint, &shared.config.test_client))
        })
    }

    pub fn channel_stats(&self, id: ChannelId) -> Result<ChannelStats> {
        self.on_worker(move |shared| Ok(shared.channel(id)?.stats()))
    }

    pub fn stats(&self) -> Result<EngineStats> {
        self.on_worker(|shared| Ok(shared.stats()))
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        let result = self.on_worker(|shared| {
            for id in shared.registry.ids() {
                shared.delete_channel(id)?;
            }
            Ok(())
        });
        if let Err(e) = result {
            tracing::warn!("Engine teardown incomplete: {}", e);
        }
    }
}

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ChannelError::InvalidParameter(format!("invalid IP address: {}", ip)))?;
    Ok(SocketAddr::new(ip, port))
}
