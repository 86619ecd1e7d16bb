//! RTP/RTCP transport pairs and their wiring
//!
//! Every channel gets one [`DtlsSrtpTransport`]: an RTP and an RTCP
//! [`PacketTransport`], each behind a [`DtlsTransport`]. The DTLS layer is a
//! pass-through; it exists so the shape matches a secured transport and so
//! there is one place to hang encryption later.
//!
//! All functions here expect to run on the network context.
//! [`TransportController`] is the entry point for other contexts: it
//! re-dispatches every call onto the network context before touching state.

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::ChannelId;
use crate::clock::SharedClock;
use crate::config::TransportConfig;
use crate::error::{Error, Result, TransportError};
use crate::network::packet_transport::{PacketOptions, PacketTransport, TransportStats};
use crate::network::udp::SocketOption;
use crate::thread::ContextHandle;

/// Which half of the pair a packet travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Component {
    Rtp,
    Rtcp,
}

impl Component {
    pub fn name(self) -> &'static str {
        match self {
            Component::Rtp => "RTP",
            Component::Rtcp => "RTCP",
        }
    }
}

/// Pass-through DTLS layer over one packet transport
pub struct DtlsTransport {
    component: Component,
    ice: Arc<PacketTransport>,
}

impl DtlsTransport {
    pub fn new(component: Component, ice: Arc<PacketTransport>) -> Self {
        Self { component, ice }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    /// The underlying packet transport
    pub fn ice_transport(&self) -> &Arc<PacketTransport> {
        &self.ice
    }

    pub fn send_packet(&self, data: &[u8], options: PacketOptions) -> std::result::Result<usize, TransportError> {
        self.ice.send_packet(data, options)
    }

    pub fn is_writable(&self) -> bool {
        self.ice.is_writable()
    }
}

/// RTP + RTCP endpoints for one channel
pub struct DtlsSrtpTransport {
    name: String,
    rtp: Option<DtlsTransport>,
    rtcp: Option<DtlsTransport>,
}

/// Snapshot of a pair for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct TransportPairInfo {
    pub name: String,
    pub rtp_local: Option<SocketAddr>,
    pub rtp_remote: Option<SocketAddr>,
    pub rtcp_local: Option<SocketAddr>,
    pub rtcp_remote: Option<SocketAddr>,
    pub writable: bool,
    pub receiving: bool,
    pub rtp_stats: TransportStats,
    pub rtcp_stats: TransportStats,
}

impl DtlsSrtpTransport {
    pub fn new(name: impl Into<String>, rtp: Option<DtlsTransport>, rtcp: Option<DtlsTransport>) -> Self {
        Self {
            name: name.into(),
            rtp,
            rtcp,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rtp(&self) -> Option<&Arc<PacketTransport>> {
        self.rtp.as_ref().map(DtlsTransport::ice_transport)
    }

    pub fn rtcp(&self) -> Option<&Arc<PacketTransport>> {
        self.rtcp.as_ref().map(DtlsTransport::ice_transport)
    }

    pub fn endpoint(&self, component: Component) -> Option<&Arc<PacketTransport>> {
        match component {
            Component::Rtp => self.rtp(),
            Component::Rtcp => self.rtcp(),
        }
    }

    fn both(&self) -> std::result::Result<(&Arc<PacketTransport>, &Arc<PacketTransport>), TransportError> {
        let rtp = self.rtp().ok_or(TransportError::Absent("RTP"))?;
        let rtcp = self.rtcp().ok_or(TransportError::Absent("RTCP"))?;
        Ok((rtp, rtcp))
    }

    /// Send on one component
    pub fn send(&self, component: Component, data: &[u8]) -> std::result::Result<usize, TransportError> {
        let dtls = match component {
            Component::Rtp => self.rtp.as_ref(),
            Component::Rtcp => self.rtcp.as_ref(),
        }
        .ok_or(TransportError::Absent(component.name()))?;
        dtls.send_packet(data, PacketOptions::default())
    }

    pub fn is_writable(&self) -> bool {
        self.rtp().is_some_and(|t| t.is_writable()) && self.rtcp().is_some_and(|t| t.is_writable())
    }

    pub fn info(&self) -> TransportPairInfo {
        TransportPairInfo {
            name: self.name.clone(),
            rtp_local: self.rtp().and_then(|t| t.local_address()),
            rtp_remote: self.rtp().and_then(|t| t.remote_address()),
            rtcp_local: self.rtcp().and_then(|t| t.local_address()),
            rtcp_remote: self.rtcp().and_then(|t| t.remote_address()),
            writable: self.is_writable(),
            receiving: self.rtp().is_some_and(|t| t.is_receiving()),
            rtp_stats: self.rtp().map(|t| t.stats()).unwrap_or_default(),
            rtcp_stats: self.rtcp().map(|t| t.stats()).unwrap_or_default(),
        }
    }

    /// Close both endpoints
    pub fn close(&self) {
        for transport in [self.rtp(), self.rtcp()].into_iter().flatten() {
            transport.close();
        }
    }
}

/// Allocate an RTP and an RTCP endpoint bound together in one container
pub fn create_transport_pair(
    name: &str,
    network: &ContextHandle,
    clock: &SharedClock,
    config: &TransportConfig,
) -> DtlsSrtpTransport {
    debug_assert!(network.is_current(), "transport pairs are created on the network context");

    let make = |component: Component| {
        let transport = PacketTransport::new(
            format!("{}-{}", name, component.name().to_lowercase()),
            network.clone(),
            clock.clone(),
        );
        transport.set_async(config.async_send, config.async_delay());
        let preset = [
            (SocketOption::ReceiveBuffer, config.receive_buffer),
            (SocketOption::SendBuffer, config.send_buffer),
            (SocketOption::Dscp, config.dscp),
        ];
        for (option, value) in preset {
            if let Some(value) = value {
                // Not bound yet, so this only records the value.
                let _ = transport.set_option(option, value);
            }
        }
        DtlsTransport::new(component, transport)
    };

    DtlsSrtpTransport::new(name, Some(make(Component::Rtp)), Some(make(Component::Rtcp)))
}

/// Point RTP at `rtp_addr` and RTCP at `rtcp_addr`
pub fn set_remote_address(
    transport: &DtlsSrtpTransport,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
) -> std::result::Result<(), TransportError> {
    let (rtp, rtcp) = transport.both()?;
    rtp.set_remote_address(rtp_addr);
    rtcp.set_remote_address(rtcp_addr);
    Ok(())
}

/// Toggle writability on both endpoints
pub fn set_writable(transport: &DtlsSrtpTransport, writable: bool) -> std::result::Result<(), TransportError> {
    let (rtp, rtcp) = transport.both()?;
    rtp.set_writable(writable);
    rtcp.set_writable(writable);
    Ok(())
}

/// Toggle receiving on both endpoints
pub fn set_receiving(transport: &DtlsSrtpTransport, receiving: bool) -> std::result::Result<(), TransportError> {
    let (rtp, rtcp) = transport.both()?;
    rtp.set_receiving(receiving);
    rtcp.set_receiving(receiving);
    Ok(())
}

/// Bind a local UDP socket for each endpoint
pub fn create_rtp_rtcp_client(
    transport: &DtlsSrtpTransport,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
) -> std::result::Result<(SocketAddr, SocketAddr), TransportError> {
    let (rtp, rtcp) = transport.both()?;
    let rtp_bound = rtp.create_client(rtp_addr)?;
    let rtcp_bound = rtcp.create_client(rtcp_addr)?;
    Ok((rtp_bound, rtcp_bound))
}

/// Per-channel transport table, driven from any context
pub struct TransportController {
    network: ContextHandle,
    clock: SharedClock,
    config: TransportConfig,
    transports: Arc<DashMap<ChannelId, Arc<DtlsSrtpTransport>>>,
}

impl TransportController {
    pub fn new(network: ContextHandle, clock: SharedClock, config: TransportConfig) -> Self {
        Self {
            network,
            clock,
            config,
            transports: Arc::new(DashMap::new()),
        }
    }

    pub fn network(&self) -> &ContextHandle {
        &self.network
    }

    pub fn get(&self, channel: ChannelId) -> Option<Arc<DtlsSrtpTransport>> {
        self.transports.get(&channel).map(|t| t.value().clone())
    }

    fn lookup(&self, channel: ChannelId) -> Result<Arc<DtlsSrtpTransport>> {
        self.get(channel)
            .ok_or_else(|| TransportError::Absent("RTP/RTCP pair").into())
    }

    /// Create and register the pair for `channel` on the network context
    pub fn create_pair(&self, channel: ChannelId) -> Result<Arc<DtlsSrtpTransport>> {
        let network = self.network.clone();
        let clock = self.clock.clone();
        let config = self.config.clone();
        let transports = self.transports.clone();

        let pair = self.network.invoke(move || {
            let pair = Arc::new(create_transport_pair(
                &format!("channel-{}", channel),
                &network,
                &clock,
                &config,
            ));
            transports.insert(channel, pair.clone());
            pair
        })?;

        tracing::debug!(channel, "Transport pair created");
        Ok(pair)
    }

    /// Close and forget the pair for `channel`
    pub fn destroy(&self, channel: ChannelId) -> Result<bool> {
        let transports = self.transports.clone();
        let removed = self.network.invoke(move || match transports.remove(&channel) {
            Some((_, pair)) => {
                pair.close();
                true
            }
            None => false,
        })?;
        Ok(removed)
    }

    pub fn create_rtp_rtcp_client(
        &self,
        channel: ChannelId,
        rtp_addr: SocketAddr,
        rtcp_addr: SocketAddr,
    ) -> Result<(SocketAddr, SocketAddr)> {
        let pair = self.lookup(channel)?;
        self.network
            .invoke(move || create_rtp_rtcp_client(&pair, rtp_addr, rtcp_addr))?
            .map_err(Error::from)
    }

    pub fn set_remote_address(&self, channel: ChannelId, rtp_addr: SocketAddr, rtcp_addr: SocketAddr) -> Result<()> {
        let pair = self.lookup(channel)?;
        self.network
            .invoke(move || set_remote_address(&pair, rtp_addr, rtcp_addr))?
            .map_err(Error::from)
    }

    pub fn set_writable(&self, channel: ChannelId, writable: bool) -> Result<()> {
        let pair = self.lookup(channel)?;
        self.network
            .invoke(move || set_writable(&pair, writable))?
            .map_err(Error::from)
    }

    pub fn set_receiving(&self, channel: ChannelId, receiving: bool) -> Result<()> {
        let pair = self.lookup(channel)?;
        self.network
            .invoke(move || set_receiving(&pair, receiving))?
            .map_err(Error::from)
    }

    /// Send one payload on the channel's RTP or RTCP endpoint
    pub fn send(&self, channel: ChannelId, component: Component, payload: Bytes) -> Result<usize> {
        let pair = self.lookup(channel)?;
        self.network
            .invoke(move || pair.send(component, &payload))?
            .map_err(Error::from)
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}
