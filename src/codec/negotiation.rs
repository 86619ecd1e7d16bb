//! Codec and SSRC negotiation for a single channel
//!
//! The engine has no remote peer of its own, so negotiation produces the
//! local content description and installs its mirror image as the remote
//! answer. The resulting SSRC and stream ids are pushed onto the sender of
//! the transceiver bound to the channel, and the SSRC is registered as a
//! receive stream on the channel's media sink.
//!
//! Both entry points run on the worker context.

use serde::Serialize;
use uuid::Uuid;

use crate::channel::Channel;
use crate::codec::content::{MediaContentDescription, StreamParams};
use crate::codec::ssrc::SsrcGenerator;
use crate::codec::table::{Codec, CodecSetting};
use crate::error::{ChannelError, CodecError, Result};
use crate::transceiver::{Transceiver, TransceiverList};

/// What negotiation assigned to a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiatedStream {
    pub codec: Codec,
    pub local_ssrc: u32,
    pub remote_ssrc: u32,
    pub stream_ids: Vec<String>,
}

fn bound_transceiver(channel: &Channel, transceivers: &TransceiverList) -> Result<std::sync::Arc<Transceiver>> {
    transceivers
        .find_by_channel(channel.id())
        .ok_or_else(|| ChannelError::NoTransceiver(channel.id()).into())
}

fn new_stream(ssrc: u32, stream_ids: &[String], cname: &str) -> StreamParams {
    StreamParams {
        id: Uuid::new_v4().simple().to_string(),
        ssrcs: vec![ssrc],
        stream_ids: stream_ids.to_vec(),
        cname: cname.to_string(),
    }
}

/// Negotiate `setting` with a freshly generated SSRC
pub fn set_codec(
    channel: &Channel,
    transceivers: &TransceiverList,
    ssrcs: &SsrcGenerator,
    setting: &CodecSetting,
) -> Result<NegotiatedStream> {
    // Check every precondition before mutating anything.
    let transceiver = bound_transceiver(channel, transceivers)?;
    let codec = setting.resolve(channel.kind())?;

    let ssrc = ssrcs.generate();
    apply(channel, &transceiver, codec, ssrc, ssrc)
}

/// Install explicit local and remote SSRCs, keeping the current codec
pub fn set_ssrc(
    channel: &Channel,
    transceivers: &TransceiverList,
    ssrcs: &SsrcGenerator,
    local_ssrc: u32,
    remote_ssrc: u32,
) -> Result<NegotiatedStream> {
    let transceiver = bound_transceiver(channel, transceivers)?;
    for ssrc in [local_ssrc, remote_ssrc] {
        if ssrc == 0 {
            return Err(CodecError::InvalidSsrc(ssrc).into());
        }
    }

    let codec = match channel.local_content().and_then(|c| c.codecs.first().cloned()) {
        Some(codec) => codec,
        None => CodecSetting::default_for(channel.kind()).resolve(channel.kind())?,
    };

    // Caller-chosen values may collide with generated ones; record them so
    // the generator never hands them out, but do not reject a reuse.
    ssrcs.register(local_ssrc);
    ssrcs.register(remote_ssrc);

    apply(channel, &transceiver, codec, local_ssrc, remote_ssrc)
}

fn apply(
    channel: &Channel,
    transceiver: &Transceiver,
    codec: Codec,
    local_ssrc: u32,
    remote_ssrc: u32,
) -> Result<NegotiatedStream> {
    let stream_ids = vec![Uuid::new_v4().to_string()];
    let cname = format!("channel-{}", channel.id());
    let direction = transceiver.direction();

    let local = MediaContentDescription::new(channel.kind(), direction)
        .with_codec(codec.clone())
        .with_stream(new_stream(local_ssrc, &stream_ids, &cname));

    let mut remote = local.mirrored();
    if remote_ssrc != local_ssrc {
        remote.streams = vec![new_stream(remote_ssrc, &stream_ids, &cname)];
    }

    channel.set_local_content(local)?;
    channel.set_remote_content(remote.clone())?;

    if let Some(previous) = transceiver
        .sender()
        .set_parameters(local_ssrc, stream_ids.clone(), Some(codec.clone()))
    {
        channel.remove_recv_stream(previous);
    }
    if let Some(previous) = transceiver.receiver().set_ssrc(remote_ssrc) {
        channel.remove_recv_stream(previous);
    }
    for stream in remote.streams {
        channel.add_recv_stream(stream);
    }

    tracing::info!(
        channel = channel.id(),
        codec = %codec,
        local_ssrc,
        remote_ssrc,
        "Negotiated channel"
    );

    Ok(NegotiatedStream {
        codec,
        local_ssrc,
        remote_ssrc,
        stream_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MediaKind;
    use crate::clock::RealClock;
    use crate::codec::table::FeedbackParam;
    use crate::error::StatusCode;
    use crate::network::transport::{Component, DtlsSrtpTransport, DtlsTransport};
    use crate::network::PacketTransport;
    use crate::thread::{Context, ContextKind};
    use crate::transceiver::Direction;
    use std::sync::Arc;

    struct Fixture {
        _ctx: Context,
        channel: Arc<Channel>,
        transceivers: TransceiverList,
        ssrcs: SsrcGenerator,
    }

    fn fixture(kind: MediaKind, bind: bool) -> Fixture {
        let ctx = Context::spawn(ContextKind::Network).unwrap();
        let rtp = PacketTransport::new("rtp", ctx.handle(), RealClock::shared());
        let rtcp = PacketTransport::new("rtcp", ctx.handle(), RealClock::shared());
        let pair = Arc::new(DtlsSrtpTransport::new(
            "n",
            Some(DtlsTransport::new(Component::Rtp, rtp)),
            Some(DtlsTransport::new(Component::Rtcp, rtcp)),
        ));
        let channel = Channel::new(5, kind, pair);
        let transceivers = TransceiverList::new();
        if bind {
            let t = Arc::new(Transceiver::new(kind, Direction::SendRecv));
            t.set_channel(Some(5));
            transceivers.add(t);
        }
        Fixture {
            _ctx: ctx,
            channel,
            transceivers,
            ssrcs: SsrcGenerator::new(),
        }
    }

    #[test]
    fn test_set_codec_assigns_ssrc_everywhere() {
        let f = fixture(MediaKind::Audio, true);
        let negotiated = set_codec(&f.channel, &f.transceivers, &f.ssrcs, &CodecSetting::named("opus")).unwrap();

        let transceiver = f.transceivers.find_by_channel(5).unwrap();
        assert_eq!(transceiver.sender().ssrc(), Some(negotiated.local_ssrc));
        assert_eq!(transceiver.sender().stream_ids(), negotiated.stream_ids);
        assert_eq!(f.channel.recv_ssrcs(), vec![negotiated.local_ssrc]);
        assert_eq!(f.channel.send_ssrcs(), vec![negotiated.local_ssrc]);

        let local = f.channel.local_content().unwrap();
        let remote = f.channel.remote_content().unwrap();
        assert_eq!(local.codecs, remote.codecs);
        assert_eq!(local.first_ssrc(), remote.first_ssrc());
    }

    #[test]
    fn test_video_negotiation_keeps_feedback() {
        let f = fixture(MediaKind::Video, true);
        let negotiated = set_codec(&f.channel, &f.transceivers, &f.ssrcs, &CodecSetting::named("VP8")).unwrap();

        let Codec::Video(codec) = negotiated.codec else {
            panic!("expected video codec");
        };
        assert!(codec.has_feedback(FeedbackParam::TransportCc));
        assert!(codec.has_feedback(FeedbackParam::NackPli));
    }

    #[test]
    fn test_without_transceiver_nothing_changes() {
        let f = fixture(MediaKind::Audio, false);
        let err = set_codec(&f.channel, &f.transceivers, &f.ssrcs, &CodecSetting::named("opus")).unwrap_err();

        assert_eq!(err.status_code(), StatusCode::NotInitialized);
        assert!(f.channel.local_content().is_none());
        assert!(f.ssrcs.is_empty());
    }

    #[test]
    fn test_renegotiation_replaces_receive_stream() {
        let f = fixture(MediaKind::Audio, true);
        let first = set_codec(&f.channel, &f.transceivers, &f.ssrcs, &CodecSetting::named("opus")).unwrap();
        let second = set_codec(&f.channel, &f.transceivers, &f.ssrcs, &CodecSetting::named("PCMU")).unwrap();

        assert_ne!(first.local_ssrc, second.local_ssrc);
        assert_eq!(f.channel.recv_ssrcs(), vec![second.local_ssrc]);
    }

    #[test]
    fn test_set_ssrc_uses_explicit_values() {
        let f = fixture(MediaKind::Audio, true);
        let negotiated = set_ssrc(&f.channel, &f.transceivers, &f.ssrcs, 1111, 2222).unwrap();

        let transceiver = f.transceivers.find_by_channel(5).unwrap();
        assert_eq!(transceiver.sender().ssrc(), Some(1111));
        assert_eq!(transceiver.receiver().ssrc(), Some(2222));
        assert_eq!(f.channel.send_ssrcs(), vec![1111]);
        assert_eq!(f.channel.recv_ssrcs(), vec![2222]);
        assert_eq!(negotiated.codec.name(), "PCMU");
        assert!(f.ssrcs.is_used(1111) && f.ssrcs.is_used(2222));
    }

    #[test]
    fn test_set_ssrc_rejects_zero() {
        let f = fixture(MediaKind::Video, true);
        let err = set_ssrc(&f.channel, &f.transceivers, &f.ssrcs, 0, 5).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::InputParameter);
    }
}
