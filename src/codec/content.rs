//! Content descriptions exchanged with a channel

use serde::{Deserialize, Serialize};

use crate::channel::MediaKind;
use crate::codec::table::Codec;
use crate::transceiver::Direction;

/// One media stream: its SSRCs and the stream ids it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StreamParams {
    pub id: String,
    pub ssrcs: Vec<u32>,
    pub stream_ids: Vec<String>,
    pub cname: String,
}

impl StreamParams {
    pub fn with_ssrc(ssrc: u32, id: &str) -> Self {
        Self {
            id: id.to_string(),
            ssrcs: vec![ssrc],
            ..Self::default()
        }
    }

    pub fn first_ssrc(&self) -> Option<u32> {
        self.ssrcs.first().copied()
    }

    pub fn has_ssrc(&self, ssrc: u32) -> bool {
        self.ssrcs.contains(&ssrc)
    }

    pub fn shares_ssrc(&self, other: &StreamParams) -> bool {
        other.ssrcs.iter().any(|s| self.has_ssrc(*s))
    }
}

/// Codecs, streams and direction for one side of a media section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaContentDescription {
    pub kind: MediaKind,
    pub codecs: Vec<Codec>,
    pub streams: Vec<StreamParams>,
    pub direction: Direction,
    pub rtcp_mux: bool,
    pub protocol: String,
}

/// Transport profile every content description advertises
pub const MEDIA_PROTOCOL: &str = "RTP/AVPF";

impl MediaContentDescription {
    pub fn new(kind: MediaKind, direction: Direction) -> Self {
        Self {
            kind,
            codecs: Vec::new(),
            streams: Vec::new(),
            direction,
            rtcp_mux: true,
            protocol: MEDIA_PROTOCOL.to_string(),
        }
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codecs.push(codec);
        self
    }

    pub fn with_stream(mut self, stream: StreamParams) -> Self {
        self.streams.push(stream);
        self
    }

    /// The answer a loopback peer would give: same codecs and streams, with
    /// send and receive swapped
    pub fn mirrored(&self) -> Self {
        Self {
            direction: self.direction.reversed(),
            ..self.clone()
        }
    }

    pub fn first_ssrc(&self) -> Option<u32> {
        self.streams.iter().find_map(StreamParams::first_ssrc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::table::default_audio_codecs;

    #[test]
    fn test_mirrored_swaps_direction_only() {
        let local = MediaContentDescription::new(MediaKind::Audio, Direction::SendOnly)
            .with_codec(Codec::Audio(default_audio_codecs()[0].clone()))
            .with_stream(StreamParams::with_ssrc(42, "s"));

        let remote = local.mirrored();
        assert_eq!(remote.direction, Direction::RecvOnly);
        assert_eq!(remote.codecs, local.codecs);
        assert_eq!(remote.first_ssrc(), Some(42));
    }

    #[test]
    fn test_new_content_muxes_rtcp_over_avpf() {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let content = MediaContentDescription::new(kind, Direction::SendRecv);
            assert!(content.rtcp_mux);
            assert_eq!(content.protocol, "RTP/AVPF");
            assert!(content.mirrored().rtcp_mux);
        }
    }

    #[test]
    fn test_shares_ssrc() {
        let a = StreamParams {
            ssrcs: vec![1, 2],
            ..StreamParams::default()
        };
        assert!(a.shares_ssrc(&StreamParams::with_ssrc(2, "b")));
        assert!(!a.shares_ssrc(&StreamParams::with_ssrc(3, "c")));
    }
}
