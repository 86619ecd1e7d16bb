//! Codec descriptions and the default codec tables

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::channel::MediaKind;
use crate::error::CodecError;

/// RTCP feedback mechanisms advertised for video codecs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedbackParam {
    /// Receiver estimated max bitrate (goog-remb)
    Remb,
    /// Transport-wide congestion control
    TransportCc,
    /// Full intra request (ccm fir)
    CcmFir,
    Nack,
    /// Picture loss indication (nack pli)
    NackPli,
    /// Loss notification
    Lntf,
}

impl FeedbackParam {
    pub const ALL: [FeedbackParam; 6] = [
        FeedbackParam::Remb,
        FeedbackParam::TransportCc,
        FeedbackParam::CcmFir,
        FeedbackParam::Nack,
        FeedbackParam::NackPli,
        FeedbackParam::Lntf,
    ];

    /// Attribute text as it appears in an `a=rtcp-fb` line
    pub fn attribute(self) -> &'static str {
        match self {
            FeedbackParam::Remb => "goog-remb",
            FeedbackParam::TransportCc => "transport-cc",
            FeedbackParam::CcmFir => "ccm fir",
            FeedbackParam::Nack => "nack",
            FeedbackParam::NackPli => "nack pli",
            FeedbackParam::Lntf => "goog-lntf",
        }
    }
}

/// Audio codec parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub bitrate: u32,
    pub channels: u16,
}

impl AudioCodec {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32, bitrate: u32, channels: u16) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            bitrate,
            channels,
        }
    }
}

/// Video codec parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCodec {
    pub payload_type: u8,
    pub name: String,
    pub clock_rate: u32,
    pub feedback: Vec<FeedbackParam>,
    /// `packetization` fmtp value; `raw` sends frames without a payload descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packetization: Option<String>,
}

impl VideoCodec {
    /// A video codec advertising the full feedback set
    pub fn new(payload_type: u8, name: &str) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate: VIDEO_CLOCK_RATE,
            feedback: FeedbackParam::ALL.to_vec(),
            packetization: None,
        }
    }

    pub fn has_feedback(&self, param: FeedbackParam) -> bool {
        self.feedback.contains(&param)
    }
}

/// Either kind of codec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Codec {
    Audio(AudioCodec),
    Video(VideoCodec),
}

impl Codec {
    pub fn kind(&self) -> MediaKind {
        match self {
            Codec::Audio(_) => MediaKind::Audio,
            Codec::Video(_) => MediaKind::Video,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Codec::Audio(c) => &c.name,
            Codec::Video(c) => &c.name,
        }
    }

    pub fn payload_type(&self) -> u8 {
        match self {
            Codec::Audio(c) => c.payload_type,
            Codec::Video(c) => c.payload_type,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Audio(c) => write!(f, "{}/{}/{} ({} bps)", c.name, c.clock_rate, c.channels, c.bitrate),
            Codec::Video(c) => write!(f, "{}/{}", c.name, c.clock_rate),
        }
    }
}

/// RTP clock rate shared by all video codecs
pub const VIDEO_CLOCK_RATE: u32 = 90_000;

/// Audio codecs the engine can negotiate, in preference order
pub fn default_audio_codecs() -> Vec<AudioCodec> {
    vec![
        AudioCodec::new(111, "opus", 48_000, 32_000, 2),
        AudioCodec::new(9, "G722", 8_000, 64_000, 1),
        AudioCodec::new(0, "PCMU", 8_000, 64_000, 1),
        AudioCodec::new(8, "PCMA", 8_000, 64_000, 1),
    ]
}

/// Video codecs the engine can negotiate, in preference order
pub fn default_video_codecs() -> Vec<VideoCodec> {
    vec![
        VideoCodec::new(96, "VP8"),
        VideoCodec::new(98, "VP9"),
        VideoCodec::new(102, "H264"),
    ]
}

/// Codec requested by a caller. Unset fields take the table's values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodecSetting {
    pub name: String,
    pub payload_type: Option<u8>,
    pub clock_rate: Option<u32>,
    pub bitrate: Option<u32>,
    pub channels: Option<u16>,
    pub packetization: Option<String>,
}

impl CodecSetting {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Fixed codec used when a channel has none: PCMU/8000/64000/1 for
    /// audio, VP8/96 with raw packetization for video
    pub fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => Self::named("PCMU")
                .with_payload_type(0)
                .with_bitrate(64_000)
                .with_channels(1),
            MediaKind::Video => Self::named("VP8").with_payload_type(96).with_packetization("raw"),
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = Some(payload_type);
        self
    }

    pub fn with_packetization(mut self, packetization: &str) -> Self {
        self.packetization = Some(packetization.to_string());
        self
    }

    /// Resolve against the default tables for a channel of `kind`
    pub fn resolve(&self, kind: MediaKind) -> Result<Codec, CodecError> {
        let audio = default_audio_codecs()
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(&self.name));
        let video = default_video_codecs()
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(&self.name));

        match (kind, audio, video) {
            (MediaKind::Audio, Some(mut codec), _) => {
                if let Some(pt) = self.payload_type {
                    codec.payload_type = pt;
                }
                if let Some(rate) = self.clock_rate {
                    codec.clock_rate = rate;
                }
                if let Some(bitrate) = self.bitrate {
                    codec.bitrate = bitrate;
                }
                if let Some(channels) = self.channels {
                    if channels == 0 || channels > 2 {
                        return Err(CodecError::Unsupported(format!(
                            "{} with {} channels",
                            codec.name, channels
                        )));
                    }
                    codec.channels = channels;
                }
                Ok(Codec::Audio(codec))
            }
            (MediaKind::Video, _, Some(mut codec)) => {
                if let Some(pt) = self.payload_type {
                    codec.payload_type = pt;
                }
                if let Some(packetization) = &self.packetization {
                    codec.packetization = Some(packetization.clone());
                }
                Ok(Codec::Video(codec))
            }
            (MediaKind::Audio, None, Some(_)) | (MediaKind::Video, Some(_), None) => Err(
                CodecError::KindMismatch(format!("{} is not a {} codec", self.name, kind)),
            ),
            _ => Err(CodecError::Unsupported(self.name.clone())),
        }
    }
}
