//! Codec tables, content descriptions and negotiation
//!
//! Negotiation is loopback only: the engine builds the local description
//! from a [`CodecSetting`] and answers it with its own mirror image.

pub mod content;
pub mod negotiation;
pub mod ssrc;
pub mod table;

pub use content::{MediaContentDescription, StreamParams};
pub use negotiation::{set_codec, set_ssrc, NegotiatedStream};
pub use ssrc::SsrcGenerator;
pub use table::{
    default_audio_codecs, default_video_codecs, AudioCodec, Codec, CodecSetting, FeedbackParam,
    VideoCodec, VIDEO_CLOCK_RATE,
};
