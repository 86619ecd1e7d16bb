//! Error types and flat status codes for the session engine

use serde::Serialize;
use thiserror::Error;

use crate::channel::ChannelId;
use crate::thread::ContextKind;

/// Flat status code returned to engine callers.
///
/// Zero is success, negative values are failures and values above 1000 are
/// non-fatal warnings. Callers branch on the sign and on the named constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(i32)]
pub enum StatusCode {
    Done = 0,

    // General failures
    Failed = -1,
    InvalidArgument = -2,
    NotReady = -3,
    NotSupported = -4,
    NotInitialized = -7,
    Canceled = -11,
    BindSocket = -13,
    NetDown = -14,
    InitNetEngine = -21,

    // Channel / parameter errors
    NotFoundChannel = -101,
    InputParameter = -102,

    // Audio device module errors
    AdmGeneral = -1005,
    AdmStartPlayout = -1009,
    AdmStartRecording = -1012,

    // Warnings
    AdmRuntimePlayoutWarning = 1014,
    AdmRuntimeRecordingWarning = 1016,
    AdmRecordAudioSilenceWarning = 1019,
    AdmRecordAudioLowLevelWarning = 1031,
    AdmPlayoutAudioLowLevelWarning = 1032,
}

impl StatusCode {
    /// Integer value of the code
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_error(self) -> bool {
        self.code() < 0
    }

    pub fn is_warning(self) -> bool {
        self.code() > 1000
    }
}

impl From<StatusCode> for i32 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl<T> From<&Result<T>> for StatusCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Done,
            Err(e) => e.status_code(),
        }
    }
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error onto the flat status code space
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Dispatch(e) => e.status_code(),
            Error::Channel(e) => e.status_code(),
            Error::Transport(e) => e.status_code(),
            Error::Codec(e) => e.status_code(),
            Error::Device(e) => e.status_code(),
            Error::NotInitialized => StatusCode::NotInitialized,
            Error::Config(_) => StatusCode::InvalidArgument,
            Error::Io(_) => StatusCode::Failed,
        }
    }
}

/// Cross-context dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("{0} context is stopped")]
    ContextStopped(ContextKind),

    #[error("Failed to spawn {0} context thread: {1}")]
    Spawn(ContextKind, String),
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::ContextStopped(_) => StatusCode::Canceled,
            DispatchError::Spawn(..) => StatusCode::Failed,
        }
    }
}

/// Channel and transceiver errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel not found: {0}")]
    NotFound(ChannelId),

    #[error("No transceiver bound to channel {0}")]
    NoTransceiver(ChannelId),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Channel {0} is not sending")]
    NotSending(ChannelId),

    #[error("Channel {0} has no local stream")]
    NoLocalStream(ChannelId),
}

impl ChannelError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChannelError::NotFound(_) => StatusCode::NotFoundChannel,
            ChannelError::NoTransceiver(_) => StatusCode::NotInitialized,
            ChannelError::InvalidParameter(_) => StatusCode::InputParameter,
            ChannelError::NotSending(_) => StatusCode::NotReady,
            ChannelError::NoLocalStream(_) => StatusCode::NotReady,
        }
    }
}

/// Packet transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("{0} transport is absent")]
    Absent(&'static str),

    #[error("Socket bind failed on {addr}: {source}")]
    BindFailed {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Transport {0} is not bound")]
    NotBound(String),

    #[error("Transport {0} has no remote address")]
    NotConnected(String),

    #[error("Transport {0} is closed")]
    Closed(String),

    #[error("Send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("Failed to apply socket option: {0}")]
    SocketOption(#[source] std::io::Error),
}

impl TransportError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransportError::Absent(_) => StatusCode::InitNetEngine,
            TransportError::BindFailed { .. } => StatusCode::BindSocket,
            TransportError::NotBound(_) => StatusCode::NotReady,
            TransportError::NotConnected(_) => StatusCode::NotReady,
            TransportError::Closed(_) => StatusCode::NotReady,
            TransportError::SendFailed(_) => StatusCode::NetDown,
            TransportError::SocketOption(_) => StatusCode::Failed,
        }
    }
}

/// Codec negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unsupported codec: {0}")]
    Unsupported(String),

    #[error("Codec kind does not match channel kind: {0}")]
    KindMismatch(String),

    #[error("Invalid SSRC: {0}")]
    InvalidSsrc(u32),
}

impl CodecError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            CodecError::Unsupported(_) => StatusCode::NotSupported,
            CodecError::KindMismatch(_) => StatusCode::InputParameter,
            CodecError::InvalidSsrc(_) => StatusCode::InputParameter,
        }
    }
}

/// Audio device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Device initialization failed: {0}")]
    Init(String),

    #[error("Recording failed: {0}")]
    Recording(String),

    #[error("Playout failed: {0}")]
    Playout(String),
}

impl DeviceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DeviceError::Init(_) => StatusCode::AdmGeneral,
            DeviceError::Recording(_) => StatusCode::AdmStartRecording,
            DeviceError::Playout(_) => StatusCode::AdmStartPlayout,
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_partitions() {
        assert_eq!(StatusCode::Done.code(), 0);
        assert!(StatusCode::NotFoundChannel.is_error());
        assert!(StatusCode::AdmRecordAudioLowLevelWarning.is_warning());
        assert!(!StatusCode::AdmRecordAudioLowLevelWarning.is_error());
        assert!(!StatusCode::Done.is_warning());
    }

    #[test]
    fn test_status_code_values() {
        let expected = [
            (StatusCode::Failed, -1),
            (StatusCode::InvalidArgument, -2),
            (StatusCode::NotReady, -3),
            (StatusCode::NotSupported, -4),
            (StatusCode::NotInitialized, -7),
            (StatusCode::Canceled, -11),
            (StatusCode::BindSocket, -13),
            (StatusCode::NetDown, -14),
            (StatusCode::InitNetEngine, -21),
            (StatusCode::NotFoundChannel, -101),
            (StatusCode::InputParameter, -102),
            (StatusCode::AdmGeneral, -1005),
            (StatusCode::AdmStartPlayout, -1009),
            (StatusCode::AdmStartRecording, -1012),
            (StatusCode::AdmRuntimePlayoutWarning, 1014),
            (StatusCode::AdmRuntimeRecordingWarning, 1016),
            (StatusCode::AdmRecordAudioSilenceWarning, 1019),
            (StatusCode::AdmRecordAudioLowLevelWarning, 1031),
            (StatusCode::AdmPlayoutAudioLowLevelWarning, 1032),
        ];
        for (status, code) in expected {
            assert_eq!(status.code(), code, "{:?}", status);
        }
    }

    #[test]
    fn test_error_maps_to_status() {
        let err: Error = ChannelError::NotFound(7).into();
        assert_eq!(err.status_code(), StatusCode::NotFoundChannel);

        let err: Error = ChannelError::NoTransceiver(7).into();
        assert_eq!(err.status_code().code(), -7);

        let err: Error = TransportError::Absent("RTCP").into();
        assert_eq!(err.status_code(), StatusCode::InitNetEngine);

        let err: Error = DeviceError::Recording("busy".into()).into();
        assert_eq!(err.status_code().code(), -1012);

        let ok: Result<()> = Ok(());
        assert_eq!(StatusCode::from(&ok), StatusCode::Done);
    }
}
