//! Audio device layer
//!
//! The engine does not capture or render audio itself. It drives an
//! [`AudioDeviceModule`] through start/stop calls and listens to its event
//! signal for warnings and errors.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DeviceError, StatusCode};
use crate::signal::Signal;

/// Something the device reports asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Non-fatal condition; the call keeps running
    Warning(StatusCode),
    Error(DeviceError),
}

/// Capture and playout control
pub trait AudioDeviceModule: Send + Sync {
    fn init(&self) -> Result<(), DeviceError>;

    fn start_recording(&self) -> Result<(), DeviceError>;

    fn stop_recording(&self) -> Result<(), DeviceError>;

    fn start_playout(&self) -> Result<(), DeviceError>;

    fn stop_playout(&self) -> Result<(), DeviceError>;

    fn recording(&self) -> bool;

    fn playing(&self) -> bool;

    fn events(&self) -> &Signal<DeviceEvent>;
}

/// A device that accepts every call and produces no audio
pub struct NullAudioDevice {
    initialized: AtomicBool,
    recording: AtomicBool,
    playing: AtomicBool,
    events: Signal<DeviceEvent>,
    fail_next: Mutex<Option<DeviceError>>,
}

impl NullAudioDevice {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            playing: AtomicBool::new(false),
            events: Signal::new(),
            fail_next: Mutex::new(None),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Emit a warning as if the hardware had raised it
    pub fn report_warning(&self, code: StatusCode) {
        tracing::debug!(?code, "Null device warning");
        self.events.emit(&DeviceEvent::Warning(code));
    }

    /// Make the next start call fail with `error`
    pub fn fail_next(&self, error: DeviceError) {
        *self.fail_next.lock() = Some(error);
    }

    fn check_failure(&self) -> Result<(), DeviceError> {
        match self.fail_next.lock().take() {
            Some(error) => {
                self.events.emit(&DeviceEvent::Error(error.clone()));
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn require_init(&self) -> Result<(), DeviceError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DeviceError::Init("device not initialized".into()))
        }
    }
}

impl Default for NullAudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDeviceModule for NullAudioDevice {
    fn init(&self) -> Result<(), DeviceError> {
        self.check_failure()?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn start_recording(&self) -> Result<(), DeviceError> {
        self.require_init()?;
        self.check_failure()?;
        self.recording.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_recording(&self) -> Result<(), DeviceError> {
        self.recording.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_playout(&self) -> Result<(), DeviceError> {
        self.require_init()?;
        self.check_failure()?;
        self.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_playout(&self) -> Result<(), DeviceError> {
        self.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn events(&self) -> &Signal<DeviceEvent> {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_start_requires_init() {
        let device = NullAudioDevice::new();
        assert!(matches!(device.start_recording(), Err(DeviceError::Init(_))));

        device.init().unwrap();
        device.start_recording().unwrap();
        device.start_playout().unwrap();
        assert!(device.recording() && device.playing());

        device.stop_recording().unwrap();
        assert!(!device.recording());
    }

    #[test]
    fn test_failure_is_reported_once() {
        let device = NullAudioDevice::new();
        device.init().unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _conn = device.events().connect(move |e: &DeviceEvent| sink.lock().push(e.clone()));

        device.fail_next(DeviceError::Playout("underrun".into()));
        assert!(device.start_playout().is_err());
        assert!(device.start_playout().is_ok());
        device.report_warning(StatusCode::AdmRecordAudioLowLevelWarning);

        let events = events.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], DeviceEvent::Warning(StatusCode::AdmRecordAudioLowLevelWarning));
    }
}
