//! SSRC allocation

use parking_lot::Mutex;
use std::collections::HashSet;
use uuid::Uuid;

/// Hands out SSRCs that are non-zero and unique for the generator's lifetime
#[derive(Debug, Default)]
pub struct SsrcGenerator {
    used: Mutex<HashSet<u32>>,
}

impl SsrcGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh random SSRC
    pub fn generate(&self) -> u32 {
        let mut used = self.used.lock();
        loop {
            let bytes = Uuid::new_v4().into_bytes();
            let ssrc = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            if ssrc != 0 && used.insert(ssrc) {
                return ssrc;
            }
        }
    }

    /// Reserve a caller-chosen SSRC. False if zero or already handed out.
    pub fn register(&self, ssrc: u32) -> bool {
        ssrc != 0 && self.used.lock().insert(ssrc)
    }

    pub fn is_used(&self, ssrc: u32) -> bool {
        self.used.lock().contains(&ssrc)
    }

    pub fn len(&self) -> usize {
        self.used.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.lock().is_empty()
    }
}
