//! Host memory telemetry used to size the local store.

use parking_lot::Mutex;
use sysinfo::System;

use crate::error::TelemetryError;

/// Source of the host's available memory.
pub trait MemoryProbe: Send + Sync + 'static {
    fn available_memory_bytes(&self) -> Result<u64, TelemetryError>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SystemMemoryProbe {
    system: Mutex<System>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_memory_bytes(&self) -> Result<u64, TelemetryError> {
        let mut system = self.system.lock();
        system.refresh_memory();
        match system.available_memory() {
            // sysinfo reports 0 on platforms it cannot read
            0 => Err(TelemetryError::Unavailable(
                "available memory reported as zero".to_owned(),
            )),
            bytes => Ok(bytes),
        }
    }
}

/// Probe returning a fixed value; useful when the host limit is known up front.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn available_memory_bytes(&self) -> Result<u64, TelemetryError> {
        Ok(self.0)
    }
}
