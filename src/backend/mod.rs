use serde::Serialize;
use thiserror::Error;

use crate::telemetry::HwMonitor;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(test)]
pub(crate) mod mock;

/// Faults raised by the device layer. The worker loop aggregates these into
/// its bounded-retry error counter; none of them escape its outer envelope.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no GPU devices found")]
    NoDevices,
    #[error("GPU device {0} is unavailable: {1}")]
    Unavailable(u32, String),
    #[error("device allocation of {bytes} bytes failed: {reason}")]
    Alloc { bytes: usize, reason: String },
    #[error("host/device copy failed: {0}")]
    Copy(String),
    #[error("device synchronize failed: {0}")]
    Sync(String),
    #[error("kernel launch failed: {0}")]
    Launch(String),
    #[error("unknown device buffer handle {0}")]
    InvalidHandle(u64),
    #[error("buffer length mismatch: buffer holds {expected} bytes, host side has {actual}")]
    LenMismatch { expected: usize, actual: usize },
}

/// Opaque owned handle to one device-resident memory region. Created by
/// [`DeviceDriver::alloc`] and returned to the driver through
/// [`DeviceDriver::free`]; the handle cannot be cloned, so a region is only
/// ever released once.
#[derive(Debug)]
pub struct DeviceBuffer {
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Arguments for one asynchronous batch-search invocation. Fixed calling
/// contract of the opaque device-side search function.
pub struct SearchBatch<'a> {
    pub start_nonce: u64,
    pub state: &'a DeviceBuffer,
    pub precalc_state: &'a DeviceBuffer,
    pub data: &'a DeviceBuffer,
    pub target_high: &'a DeviceBuffer,
    pub target_low: &'a DeviceBuffer,
    pub results: &'a DeviceBuffer,
    /// Nonces tested by this batch.
    pub throughput: u32,
}

/// Minimal device driver surface the worker loop runs against. One driver
/// instance is exclusively owned by one worker.
///
/// `dispatch_search` queues work and returns immediately; only
/// `synchronize` blocks until queued device work has completed.
pub trait DeviceDriver: Send {
    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError>;
    fn free(&mut self, buffer: DeviceBuffer) -> Result<(), DeviceError>;
    fn write(&mut self, buffer: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError>;
    fn read(&mut self, buffer: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError>;
    fn synchronize(&mut self) -> Result<(), DeviceError>;
    fn dispatch_search(&mut self, batch: SearchBatch<'_>) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
}

/// Enumerates GPU devices visible to the process. Without the `cuda` feature
/// there is nothing to enumerate.
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>, DeviceError> {
    #[cfg(feature = "cuda")]
    {
        cuda::enumerate_devices()
    }
    #[cfg(not(feature = "cuda"))]
    {
        Err(DeviceError::NoDevices)
    }
}

/// Hardware-monitor snapshot for one device; zeros when unavailable.
pub fn hardware_monitor(device_index: u32) -> HwMonitor {
    #[cfg(feature = "cuda")]
    {
        cuda::hardware_monitor(device_index)
    }
    #[cfg(not(feature = "cuda"))]
    {
        let _ = device_index;
        HwMonitor::default()
    }
}
