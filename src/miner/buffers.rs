//! The six device-resident regions one worker mines with. The set is
//! allocated and released as a unit; a worker never runs with a partial set.

use crate::backend::{DeviceBuffer, DeviceDriver, DeviceError};
use crate::miner::SEARCH_SLOTS;

pub const STATE_BYTES: usize = 32;
pub const PRECALC_STATE_BYTES: usize = 32;
pub const DATA_BYTES: usize = 56;
pub const RESULT_BYTES: usize = SEARCH_SLOTS * 8;
pub const TARGET_BYTES: usize = 4;

pub struct DeviceBufferSet {
    pub state: DeviceBuffer,
    pub precalc_state: DeviceBuffer,
    pub data: DeviceBuffer,
    pub results: DeviceBuffer,
    pub target_high: DeviceBuffer,
    pub target_low: DeviceBuffer,
}

impl DeviceBufferSet {
    /// Allocates all six regions. On any failure the regions already
    /// allocated are freed before the error is returned, so the device is
    /// left exactly as it was.
    pub fn allocate<D: DeviceDriver + ?Sized>(driver: &mut D) -> Result<Self, DeviceError> {
        let mut allocated: Vec<DeviceBuffer> = Vec::with_capacity(6);
        let sizes = [
            STATE_BYTES,
            PRECALC_STATE_BYTES,
            DATA_BYTES,
            RESULT_BYTES,
            TARGET_BYTES,
            TARGET_BYTES,
        ];
        for bytes in sizes {
            match driver.alloc(bytes) {
                Ok(buffer) => allocated.push(buffer),
                Err(err) => {
                    // Unwind in reverse allocation order; the original fault
                    // is what the caller needs to see.
                    while let Some(buffer) = allocated.pop() {
                        let _ = driver.free(buffer);
                    }
                    return Err(err);
                }
            }
        }

        let target_low = allocated.pop().expect("six buffers were allocated");
        let target_high = allocated.pop().expect("six buffers were allocated");
        let results = allocated.pop().expect("six buffers were allocated");
        let data = allocated.pop().expect("six buffers were allocated");
        let precalc_state = allocated.pop().expect("six buffers were allocated");
        let state = allocated.pop().expect("six buffers were allocated");
        Ok(Self {
            state,
            precalc_state,
            data,
            results,
            target_high,
            target_low,
        })
    }

    /// Releases all six regions. Free faults are collected rather than
    /// short-circuited so every region is handed back to the driver.
    pub fn release<D: DeviceDriver + ?Sized>(self, driver: &mut D) -> Result<(), DeviceError> {
        let mut first_err = None;
        for buffer in [
            self.state,
            self.precalc_state,
            self.data,
            self.results,
            self.target_high,
            self.target_low,
        ] {
            if let Err(err) = driver.free(buffer) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
