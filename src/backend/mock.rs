//! Scripted in-memory device used by the worker and buffer tests. Records
//! every driver call in an operation journal and can inject faults or
//! deliver queued search results.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{DeviceBuffer, DeviceDriver, DeviceError, SearchBatch};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockOp {
    Alloc { id: u64, bytes: usize },
    Free { id: u64 },
    Write { id: u64, bytes: usize },
    Read { id: u64, bytes: usize },
    Sync,
    Dispatch { start_nonce: u64, throughput: u32 },
}

#[derive(Default)]
struct MockState {
    journal: Vec<MockOp>,
    memory: HashMap<u64, Vec<u8>>,
    next_id: u64,
    /// Result words delivered into the search-results buffer, one entry per
    /// harvest read. When empty, reads return whatever the buffer holds.
    queued_results: VecDeque<[u64; 16]>,
    fail_writes: u32,
    fail_syncs: u32,
    fail_allocs: u32,
    allocs_before_fault: Option<u32>,
    write_calls: u32,
    write_faults: HashSet<u32>,
    /// Final contents of buffers the driver has freed, kept so tests can
    /// inspect what was on the device after the worker releases its set.
    freed_memory: HashMap<u64, Vec<u8>>,
}

/// Shared handle onto the mock's state, kept by tests for inspection while
/// the worker owns the driver itself.
#[derive(Clone, Default)]
pub(crate) struct MockHandle(Arc<Mutex<MockState>>);

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.0.lock().unwrap()
    }

    pub(crate) fn journal(&self) -> Vec<MockOp> {
        self.lock().journal.clone()
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.lock().memory.len()
    }

    /// Contents of a buffer by id: the live bytes, or the last bytes it held
    /// before the driver freed it.
    pub(crate) fn buffer_bytes(&self, id: u64) -> Option<Vec<u8>> {
        let state = self.lock();
        state
            .memory
            .get(&id)
            .or_else(|| state.freed_memory.get(&id))
            .cloned()
    }

    /// Queues one result frame: slot 0 is the candidate count, slots 1..15
    /// are candidate nonces. Delivered on the next results-buffer read.
    pub(crate) fn queue_results(&self, frame: [u64; 16]) {
        self.lock().queued_results.push_back(frame);
    }

    pub(crate) fn fail_next_writes(&self, count: u32) {
        self.lock().fail_writes = count;
    }

    pub(crate) fn fail_next_syncs(&self, count: u32) {
        self.lock().fail_syncs = count;
    }

    /// Faults specific write calls, counted 1-based across the driver's
    /// lifetime.
    pub(crate) fn fail_write_calls(&self, calls: &[u32]) {
        self.lock().write_faults = calls.iter().copied().collect();
    }

    pub(crate) fn fail_next_allocs(&self, count: u32) {
        self.lock().fail_allocs = count;
    }

    /// Lets `successes` allocations through, then faults the next one.
    pub(crate) fn fail_alloc_after(&self, successes: u32) {
        self.lock().allocs_before_fault = Some(successes);
    }
}

pub(crate) struct MockDriver {
    state: MockHandle,
}

impl MockDriver {
    pub(crate) fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                state: handle.clone(),
            },
            handle,
        )
    }
}

impl DeviceDriver for MockDriver {
    fn alloc(&mut self, bytes: usize) -> Result<DeviceBuffer, DeviceError> {
        let mut state = self.state.lock();
        if state.fail_allocs > 0 {
            state.fail_allocs -= 1;
            return Err(DeviceError::Alloc {
                bytes,
                reason: "injected".into(),
            });
        }
        match state.allocs_before_fault {
            Some(0) => {
                state.allocs_before_fault = None;
                return Err(DeviceError::Alloc {
                    bytes,
                    reason: "injected".into(),
                });
            }
            Some(ref mut remaining) => *remaining -= 1,
            None => {}
        }
        state.next_id += 1;
        let id = state.next_id;
        state.memory.insert(id, vec![0u8; bytes]);
        state.journal.push(MockOp::Alloc { id, bytes });
        Ok(DeviceBuffer::new(id, bytes))
    }

    fn free(&mut self, buffer: DeviceBuffer) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        let Some(bytes) = state.memory.remove(&buffer.id()) else {
            return Err(DeviceError::InvalidHandle(buffer.id()));
        };
        state.freed_memory.insert(buffer.id(), bytes);
        state.journal.push(MockOp::Free { id: buffer.id() });
        Ok(())
    }

    fn write(&mut self, buffer: &DeviceBuffer, data: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.write_calls += 1;
        let call = state.write_calls;
        if state.write_faults.remove(&call) {
            return Err(DeviceError::Copy("injected".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(DeviceError::Copy("injected".into()));
        }
        if data.len() != buffer.len() {
            return Err(DeviceError::LenMismatch {
                expected: buffer.len(),
                actual: data.len(),
            });
        }
        let Some(memory) = state.memory.get_mut(&buffer.id()) else {
            return Err(DeviceError::InvalidHandle(buffer.id()));
        };
        memory.copy_from_slice(data);
        state.journal.push(MockOp::Write {
            id: buffer.id(),
            bytes: data.len(),
        });
        Ok(())
    }

    fn read(&mut self, buffer: &DeviceBuffer, out: &mut [u8]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if out.len() != buffer.len() {
            return Err(DeviceError::LenMismatch {
                expected: buffer.len(),
                actual: out.len(),
            });
        }
        // A 128-byte read targets the search-results buffer; deliver the next
        // queued frame if one is scripted.
        if out.len() == 128 {
            if let Some(frame) = state.queued_results.pop_front() {
                let mut bytes = Vec::with_capacity(128);
                for word in frame {
                    bytes.extend_from_slice(&word.to_le_bytes());
                }
                if let Some(memory) = state.memory.get_mut(&buffer.id()) {
                    memory.copy_from_slice(&bytes);
                }
            }
        }
        let Some(memory) = state.memory.get(&buffer.id()) else {
            return Err(DeviceError::InvalidHandle(buffer.id()));
        };
        out.copy_from_slice(memory);
        state.journal.push(MockOp::Read {
            id: buffer.id(),
            bytes: out.len(),
        });
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_syncs > 0 {
            state.fail_syncs -= 1;
            return Err(DeviceError::Sync("injected".into()));
        }
        state.journal.push(MockOp::Sync);
        Ok(())
    }

    fn dispatch_search(&mut self, batch: SearchBatch<'_>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        for buffer in [
            batch.state,
            batch.precalc_state,
            batch.data,
            batch.target_high,
            batch.target_low,
            batch.results,
        ] {
            if !state.memory.contains_key(&buffer.id()) {
                return Err(DeviceError::InvalidHandle(buffer.id()));
            }
        }
        state.journal.push(MockOp::Dispatch {
            start_nonce: batch.start_nonce,
            throughput: batch.throughput,
        });
        Ok(())
    }
}
