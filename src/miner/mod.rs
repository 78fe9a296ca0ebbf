pub mod buffers;
pub mod worker;

pub use buffers::DeviceBufferSet;
pub use worker::{GpuWorker, NonceHasher, Sha256Hasher, WorkerConfig, WorkerEvent};

use std::time::Duration;

/// Nonces tested by one dispatched batch.
pub const DEFAULT_THROUGHPUT: u32 = 16_777_216;

/// Hashes the kernel evaluates per nonce; hash accounting and the nonce
/// advance both scale by this factor.
pub const HASHES_PER_NONCE: u64 = 16;

/// Slots in the search-results buffer: slot 0 is the candidate count,
/// slots 1..=15 hold candidate nonces.
pub const SEARCH_SLOTS: usize = 16;
pub const MAX_CANDIDATES: u64 = (SEARCH_SLOTS - 1) as u64;

/// Width of the nonce range owned by each worker instance. Instance `i`
/// starts at `base_nonce + i * INSTANCE_NONCE_STRIDE`.
pub const INSTANCE_NONCE_STRIDE: u64 = 1_000_000_000_000;

/// Consecutive device faults tolerated before a worker gives up.
pub const MAX_CONSECUTIVE_ERRORS: u32 = 3;

/// Sleep between polls while the task source is empty.
pub const IDLE_BACKOFF: Duration = Duration::from_secs(3);

/// Settle time before buffers are rebuilt after a device fault.
pub const RESET_PAUSE: Duration = Duration::from_millis(500);
