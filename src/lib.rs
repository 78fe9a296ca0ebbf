//! GPU-accelerated proof-of-work search worker.
//!
//! The crate splits into a device layer ([`backend`]) that owns memory and
//! kernel dispatch on one GPU, and a search loop ([`miner`]) that feeds it
//! tasks, harvests candidate nonces, and reports minimal shares. Tasks reach
//! workers through the [`task::TaskSource`] seam; the bundled
//! [`task::TaskBoard`] is the in-process implementation.

pub mod backend;
pub mod config;
pub mod miner;
pub mod task;
pub mod telemetry;
pub mod types;

pub use miner::{GpuWorker, NonceHasher, Sha256Hasher, WorkerConfig, WorkerEvent};
pub use task::{TaskBoard, TaskSource, TaskWrapper, WorkUnit};
