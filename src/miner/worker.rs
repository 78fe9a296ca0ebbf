//! Per-device search loop. One worker exclusively owns one device driver and
//! runs on its own thread; work arrives through a shared [`TaskSource`] and
//! accepted shares travel back through the task and an optional event channel.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use sha2::{Digest, Sha256};

use crate::backend::{DeviceDriver, DeviceError, SearchBatch};
use crate::miner::buffers::{DeviceBufferSet, RESULT_BYTES};
use crate::miner::{
    HASHES_PER_NONCE, IDLE_BACKOFF, INSTANCE_NONCE_STRIDE, MAX_CANDIDATES, MAX_CONSECUTIVE_ERRORS,
    RESET_PAUSE, SEARCH_SLOTS,
};
use crate::task::{TaskSource, TaskWrapper, DATA_LEN, STATE_LEN};
use crate::telemetry::HashCounter;
use crate::types::{cmp_hashes, target_words, Hash};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Position of this worker in the fleet; selects its nonce window.
    pub instance_index: u32,
    /// Nonces tested per dispatched batch.
    pub throughput: u32,
    /// Consecutive device faults tolerated before the worker gives up.
    pub max_consecutive_errors: u32,
    pub idle_backoff: Duration,
    pub reset_pause: Duration,
}

impl WorkerConfig {
    pub fn new(instance_index: u32) -> Self {
        Self {
            instance_index,
            throughput: crate::miner::DEFAULT_THROUGHPUT,
            max_consecutive_errors: MAX_CONSECUTIVE_ERRORS,
            idle_backoff: IDLE_BACKOFF,
            reset_pause: RESET_PAUSE,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Share {
        instance: u32,
        task_index: u64,
        nonce: u64,
        hash: Hash,
    },
    /// The worker stopped for good; other workers keep running.
    Fatal { instance: u32, message: String },
}

/// Host-side oracle recomputing the hash the kernel evaluated for a nonce.
/// Candidate verification and share selection run against this, never against
/// device output.
pub trait NonceHasher: Send {
    fn hash_nonce(&self, state: &[u8; STATE_LEN], data: &[u8; DATA_LEN], nonce: u64) -> Hash;
}

/// Default oracle: double SHA-256 over the hash state and the data block with
/// the nonce patched into its trailing eight bytes.
#[derive(Debug, Default, Clone)]
pub struct Sha256Hasher;

impl NonceHasher for Sha256Hasher {
    fn hash_nonce(&self, state: &[u8; STATE_LEN], data: &[u8; DATA_LEN], nonce: u64) -> Hash {
        let mut block = *data;
        block[56..64].copy_from_slice(&nonce.to_le_bytes());
        let mut hasher = Sha256::new();
        hasher.update(state);
        hasher.update(block);
        let first = hasher.finalize();
        Sha256::digest(first).into()
    }
}

pub struct GpuWorker<D: DeviceDriver, H: NonceHasher> {
    cfg: WorkerConfig,
    driver: D,
    hasher: H,
    tasks: Arc<dyn TaskSource>,
    buffers: Option<DeviceBufferSet>,
    hash_counter: Arc<HashCounter>,
    shutdown: Arc<AtomicBool>,
    events: Option<Sender<WorkerEvent>>,
}

impl<D: DeviceDriver, H: NonceHasher> GpuWorker<D, H> {
    pub fn new(
        cfg: WorkerConfig,
        driver: D,
        hasher: H,
        tasks: Arc<dyn TaskSource>,
        hash_counter: Arc<HashCounter>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            driver,
            hasher,
            tasks,
            buffers: None,
            hash_counter,
            shutdown,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Runs the search loop until shutdown or an unrecoverable fault. Device
    /// faults are retried through a buffer rebuild up to the configured bound;
    /// a clean results harvest rearms the bound.
    pub fn run(&mut self) {
        if let Err(err) = self.ensure_buffers() {
            self.fatal(format!("device buffer allocation failed: {err}"));
            return;
        }

        let mut consecutive_errors = 0u32;
        loop {
            match self.mine(&mut consecutive_errors) {
                Ok(()) => break,
                Err(err) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    consecutive_errors += 1;
                    eprintln!(
                        "[gpu] instance {}: device fault ({}/{}): {err}",
                        self.cfg.instance_index, consecutive_errors, self.cfg.max_consecutive_errors
                    );
                    if consecutive_errors >= self.cfg.max_consecutive_errors {
                        self.fatal(format!(
                            "giving up after {} consecutive device faults: {err}",
                            consecutive_errors
                        ));
                        break;
                    }
                    if let Err(reset_err) = self.reset() {
                        self.fatal(format!("device reset failed: {reset_err}"));
                        break;
                    }
                }
            }
        }

        if let Some(buffers) = self.buffers.take() {
            if let Err(err) = buffers.release(&mut self.driver) {
                eprintln!(
                    "[gpu] instance {}: buffer release failed: {err}",
                    self.cfg.instance_index
                );
            }
        }
    }

    fn mine(&mut self, consecutive_errors: &mut u32) -> Result<(), DeviceError> {
        let mut prev_task_index = 0u64;
        let mut loop_counter = 0u64;
        let mut nonce = 0u64;
        let mut window_base = 0u64;
        let mut window_warned = false;
        let batch_span = u64::from(self.cfg.throughput) * HASHES_PER_NONCE;

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(task) = self.tasks.fetch() else {
                println!(
                    "[gpu] instance {}: no work available, waiting",
                    self.cfg.instance_index
                );
                thread::sleep(self.cfg.idle_backoff);
                continue;
            };

            if task.index() != prev_task_index {
                // Drain in-flight work before its buffers are overwritten.
                if prev_task_index > 0 {
                    self.driver.synchronize()?;
                }
                loop_counter = 0;
                window_base = task
                    .base_nonce()
                    .wrapping_add(u64::from(self.cfg.instance_index) * INSTANCE_NONCE_STRIDE);
                nonce = window_base;
                window_warned = false;
                self.load_task(&task)?;
                prev_task_index = task.index();
            }

            let harvested = if loop_counter > 0 {
                let candidates = self.harvest()?;
                *consecutive_errors = 0;
                Some(candidates)
            } else {
                None
            };

            if !window_warned && nonce.wrapping_sub(window_base) >= INSTANCE_NONCE_STRIDE {
                eprintln!(
                    "[gpu] instance {}: nonce window for task {} exhausted, \
                     search now overlaps the next instance",
                    self.cfg.instance_index,
                    task.index()
                );
                window_warned = true;
            }

            self.dispatch(nonce)?;

            if let Some(candidates) = harvested {
                if let Some((best_nonce, best_hash)) =
                    best_candidate(&self.hasher, &task, &candidates)
                {
                    if task.report_share(best_nonce, best_hash) {
                        println!(
                            "[share] instance {} task {} nonce {} hash {}",
                            self.cfg.instance_index,
                            task.index(),
                            best_nonce,
                            hex::encode(best_hash)
                        );
                        self.emit(WorkerEvent::Share {
                            instance: self.cfg.instance_index,
                            task_index: task.index(),
                            nonce: best_nonce,
                            hash: best_hash,
                        });
                    }
                    // The running batch keeps searching below the tightened
                    // target even when the report lost a race.
                    self.push_targets(&task.min_hash())?;
                }
            }

            nonce = nonce.wrapping_add(batch_span);
            self.hash_counter.add(batch_span);
            loop_counter += 1;
        }

        if prev_task_index > 0 {
            self.driver.synchronize()?;
        }
        Ok(())
    }

    fn ensure_buffers(&mut self) -> Result<(), DeviceError> {
        if self.buffers.is_none() {
            self.buffers = Some(DeviceBufferSet::allocate(&mut self.driver)?);
        }
        Ok(())
    }

    /// Rebuilds the device buffers after a fault. Any in-flight batch is
    /// abandoned; the next loop pass reloads the task from scratch.
    fn reset(&mut self) -> Result<(), DeviceError> {
        println!(
            "[gpu] instance {}: rebuilding device buffers",
            self.cfg.instance_index
        );
        thread::sleep(self.cfg.reset_pause);
        if let Some(buffers) = self.buffers.take() {
            buffers.release(&mut self.driver)?;
        }
        self.buffers = Some(DeviceBufferSet::allocate(&mut self.driver)?);
        Ok(())
    }

    fn load_task(&mut self, task: &TaskWrapper) -> Result<(), DeviceError> {
        let buffers = self.buffers.as_ref().expect("buffer set exists while mining");
        self.driver.write(&buffers.state, task.state())?;
        self.driver.write(&buffers.precalc_state, task.precalc_state())?;
        self.driver.write(&buffers.data, task.reversed_data())?;
        self.driver.write(&buffers.results, &[0u8; RESULT_BYTES])?;
        let (high, low) = target_words(&task.min_hash());
        self.driver.write(&buffers.target_high, &high.to_le_bytes())?;
        self.driver.write(&buffers.target_low, &low.to_le_bytes())?;
        Ok(())
    }

    /// Collects the previous batch: blocks on the device, reads the result
    /// slots, and rearms the buffer when the kernel reported anything. Zero
    /// slots are unfilled sentinels and are dropped here.
    fn harvest(&mut self) -> Result<Vec<u64>, DeviceError> {
        self.driver.synchronize()?;

        let buffers = self.buffers.as_ref().expect("buffer set exists while mining");
        let mut raw = [0u8; RESULT_BYTES];
        self.driver.read(&buffers.results, &mut raw)?;

        let mut slots = [0u64; SEARCH_SLOTS];
        for (slot, chunk) in slots.iter_mut().zip(raw.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *slot = u64::from_le_bytes(word);
        }

        let count = slots[0].min(MAX_CANDIDATES) as usize;
        let candidates = slots[1..=count]
            .iter()
            .copied()
            .filter(|&nonce| nonce != 0)
            .collect();

        if slots[0] > 0 {
            self.driver.write(&buffers.results, &[0u8; RESULT_BYTES])?;
        }
        Ok(candidates)
    }

    fn dispatch(&mut self, start_nonce: u64) -> Result<(), DeviceError> {
        let buffers = self.buffers.as_ref().expect("buffer set exists while mining");
        self.driver.dispatch_search(SearchBatch {
            start_nonce,
            state: &buffers.state,
            precalc_state: &buffers.precalc_state,
            data: &buffers.data,
            target_high: &buffers.target_high,
            target_low: &buffers.target_low,
            results: &buffers.results,
            throughput: self.cfg.throughput,
        })
    }

    fn push_targets(&mut self, min_hash: &Hash) -> Result<(), DeviceError> {
        let buffers = self.buffers.as_ref().expect("buffer set exists while mining");
        let (high, low) = target_words(min_hash);
        self.driver.write(&buffers.target_high, &high.to_le_bytes())?;
        self.driver.write(&buffers.target_low, &low.to_le_bytes())?;
        Ok(())
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn fatal(&self, message: String) {
        eprintln!("[gpu] instance {}: {message}", self.cfg.instance_index);
        self.emit(WorkerEvent::Fatal {
            instance: self.cfg.instance_index,
            message,
        });
    }
}

/// Recomputes every candidate on the host and picks the smallest hash. Ties
/// keep the earlier candidate.
fn best_candidate<H: NonceHasher>(
    hasher: &H,
    task: &TaskWrapper,
    candidates: &[u64],
) -> Option<(u64, Hash)> {
    let mut best: Option<(u64, Hash)> = None;
    for &nonce in candidates {
        let hash = hasher.hash_nonce(task.state(), task.data(), nonce);
        match &best {
            Some((_, best_hash)) if cmp_hashes(&hash, best_hash) != CmpOrdering::Less => {}
            _ => best = Some((nonce, hash)),
        }
    }
    best
}
