use std::sync::{Arc, Mutex, RwLock};

use crate::types::{cmp_hashes, Hash};

pub const STATE_LEN: usize = 32;
pub const DATA_LEN: usize = 64;
pub const REVERSED_DATA_LEN: usize = 56;
pub const NONCE_FIELD_LEN: usize = 32;

/// One unit of mining work as issued by the upstream task source. The core
/// never mutates it; shares travel back through [`TaskWrapper::report_share`].
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Hash state the kernel continues from.
    pub state: [u8; STATE_LEN],
    /// Input data block; the last eight bytes are replaced by the nonce.
    pub data: [u8; DATA_LEN],
    /// Nonce field; the last eight bytes carry the per-task base nonce.
    pub nonce_field: [u8; NONCE_FIELD_LEN],
    /// Current minimal-hash target a candidate must beat.
    pub min_hash: Hash,
}

impl WorkUnit {
    pub fn base_nonce(&self) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.nonce_field[24..32]);
        u64::from_le_bytes(word)
    }
}

/// A share found by a worker: the work unit's nonce field with the winning
/// nonce patched in, plus the recomputed hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedShare {
    pub nonce_field: [u8; NONCE_FIELD_LEN],
    pub hash: Hash,
}

struct ShareSlot {
    min_hash: Hash,
    share: Option<MinedShare>,
}

/// Bridge object handed to workers for one task. Canonical work-unit fields
/// are immutable; the minimal hash and the reported share live behind a lock
/// owned by the task source.
pub struct TaskWrapper {
    index: u64,
    unit: WorkUnit,
    precalc_state: [u8; STATE_LEN],
    reversed_data: [u8; REVERSED_DATA_LEN],
    slot: Mutex<ShareSlot>,
}

impl TaskWrapper {
    /// `index` must be non-zero and monotone across tasks; the worker loop
    /// uses zero as the "no task loaded yet" sentinel.
    pub fn new(index: u64, unit: WorkUnit, precalc_state: [u8; STATE_LEN]) -> Self {
        let mut reversed_data = [0u8; REVERSED_DATA_LEN];
        for (i, byte) in reversed_data.iter_mut().enumerate() {
            *byte = unit.data[REVERSED_DATA_LEN - 1 - i];
        }
        let slot = Mutex::new(ShareSlot {
            min_hash: unit.min_hash,
            share: None,
        });
        Self {
            index,
            unit,
            precalc_state,
            reversed_data,
            slot,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn state(&self) -> &[u8; STATE_LEN] {
        &self.unit.state
    }

    pub fn data(&self) -> &[u8; DATA_LEN] {
        &self.unit.data
    }

    pub fn precalc_state(&self) -> &[u8; STATE_LEN] {
        &self.precalc_state
    }

    pub fn reversed_data(&self) -> &[u8; REVERSED_DATA_LEN] {
        &self.reversed_data
    }

    pub fn base_nonce(&self) -> u64 {
        self.unit.base_nonce()
    }

    /// Current minimal-hash target; shrinks as better shares are reported.
    pub fn min_hash(&self) -> Hash {
        match self.slot.lock() {
            Ok(slot) => slot.min_hash,
            Err(poisoned) => poisoned.into_inner().min_hash,
        }
    }

    /// Reports one mined share. Accepts it only when the hash is strictly
    /// below the current minimal hash, in which case the minimal hash shrinks
    /// and the share slot is overwritten. Canonical fields stay untouched.
    pub fn report_share(&self, nonce: u64, hash: Hash) -> bool {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if cmp_hashes(&hash, &slot.min_hash) != std::cmp::Ordering::Less {
            return false;
        }
        slot.min_hash = hash;
        let mut nonce_field = self.unit.nonce_field;
        nonce_field[24..32].copy_from_slice(&nonce.to_le_bytes());
        slot.share = Some(MinedShare { nonce_field, hash });
        true
    }

    pub fn share(&self) -> Option<MinedShare> {
        match self.slot.lock() {
            Ok(slot) => slot.share.clone(),
            Err(poisoned) => poisoned.into_inner().share.clone(),
        }
    }
}

/// Upstream task bridge consumed by workers. `fetch` is non-blocking and
/// returns `None` when no work is queued.
pub trait TaskSource: Send + Sync {
    fn fetch(&self) -> Option<Arc<TaskWrapper>>;
}

/// In-process task source: holds the most recently published task. Suitable
/// for tests and the synthetic benchmark; a network-backed source implements
/// [`TaskSource`] the same way.
#[derive(Default)]
pub struct TaskBoard {
    current: RwLock<Option<Arc<TaskWrapper>>>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, task: Arc<TaskWrapper>) {
        if let Ok(mut slot) = self.current.write() {
            *slot = Some(task);
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.current.write() {
            *slot = None;
        }
    }
}

impl TaskSource for TaskBoard {
    fn fetch(&self) -> Option<Arc<TaskWrapper>> {
        self.current.read().ok().and_then(|slot| slot.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_target(min_hash: Hash) -> WorkUnit {
        let mut data = [0u8; DATA_LEN];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let mut nonce_field = [0u8; NONCE_FIELD_LEN];
        nonce_field[24..32].copy_from_slice(&77u64.to_le_bytes());
        WorkUnit {
            state: [0x11; STATE_LEN],
            data,
            nonce_field,
            min_hash,
        }
    }

    #[test]
    fn reversed_data_mirrors_first_56_bytes() {
        let task = TaskWrapper::new(1, unit_with_target([0xff; 32]), [0; 32]);
        let reversed = task.reversed_data();
        assert_eq!(reversed[0], 55);
        assert_eq!(reversed[55], 0);
    }

    #[test]
    fn base_nonce_reads_last_eight_bytes() {
        let task = TaskWrapper::new(1, unit_with_target([0xff; 32]), [0; 32]);
        assert_eq!(task.base_nonce(), 77);
    }

    #[test]
    fn report_share_shrinks_min_hash_and_keeps_canonical_fields() {
        let task = TaskWrapper::new(1, unit_with_target([0xff; 32]), [0; 32]);
        let better = [0x0f; 32];
        assert!(task.report_share(42, better));
        assert_eq!(task.min_hash(), better);

        let share = task.share().expect("share should be recorded");
        assert_eq!(&share.nonce_field[24..32], &42u64.to_le_bytes());
        assert_eq!(share.hash, better);
        // Canonical nonce field still carries the base nonce.
        assert_eq!(task.base_nonce(), 77);
    }

    #[test]
    fn report_share_rejects_equal_or_worse_hashes() {
        let target = [0x40; 32];
        let task = TaskWrapper::new(1, unit_with_target(target), [0; 32]);
        assert!(!task.report_share(1, target));
        assert!(!task.report_share(2, [0x41; 32]));
        assert!(task.share().is_none());
    }

    #[test]
    fn board_returns_latest_published_task() {
        let board = TaskBoard::new();
        assert!(board.fetch().is_none());

        let first = Arc::new(TaskWrapper::new(1, unit_with_target([0xff; 32]), [0; 32]));
        let second = Arc::new(TaskWrapper::new(2, unit_with_target([0xff; 32]), [0; 32]));
        board.publish(Arc::clone(&first));
        board.publish(Arc::clone(&second));

        let fetched = board.fetch().expect("task should be queued");
        assert_eq!(fetched.index(), 2);
    }
}
