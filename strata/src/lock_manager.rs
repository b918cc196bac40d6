//! The multi-granularity lock manager. Tables take S/X/IS/IX/SIX;
//! records take S/X. Each lock-data id has a queue of granted requests
//! plus a condition variable; conflicts wait unless wound-wait decides
//! the requester is younger than the queue head, in which case the
//! request fails with a deadlock-prevention abort.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use log::debug;

use crate::errors::{StorageError, StorageResult};
use crate::transaction::{Transaction, TxnState};
use crate::{FileId, Rid, TxnId};

/// A lockable data item: a whole table or one record in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    Table(FileId),
    Record(FileId, Rid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    /// Whether a held mode already satisfies a new request: X covers
    /// everything, SIX every non-exclusive mode, S the shared side,
    /// IX the intention side.
    fn dominates(self, req: LockMode) -> bool {
        match self {
            LockMode::Exclusive => true,
            LockMode::SharedIntentionExclusive => req != LockMode::Exclusive,
            LockMode::Shared => matches!(req, LockMode::Shared | LockMode::IntentionShared),
            LockMode::IntentionExclusive => {
                matches!(req, LockMode::IntentionExclusive | LockMode::IntentionShared)
            }
            LockMode::IntentionShared => req == LockMode::IntentionShared,
        }
    }
}

/// The most restrictive mode currently granted on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum GroupMode {
    #[default]
    NonLock,
    Is,
    Ix,
    S,
    Six,
    X,
}

impl GroupMode {
    fn of(mode: LockMode) -> GroupMode {
        match mode {
            LockMode::Shared => GroupMode::S,
            LockMode::Exclusive => GroupMode::X,
            LockMode::IntentionShared => GroupMode::Is,
            LockMode::IntentionExclusive => GroupMode::Ix,
            LockMode::SharedIntentionExclusive => GroupMode::Six,
        }
    }

    /// Standard hierarchical compatibility matrix.
    fn admits(&self, mode: LockMode) -> bool {
        match self {
            GroupMode::NonLock => true,
            GroupMode::Is => mode != LockMode::Exclusive,
            GroupMode::Ix => matches!(
                mode,
                LockMode::IntentionShared | LockMode::IntentionExclusive
            ),
            GroupMode::S => matches!(mode, LockMode::Shared | LockMode::IntentionShared),
            GroupMode::Six => mode == LockMode::IntentionShared,
            GroupMode::X => false,
        }
    }

    /// Group mode after an additional compatible grant of `mode`.
    /// Ranks: NonLock < IS < {IX, S} < SIX < X; IX and S never coexist.
    fn combine(&self, mode: LockMode) -> GroupMode {
        let other = GroupMode::of(mode);
        if self.rank() >= other.rank() {
            *self
        } else {
            other
        }
    }

    fn rank(&self) -> u8 {
        match self {
            GroupMode::NonLock => 0,
            GroupMode::Is => 1,
            GroupMode::Ix | GroupMode::S => 2,
            GroupMode::Six => 3,
            GroupMode::X => 4,
        }
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

#[derive(Default)]
struct LockQueue {
    /// Granted requests only; waiters block in `lock_general`.
    requests: VecDeque<LockRequest>,
    group_mode: GroupMode,
    cv: Arc<Condvar>,
}

#[derive(Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<LockDataId, LockQueue>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_shared_on_record(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
        fid: FileId,
    ) -> StorageResult<()> {
        self.lock_general(LockDataId::Record(fid, rid), txn, LockMode::Shared)
    }

    pub fn lock_exclusive_on_record(
        &self,
        txn: &Arc<Transaction>,
        rid: Rid,
        fid: FileId,
    ) -> StorageResult<()> {
        self.lock_general(LockDataId::Record(fid, rid), txn, LockMode::Exclusive)
    }

    pub fn lock_shared_on_table(&self, txn: &Arc<Transaction>, fid: FileId) -> StorageResult<()> {
        self.lock_general(LockDataId::Table(fid), txn, LockMode::Shared)
    }

    pub fn lock_exclusive_on_table(
        &self,
        txn: &Arc<Transaction>,
        fid: FileId,
    ) -> StorageResult<()> {
        self.lock_general(LockDataId::Table(fid), txn, LockMode::Exclusive)
    }

    pub fn lock_is_on_table(&self, txn: &Arc<Transaction>, fid: FileId) -> StorageResult<()> {
        self.lock_general(LockDataId::Table(fid), txn, LockMode::IntentionShared)
    }

    pub fn lock_ix_on_table(&self, txn: &Arc<Transaction>, fid: FileId) -> StorageResult<()> {
        self.lock_general(LockDataId::Table(fid), txn, LockMode::IntentionExclusive)
    }

    pub fn lock_six_on_table(&self, txn: &Arc<Transaction>, fid: FileId) -> StorageResult<()> {
        self.lock_general(
            LockDataId::Table(fid),
            txn,
            LockMode::SharedIntentionExclusive,
        )
    }

    fn lock_general(
        &self,
        id: LockDataId,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> StorageResult<()> {
        let mut table = self.lock_table.lock().unwrap();

        // Re-entry: the transaction may already hold this lock.
        if txn.holds_lock(&id) {
            let queue = table.get_mut(&id).ok_or_else(|| {
                StorageError::Internal("lock set references a missing queue".into())
            })?;
            let pos = queue
                .requests
                .iter()
                .position(|r| r.txn_id == txn.id())
                .ok_or_else(|| {
                    StorageError::Internal("lock set references a missing request".into())
                })?;
            let held = queue.requests[pos].mode;
            if held.dominates(mode) {
                return Ok(());
            }
            if queue.requests.len() == 1 {
                // Sole holder: upgrade in place.
                queue.requests[pos].mode = mode;
                queue.group_mode = GroupMode::of(mode);
                return Ok(());
            }
            // Give up the weaker lock and re-acquire below.
            queue.requests.remove(pos);
            txn.remove_lock(&id);
            queue.group_mode = queue
                .requests
                .front()
                .map(|r| GroupMode::of(r.mode))
                .unwrap_or_default();
        }

        txn.set_state(TxnState::Growing);

        loop {
            let queue = table.entry(id).or_default();
            if queue.requests.is_empty() || queue.group_mode.admits(mode) {
                queue.group_mode = queue.group_mode.combine(mode);
                queue.requests.push_back(LockRequest {
                    txn_id: txn.id(),
                    mode,
                });
                txn.add_lock(id);
                debug!("txn {} granted {:?} on {:?}", txn.id(), mode, id);
                return Ok(());
            }
            // Wound-wait: a requester younger than the queue head is
            // aborted instead of waiting.
            let head = queue.requests.front().unwrap().txn_id;
            if txn.id() > head {
                debug!(
                    "txn {} aborted by wound-wait against txn {} on {:?}",
                    txn.id(),
                    head,
                    id
                );
                return Err(StorageError::DeadlockPrevention(txn.id()));
            }
            let cv = queue.cv.clone();
            table = cv.wait(table).unwrap();
        }
    }

    /// Releases one lock; strict 2PL means this only runs at commit or
    /// abort. Recomputes the group mode from the remaining queue head
    /// and wakes every waiter.
    pub fn unlock(&self, txn: &Arc<Transaction>, id: LockDataId) -> StorageResult<()> {
        let mut table = self.lock_table.lock().unwrap();
        txn.set_state(TxnState::Shrinking);
        if let Some(queue) = table.get_mut(&id) {
            if let Some(pos) = queue.requests.iter().position(|r| r.txn_id == txn.id()) {
                queue.requests.remove(pos);
            }
            queue.group_mode = queue
                .requests
                .front()
                .map(|r| GroupMode::of(r.mode))
                .unwrap_or_default();
            queue.cv.notify_all();
            if queue.requests.is_empty() {
                // Keep the entry so waiters parked on its condvar can
                // re-check; it will be reused on the next request.
                queue.group_mode = GroupMode::NonLock;
            }
        }
        txn.remove_lock(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::Transaction;
    use std::thread;
    use std::time::Duration;

    fn txn(id: TxnId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id))
    }

    #[test]
    fn shared_locks_coexist_and_reenter() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        lm.lock_shared_on_table(&t1, 7).unwrap();
        lm.lock_shared_on_table(&t2, 7).unwrap();
        lm.lock_shared_on_table(&t1, 7).unwrap();
        lm.unlock(&t1, LockDataId::Table(7)).unwrap();
        lm.unlock(&t2, LockDataId::Table(7)).unwrap();
    }

    #[test]
    fn intention_modes_follow_the_matrix() {
        let lm = LockManager::new();
        let t1 = txn(1);
        let t2 = txn(2);
        lm.lock_ix_on_table(&t1, 3).unwrap();
        lm.lock_is_on_table(&t2, 3).unwrap();
        // S conflicts with the granted IX; t2 is younger, so wound-wait
        // aborts it.
        assert!(matches!(
            lm.lock_shared_on_table(&t2, 3),
            Err(StorageError::DeadlockPrevention(2))
        ));
    }

    #[test]
    fn sole_holder_upgrades_in_place() {
        let lm = LockManager::new();
        let t1 = txn(1);
        lm.lock_shared_on_record(&t1, Rid { page_no: 1, slot_no: 0 }, 5)
            .unwrap();
        lm.lock_exclusive_on_record(&t1, Rid { page_no: 1, slot_no: 0 }, 5)
            .unwrap();
        // The younger reader now conflicts with the upgraded X lock.
        let t2 = txn(2);
        assert!(matches!(
            lm.lock_shared_on_record(&t2, Rid { page_no: 1, slot_no: 0 }, 5),
            Err(StorageError::DeadlockPrevention(2))
        ));
    }

    #[test]
    fn younger_writer_is_wounded_older_writer_waits() {
        let lm = Arc::new(LockManager::new());
        let older = txn(1);
        let younger = txn(10);
        lm.lock_shared_on_table(&younger, 9).unwrap();

        // Younger conflicting with an older holder: aborted at once.
        let lm2 = lm.clone();
        let y2 = txn(11);
        lm.lock_shared_on_table(&older, 9).unwrap();
        // Head of queue is txn 10; txn 11 requesting X is younger.
        assert!(matches!(
            lm2.lock_exclusive_on_table(&y2, 9),
            Err(StorageError::DeadlockPrevention(11))
        ));

        // Older requester waits until the holders release.
        let oldest = txn(0);
        let lm3 = lm.clone();
        let waiter = thread::spawn(move || lm3.lock_exclusive_on_table(&oldest, 9));
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        lm.unlock(&younger, LockDataId::Table(9)).unwrap();
        lm.unlock(&older, LockDataId::Table(9)).unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn six_dominates_non_exclusive_requests() {
        let lm = LockManager::new();
        let t1 = txn(1);
        lm.lock_six_on_table(&t1, 2).unwrap();
        lm.lock_is_on_table(&t1, 2).unwrap();
        lm.lock_ix_on_table(&t1, 2).unwrap();
        lm.lock_shared_on_table(&t1, 2).unwrap();
        // Still a single queue entry holding SIX.
        lm.unlock(&t1, LockDataId::Table(2)).unwrap();
        let t2 = txn(2);
        lm.lock_exclusive_on_table(&t2, 2).unwrap();
    }
}
