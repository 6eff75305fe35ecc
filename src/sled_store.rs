use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use tracing::{debug, warn};

use crate::ledger::{LedgerLeaf, LedgerProof, RevisionLedger};
use crate::store::{CommitReceipt, Partition, RecordStore, Revision, StoreError, WriteSet};

const TREE_NAME: &str = "custody";
const HISTORY_TAG: u8 = b'h';
const LEDGER_TAG: u8 = b'l';

/// 基于 sled 的记录存储
///
/// 所有分区共用一棵树，键格式 `[分区标记][键]`，于是一次提交只需一个 `sled::Batch`。
/// 历史版本：`[h][键][0x00][序号 BE]`；账本叶子：`[l][序号 BE]`。
pub struct SledStore {
    tree: sled::Tree,
    /// 提交串行化：序号分配、MMR 追加、落盘在同一把锁内完成
    ledger: Mutex<LedgerState>,
}

struct LedgerState {
    next_sequence: u64,
    mmr: RevisionLedger,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    /// 临时库，进程退出即删除
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    fn from_db(db: &sled::Db) -> Result<Self, StoreError> {
        let tree = db.open_tree(TREE_NAME)?;
        let state = replay_ledger(&tree)?;
        debug!(leaves = state.next_sequence, "账本重放完成");
        Ok(Self {
            tree,
            ledger: Mutex::new(state),
        })
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.tree.flush()?;
        Ok(())
    }

    fn lock_ledger(&self) -> Result<MutexGuard<'_, LedgerState>, StoreError> {
        self.ledger
            .lock()
            .map_err(|_| StoreError::Ledger("ledger lock poisoned".into()))
    }
}

fn replay_ledger(tree: &sled::Tree) -> Result<LedgerState, StoreError> {
    let mut mmr = RevisionLedger::new();
    let mut next_sequence = 0;
    for item in tree.scan_prefix([LEDGER_TAG]) {
        let (_, value) = item?;
        let leaf: [u8; 32] = value
            .as_ref()
            .try_into()
            .map_err(|_| StoreError::Corrupt("ledger leaf is not 32 bytes".into()))?;
        mmr.append(leaf)?;
        next_sequence += 1;
    }
    Ok(LedgerState { next_sequence, mmr })
}

fn data_key(partition: Partition, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(partition.tag());
    out.extend_from_slice(key.as_bytes());
    out
}

fn history_prefix(key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 2);
    out.push(HISTORY_TAG);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out
}

fn history_key(key: &str, sequence: u64) -> Vec<u8> {
    let mut out = history_prefix(key);
    out.extend_from_slice(&sequence.to_be_bytes());
    out
}

fn ledger_key(sequence: u64) -> Vec<u8> {
    let mut out = vec![LEDGER_TAG];
    out.extend_from_slice(&sequence.to_be_bytes());
    out
}

/// 把写集合展开成一个 batch；公共分区的写入同时生成历史版本与账本叶子
fn stage_writes(
    state: &mut LedgerState,
    writes: WriteSet,
    receipt: &mut CommitReceipt,
) -> Result<sled::Batch, StoreError> {
    let committed_at = Utc::now();
    let mut batch = sled::Batch::default();

    for write in writes.into_writes() {
        if write.partition == Partition::Shared {
            let sequence = state.next_sequence;
            let leaf = LedgerLeaf {
                sequence,
                key: &write.key,
                committed_at,
                value_digest: *blake3::hash(&write.value).as_bytes(),
            }
            .hash()?;
            let (_, position) = state.mmr.append(leaf)?;

            let tx_id = hex::encode(leaf);
            let revision = Revision {
                tx_id: tx_id.clone(),
                position,
                committed_at,
                is_delete: false,
                value: Some(write.value.clone()),
            };
            batch.insert(history_key(&write.key, sequence), bcs::to_bytes(&revision)?);
            batch.insert(ledger_key(sequence), leaf.to_vec());
            state.next_sequence += 1;
            receipt.tx_ids.push(tx_id);
        }
        batch.insert(data_key(write.partition, &write.key), write.value);
    }

    Ok(batch)
}

impl RecordStore for SledStore {
    fn get(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tree.get(data_key(partition, key))?.map(|v| v.to_vec()))
    }

    fn exists(&self, partition: Partition, key: &str) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(data_key(partition, key))?)
    }

    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.tree
            .scan_prefix(data_key(partition, prefix))
            .map(|item| {
                let (k, v) = item?;
                let key = String::from_utf8(k[1..].to_vec())
                    .map_err(|e| StoreError::Corrupt(format!("non utf-8 key: {e}")))?;
                Ok((key, v.to_vec()))
            })
            .collect()
    }

    fn commit(&self, writes: WriteSet) -> Result<CommitReceipt, StoreError> {
        let mut state = self.lock_ledger()?;
        let mut receipt = CommitReceipt::default();

        let applied = stage_writes(&mut state, writes, &mut receipt)
            .and_then(|batch| Ok(self.tree.apply_batch(batch)?));
        if let Err(e) = applied {
            // 内存中的 MMR 可能已经前进，按磁盘上的叶子回滚
            warn!(error = %e, "提交失败，回滚账本");
            *state = replay_ledger(&self.tree)?;
            return Err(e);
        }

        receipt.ledger_root = state.mmr.root()?.map(hex::encode);
        Ok(receipt)
    }

    fn history(&self, key: &str) -> Result<Vec<Revision>, StoreError> {
        self.tree
            .scan_prefix(history_prefix(key))
            .map(|item| {
                let (_, v) = item?;
                Ok(bcs::from_bytes::<Revision>(&v)?)
            })
            .collect()
    }

    fn ledger_root(&self) -> Result<Option<String>, StoreError> {
        Ok(self.lock_ledger()?.mmr.root()?.map(hex::encode))
    }

    fn ledger_proof(&self, position: u64) -> Result<Option<LedgerProof>, StoreError> {
        self.lock_ledger()?.mmr.proof(position)
    }
}
