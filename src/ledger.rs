use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ckb_merkle_mountain_range::{util::MemStore, Merge, MerkleProof, MMR};
use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// 模块：修订账本 (Revision Ledger)
///
/// **职责**: 给公共分区的每一次提交开具“存在性证明”。
/// 每个历史版本压缩成 32 字节的叶子，按提交顺序追加进 MMR (Merkle Mountain Range)。
/// MMR 只追加不修改，Root 不变即意味着历史没有被改写。

/// 合并策略：$$ H_{parent} = Blake3(H_{left} \ || \ H_{right}) $$
pub struct MergeBlake3;

impl Merge for MergeBlake3 {
    type Item = [u8; 32];

    fn merge(lhs: &Self::Item, rhs: &Self::Item) -> ckb_merkle_mountain_range::Result<Self::Item> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(lhs);
        hasher.update(rhs);
        Ok(*hasher.finalize().as_bytes())
    }
}

/// 叶子原像
///
/// 用 bcs 编码：serde_json 不保证规范序列化，bcs 对同一个值只有一种编码。
#[derive(Serialize)]
pub struct LedgerLeaf<'a> {
    pub sequence: u64,
    pub key: &'a str,
    pub committed_at: DateTime<Utc>,
    pub value_digest: [u8; 32],
}

impl LedgerLeaf<'_> {
    pub fn hash(&self) -> Result<[u8; 32], StoreError> {
        let payload = bcs::to_bytes(self)?;
        Ok(*blake3::hash(&payload).as_bytes())
    }
}

pub struct RevisionLedger {
    /// 节点存于内存，重启时由持久化的叶子重放得到
    store: MemStore<[u8; 32]>,
    mmr_size: u64,
    /// 叶子位置 -> 叶子哈希，开具证明时需要
    leaves: BTreeMap<u64, [u8; 32]>,
}

impl RevisionLedger {
    pub fn new() -> Self {
        Self {
            store: MemStore::default(),
            mmr_size: 0,
            leaves: BTreeMap::new(),
        }
    }

    /// 追加一片叶子，返回 (新 Root, 叶子位置)
    pub fn append(&mut self, leaf: [u8; 32]) -> Result<([u8; 32], u64), StoreError> {
        let mut mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        let pos = mmr
            .push(leaf)
            .map_err(|e| StoreError::Ledger(format!("MMR append error: {}", e)))?;
        let root = mmr
            .get_root()
            .map_err(|e| StoreError::Ledger(format!("MMR get_root error: {}", e)))?;
        // commit 会消费 mmr，先取大小
        let size = mmr.mmr_size();
        mmr.commit()
            .map_err(|e| StoreError::Ledger(format!("MMR commit error: {}", e)))?;

        self.mmr_size = size;
        self.leaves.insert(pos, leaf);
        Ok((root, pos))
    }

    pub fn root(&self) -> Result<Option<[u8; 32]>, StoreError> {
        if self.mmr_size == 0 {
            return Ok(None);
        }
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        mmr.get_root()
            .map(Some)
            .map_err(|e| StoreError::Ledger(format!("MMR get_root error: {}", e)))
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn proof(&self, position: u64) -> Result<Option<LedgerProof>, StoreError> {
        let Some(leaf) = self.leaves.get(&position) else {
            return Ok(None);
        };
        let mmr = MMR::<[u8; 32], MergeBlake3, _>::new(self.mmr_size, &self.store);
        let proof = mmr
            .gen_proof(vec![position])
            .map_err(|e| StoreError::Ledger(format!("MMR gen_proof error: {}", e)))?;
        let root = mmr
            .get_root()
            .map_err(|e| StoreError::Ledger(format!("MMR get_root error: {}", e)))?;

        Ok(Some(LedgerProof {
            position,
            mmr_size: proof.mmr_size(),
            root: hex::encode(root),
            leaf: hex::encode(leaf),
            items: proof.proof_items().iter().map(hex::encode).collect(),
        }))
    }
}

impl Default for RevisionLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// 可交给第三方审计员的包含性证明 (全部 hex 编码)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerProof {
    pub position: u64,
    pub mmr_size: u64,
    pub root: String,
    pub leaf: String,
    pub items: Vec<String>,
}

impl LedgerProof {
    /// 审计员本地回放：由叶子和路径重新算出 Root 并比较
    pub fn verify(&self) -> Result<bool, StoreError> {
        let root = decode_node(&self.root)?;
        let leaf = decode_node(&self.leaf)?;
        let items = self
            .items
            .iter()
            .map(|item| decode_node(item))
            .collect::<Result<Vec<_>, _>>()?;

        let proof = MerkleProof::<[u8; 32], MergeBlake3>::new(self.mmr_size, items);
        proof
            .verify(root, vec![(self.position, leaf)])
            .map_err(|e| StoreError::Ledger(format!("MMR verify error: {}", e)))
    }
}

fn decode_node(value: &str) -> Result<[u8; 32], StoreError> {
    let bytes = hex::decode(value).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("ledger node {value} is not 32 bytes")))
}
