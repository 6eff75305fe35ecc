use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerProof;

/// 存储分区
///
/// `Shared` 为所有组织可读的公共账本，其余三个分区各自只属于一个组织。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Shared,
    SubmitterPrivate,
    VerifierPrivate,
    LegalPrivate,
}

impl Partition {
    /// 键前缀字节，保证不同分区的键空间互不重叠
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Partition::Shared => b'e',
            Partition::SubmitterPrivate => b's',
            Partition::VerifierPrivate => b'v',
            Partition::LegalPrivate => b'g',
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("bcs error: {0}")]
    Bcs(#[from] bcs::Error),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("corrupt entry: {0}")]
    Corrupt(String),

    /// 其他后端实现的通用失败
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub partition: Partition,
    pub key: String,
    pub value: Vec<u8>,
}

/// 一次原子提交的写集合：要么全部落盘，要么全部不生效
#[derive(Debug, Clone, Default)]
pub struct WriteSet {
    writes: Vec<Write>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, partition: Partition, key: impl Into<String>, value: Vec<u8>) {
        self.writes.push(Write {
            partition,
            key: key.into(),
            value,
        });
    }

    pub fn put_json<T: Serialize>(
        &mut self,
        partition: Partition,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        self.put(partition, key, bytes);
        Ok(())
    }

    pub fn touches(&self, partition: Partition) -> bool {
        self.writes.iter().any(|w| w.partition == partition)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// 公共分区某个键的一次历史版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// 账本叶子哈希 (hex)，同时作为交易 ID
    pub tx_id: String,
    /// 叶子在 MMR 中的位置
    pub position: u64,
    pub committed_at: DateTime<Utc>,
    pub is_delete: bool,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    pub tx_ids: Vec<String>,
    pub ledger_root: Option<String>,
}

/// 记录存储协作方
///
/// 公共分区的每次写入都会留下历史版本并进入账本；私有分区只保存最新值。
pub trait RecordStore: Send + Sync {
    fn get(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn exists(&self, partition: Partition, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(partition, key)?.is_some())
    }

    /// 按键顺序返回前缀匹配的 (键, 值)
    fn scan_prefix(
        &self,
        partition: Partition,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    fn commit(&self, writes: WriteSet) -> Result<CommitReceipt, StoreError>;

    /// 按提交顺序返回公共分区某个键的全部历史
    fn history(&self, key: &str) -> Result<Vec<Revision>, StoreError>;

    fn ledger_root(&self) -> Result<Option<String>, StoreError>;

    /// `position` 不是账本叶子时返回 `None`
    fn ledger_proof(&self, position: u64) -> Result<Option<LedgerProof>, StoreError>;
}
