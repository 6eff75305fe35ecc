use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CustodyError;
use crate::evidence::EvidenceRecord;
use crate::store::{Partition, RecordStore, StoreError};

// ==========================================
// 1. 过滤条件
// ==========================================

/// 可过滤的字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Status,
    Category,
    BulkSubmissionId,
    SubmittedAt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Time(DateTime<Utc>),
}

impl FieldValue {
    fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Time(a), FieldValue::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(Field, FieldValue),
    /// 闭区间 `[from, to]`
    Range {
        field: Field,
        from: FieldValue,
        to: FieldValue,
    },
}

impl Predicate {
    fn matches(&self, record: &EvidenceRecord) -> bool {
        match self {
            Predicate::Eq(field, expected) => field_value(record, *field).as_ref() == Some(expected),
            Predicate::Range { field, from, to } => match field_value(record, *field) {
                Some(actual) => {
                    matches!(
                        actual.compare(from),
                        Some(Ordering::Greater | Ordering::Equal)
                    ) && matches!(actual.compare(to), Some(Ordering::Less | Ordering::Equal))
                }
                None => false,
            },
        }
    }
}

fn field_value(record: &EvidenceRecord, field: Field) -> Option<FieldValue> {
    match field {
        Field::Status => Some(FieldValue::Text(record.status.as_str().to_string())),
        Field::Category => record
            .category
            .map(|c| FieldValue::Text(c.as_str().to_string())),
        Field::BulkSubmissionId => record
            .bulk
            .as_ref()
            .map(|b| FieldValue::Text(b.submission_id.clone())),
        Field::SubmittedAt => Some(FieldValue::Time(record.submitted_at)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    ByIdentifier,
    NewestFirst,
}

/// 结构化查询：谓词全部满足才算匹配
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    predicates: Vec<Predicate>,
    order: SortOrder,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: Field, value: impl Into<String>) -> Self {
        self.predicates
            .push(Predicate::Eq(field, FieldValue::Text(value.into())));
        self
    }

    pub fn between(mut self, field: Field, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.predicates.push(Predicate::Range {
            field,
            from: FieldValue::Time(from),
            to: FieldValue::Time(to),
        });
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = SortOrder::NewestFirst;
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn matches(&self, record: &EvidenceRecord) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }
}

// ==========================================
// 2. 分页
// ==========================================

/// 不透明游标：由查询引擎生成，调用方原样传回
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub cursor: Option<Cursor>,
}

impl PageRequest {
    pub fn first(page_size: u32) -> Self {
        Self {
            page_size: Some(page_size),
            cursor: None,
        }
    }

    pub fn after(page_size: u32, cursor: Cursor) -> Self {
        Self {
            page_size: Some(page_size),
            cursor: Some(cursor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub records: Vec<T>,
    pub fetched_records_count: usize,
    /// 没有下一页时为空
    pub cursor: Option<Cursor>,
}

/// 单条历史版本 (删除版本不带记录)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub tx_id: String,
    pub position: u64,
    pub timestamp: DateTime<Utc>,
    pub is_delete: bool,
    pub record: Option<EvidenceRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceHistory {
    pub evidence_id: String,
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("malformed cursor '{0}'")]
    MalformedCursor(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("undecodable record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<QueryError> for CustodyError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::MalformedCursor(_) => CustodyError::Validation(err.to_string()),
            QueryError::Store(e) => CustodyError::Store(e),
            QueryError::Codec(e) => CustodyError::Codec(e),
        }
    }
}

// ==========================================
// 3. 查询协作方
// ==========================================

pub trait QueryEngine: Send + Sync {
    fn query(&self, query: &Query, page: &PageRequest) -> Result<Page<EvidenceRecord>, QueryError>;

    fn count(&self, query: &Query) -> Result<u64, QueryError>;

    /// 按提交顺序回放某个证据的全部版本
    fn history(&self, evidence_id: &str) -> Result<Vec<HistoryEntry>, QueryError>;
}

/// 直接扫描公共分区的查询引擎
///
/// 游标编码的是结果集中的偏移量，对调用方不透明。
pub struct StoreQuery {
    store: Arc<dyn RecordStore>,
    default_page_size: u32,
    max_page_size: u32,
}

impl StoreQuery {
    pub fn new(store: Arc<dyn RecordStore>, default_page_size: u32, max_page_size: u32) -> Self {
        let max_page_size = max_page_size.max(1);
        Self {
            store,
            default_page_size: default_page_size.clamp(1, max_page_size),
            max_page_size,
        }
    }

    fn page_size(&self, requested: Option<u32>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size) as usize
    }

    fn matching(&self, query: &Query) -> Result<Vec<EvidenceRecord>, QueryError> {
        let mut records = Vec::new();
        for (_, bytes) in self.store.scan_prefix(Partition::Shared, "")? {
            let record: EvidenceRecord = serde_json::from_slice(&bytes)?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        match query.order {
            SortOrder::ByIdentifier => records.sort_by(|a, b| a.evidence_id.cmp(&b.evidence_id)),
            SortOrder::NewestFirst => records.sort_by(|a, b| {
                b.submitted_at
                    .cmp(&a.submitted_at)
                    .then_with(|| a.evidence_id.cmp(&b.evidence_id))
            }),
        }
        Ok(records)
    }
}

fn encode_cursor(offset: u64) -> Cursor {
    Cursor(hex::encode(offset.to_be_bytes()))
}

fn decode_cursor(cursor: &Cursor) -> Result<u64, QueryError> {
    let malformed = || QueryError::MalformedCursor(cursor.0.clone());
    let bytes = hex::decode(&cursor.0).map_err(|_| malformed())?;
    let bytes: [u8; 8] = bytes.try_into().map_err(|_| malformed())?;
    Ok(u64::from_be_bytes(bytes))
}

impl QueryEngine for StoreQuery {
    fn query(&self, query: &Query, page: &PageRequest) -> Result<Page<EvidenceRecord>, QueryError> {
        let offset = match &page.cursor {
            Some(cursor) => decode_cursor(cursor)? as usize,
            None => 0,
        };
        let size = self.page_size(page.page_size);
        let matching = self.matching(query)?;
        let total = matching.len();

        let records: Vec<EvidenceRecord> = matching.into_iter().skip(offset).take(size).collect();
        let next = offset + records.len();
        let cursor = (records.len() == size && next < total).then(|| encode_cursor(next as u64));

        Ok(Page {
            fetched_records_count: records.len(),
            records,
            cursor,
        })
    }

    fn count(&self, query: &Query) -> Result<u64, QueryError> {
        Ok(self.matching(query)?.len() as u64)
    }

    fn history(&self, evidence_id: &str) -> Result<Vec<HistoryEntry>, QueryError> {
        self.store
            .history(evidence_id)?
            .into_iter()
            .map(|rev| -> Result<HistoryEntry, QueryError> {
                let record = match (&rev.value, rev.is_delete) {
                    (Some(bytes), false) => Some(serde_json::from_slice(bytes)?),
                    _ => None,
                };
                Ok(HistoryEntry {
                    tx_id: rev.tx_id,
                    position: rev.position,
                    timestamp: rev.committed_at,
                    is_delete: rev.is_delete,
                    record,
                })
            })
            .collect()
    }
}
