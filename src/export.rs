use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CustodyError;
use crate::evidence::{
    Anchor, AnonymousIdentity, BulkMembership, Category, CustodyAction, CustodyEntry,
    EvidenceRecord, FileType, IntegrityStatus,
};
use crate::store::StoreError;

/// 上庭导出包
///
/// 公共字段 + 保管链的自包含快照，`export_hash` 为对其余内容的 SHA-256 封印。
/// 快照里的保管链不含 EXPORT 条目 (它们描述的正是导出包自身)，
/// 时间使用首次导出时间，所以内容不变时重复导出得到同一个包。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportPackage {
    pub evidence_id: String,
    pub content_pointer: String,
    pub content_hash: String,
    pub content_type: FileType,
    pub content_size: u64,
    pub category: Option<Category>,
    pub description: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub exported_at: DateTime<Utc>,
    pub anchor: Option<Anchor>,
    pub integrity_status: IntegrityStatus,
    pub bulk: Option<BulkMembership>,
    pub identity: Option<AnonymousIdentity>,
    pub custody_log: Vec<CustodyEntry>,
    pub export_hash: String,
}

impl ExportPackage {
    pub fn seal(record: &EvidenceRecord, exported_at: DateTime<Utc>) -> Result<Self, CustodyError> {
        let mut package = Self {
            evidence_id: record.evidence_id.clone(),
            content_pointer: record.content_pointer.clone(),
            content_hash: record.content_hash.clone(),
            content_type: record.content_type,
            content_size: record.content_size,
            category: record.category,
            description: record.description.clone(),
            submitted_at: record.submitted_at,
            verified_at: record.verified_at,
            reviewed_at: record.reviewed_at,
            exported_at,
            anchor: record.anchor.clone(),
            integrity_status: record.integrity_status,
            bulk: record.bulk.clone(),
            identity: record.identity.clone(),
            custody_log: record
                .custody_log
                .iter()
                .filter(|entry| entry.action != CustodyAction::Export)
                .cloned()
                .collect(),
            export_hash: String::new(),
        };
        package.export_hash = package.digest()?;
        Ok(package)
    }

    /// 法院侧复核：重新计算封印并比较
    pub fn verify_seal(&self) -> Result<bool, CustodyError> {
        Ok(self.digest()? == self.export_hash)
    }

    fn digest(&self) -> Result<String, CustodyError> {
        let unsealed = Self {
            export_hash: String::new(),
            ..self.clone()
        };
        // bcs 为规范编码，同一内容只有一种字节序列
        let payload = bcs::to_bytes(&unsealed).map_err(StoreError::from)?;
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        Ok(format!("{:x}", hasher.finalize()))
    }
}
