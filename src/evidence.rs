use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize}; // 引入序列化库：JSON 用于存储与 API，bcs 用于确定性哈希

use crate::error::CustodyError;

// ==========================================
// 1. 状态机字段
// ==========================================

/// 证据在保管链上的当前状态
///
/// `SUBMITTED → {VERIFIED | REJECTED}`，`VERIFIED → UNDER_REVIEW → REVIEWED → EXPORTED`。
/// REJECTED 与 EXPORTED 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Submitted,
    Verified,
    // 旧数据中的 INTEGRITY_FAILED 统一读成 REJECTED
    #[serde(alias = "INTEGRITY_FAILED")]
    Rejected,
    UnderReview,
    Reviewed,
    Exported,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Submitted,
        Status::Verified,
        Status::Rejected,
        Status::UnderReview,
        Status::Reviewed,
        Status::Exported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Submitted => "SUBMITTED",
            Status::Verified => "VERIFIED",
            Status::Rejected => "REJECTED",
            Status::UnderReview => "UNDER_REVIEW",
            Status::Reviewed => "REVIEWED",
            Status::Exported => "EXPORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Rejected | Status::Exported)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INTEGRITY_FAILED" => Ok(Status::Rejected),
            other => Status::ALL
                .into_iter()
                .find(|status| status.as_str() == other)
                .ok_or_else(|| CustodyError::validation(format!("unknown status '{other}'"))),
        }
    }
}

/// 完整性校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityStatus {
    Pending,
    Verified,
    Failed,
}

// ==========================================
// 2. 封闭枚举：文件类型 / 分类
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Video,
    Audio,
    Document,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    FinancialFraud,
    Corruption,
    Abuse,
    Harassment,
    Environmental,
    Safety,
    Other,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::FinancialFraud,
        Category::Corruption,
        Category::Abuse,
        Category::Harassment,
        Category::Environmental,
        Category::Safety,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::FinancialFraud => "financial_fraud",
            Category::Corruption => "corruption",
            Category::Abuse => "abuse",
            Category::Harassment => "harassment",
            Category::Environmental => "environmental",
            Category::Safety => "safety",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| CustodyError::validation(format!("unknown category '{s}'")))
    }
}

// ==========================================
// 3. 保管链 (Custody Log)
// ==========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CustodyAction {
    Submit,
    BulkSubmit,
    Verify,
    Review,
    Export,
    Anchor,
    AddNote,
    AddComment,
}

/// 保管链中的单条记录
///
/// 只记录组织 ID，不记录个人身份。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyEntry {
    pub action: CustodyAction,
    pub actor_org: String,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

/// 只追加的保管链
///
/// 不提供任何修改或删除已有条目的方法。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustodyLog(Vec<CustodyEntry>);

impl CustodyLog {
    pub fn starting_with(entry: CustodyEntry) -> Self {
        Self(vec![entry])
    }

    pub fn append(&mut self, entry: CustodyEntry) {
        self.0.push(entry);
    }

    pub fn entries(&self) -> &[CustodyEntry] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn last(&self) -> Option<&CustodyEntry> {
        self.0.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CustodyEntry> {
        self.0.iter()
    }
}

// ==========================================
// 4. 证据记录 (共享账本，所有组织可读)
// ==========================================

/// 公共时间戳锚点 (外部链交易引用，格式不做校验)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub tx_ref: String,
    pub anchored_at: DateTime<Utc>,
}

/// 批量提交中的归属
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkMembership {
    pub submission_id: String,
    pub index: u32,
}

/// 匿名身份：公钥指纹 + 对内容哈希的分离签名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousIdentity {
    pub fingerprint: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    // === 身份与内容 ===
    pub evidence_id: String,
    /// 链下存储引用 (例如 IPFS CID)
    pub content_pointer: String,
    /// 提交时确定，之后永不修改
    pub content_hash: String,
    pub content_type: FileType,
    pub content_size: u64,
    pub category: Option<Category>,
    pub description: Option<String>,
    pub submitted_at: DateTime<Utc>,

    // === 状态机 ===
    pub status: Status,
    pub integrity_status: IntegrityStatus,
    pub rejection_comment: Option<String>,

    // === 时间戳 (各自只由到达对应状态的那次转换写入一次) ===
    pub anchor: Option<Anchor>,
    pub verified_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub exported_at: Option<DateTime<Utc>>,
    pub export_hash: Option<String>,

    pub custody_log: CustodyLog,

    pub bulk: Option<BulkMembership>,
    /// 旧版匿名提交没有身份字段，也就没有信誉与通知
    pub identity: Option<AnonymousIdentity>,
}

impl EvidenceRecord {
    pub fn fingerprint(&self) -> Option<&str> {
        self.identity.as_ref().map(|id| id.fingerprint.as_str())
    }
}

// ==========================================
// 5. 提交输入
// ==========================================

/// 身份证明
///
/// 带上 `public_key` (hex) 时会校验指纹与签名；不带时仅检查非空。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityProof {
    pub fingerprint: String,
    pub signature: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvidence {
    pub evidence_id: String,
    pub content_pointer: String,
    pub content_hash: String,
    pub content_type: FileType,
    pub content_size: u64,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub identity: Option<IdentityProof>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkSubmissionResult {
    pub bulk_submission_id: String,
    pub submitted_count: usize,
    pub evidence_ids: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

/// 标识符必须非空且不含控制字符
pub fn validate_identifier(kind: &str, value: &str) -> Result<(), CustodyError> {
    if value.trim().is_empty() {
        return Err(CustodyError::validation(format!("{kind} is required")));
    }
    if value.chars().any(char::is_control) {
        return Err(CustodyError::validation(format!(
            "{kind} must not contain control characters"
        )));
    }
    Ok(())
}
