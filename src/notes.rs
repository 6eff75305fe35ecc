use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 证据 ID 与笔记/评论 ID 之间的分隔符
///
/// 标识符不允许含控制字符，`_` 却是合法字符，所以用 NUL 才不会让两个 ID 拼出同一个键。
const KEY_SEPARATOR: char = '\u{0}';

/// 法务对证据能否上庭的判断
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CourtReadiness {
    Ready,
    NotReady,
    NeedsReview,
}

/// 验证方私有技术笔记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationNote {
    pub evidence_id: String,
    pub note_id: String,
    pub content: String,
    pub hash_comparison: String,
    pub created_at: DateTime<Utc>,
    pub verifier_org: String,
}

impl VerificationNote {
    pub fn storage_key(evidence_id: &str, note_id: &str) -> String {
        format!("{}{note_id}", Self::evidence_prefix(evidence_id))
    }

    pub fn evidence_prefix(evidence_id: &str) -> String {
        format!("note_{evidence_id}{KEY_SEPARATOR}")
    }
}

/// 法务方私有评估
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalComment {
    pub evidence_id: String,
    pub comment_id: String,
    pub content: String,
    pub court_readiness: CourtReadiness,
    pub recommendation: String,
    pub created_at: DateTime<Utc>,
    pub legal_reviewer_org: String,
}

impl LegalComment {
    pub fn storage_key(evidence_id: &str, comment_id: &str) -> String {
        format!("{}{comment_id}", Self::evidence_prefix(evidence_id))
    }

    pub fn evidence_prefix(evidence_id: &str) -> String {
        format!("comment_{evidence_id}{KEY_SEPARATOR}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVerificationNote {
    pub note_id: String,
    pub content: String,
    #[serde(default)]
    pub hash_comparison: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLegalComment {
    pub comment_id: String,
    pub content: String,
    pub court_readiness: CourtReadiness,
    #[serde(default)]
    pub recommendation: String,
}
