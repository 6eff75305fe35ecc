use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 首次提交时的中性分
pub const INITIAL_TRUST_SCORE: u8 = 50;
pub const MAX_TRUST_SCORE: u8 = 100;
/// 验证通过加分
pub const VERIFIED_CREDIT: u8 = 10;
/// 验证失败扣分
pub const REJECTED_PENALTY: u8 = 15;

const KEY_PREFIX: &str = "reputation_";

/// 匿名信誉 (提交方私有分区，按指纹存储)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reputation {
    pub fingerprint: String,
    pub total_submissions: u64,
    pub verified_submissions: u64,
    pub rejected_submissions: u64,
    pub exported_submissions: u64,
    /// 始终位于 [0, 100]
    pub trust_score: u8,
    pub first_submission_at: Option<DateTime<Utc>>,
    pub last_submission_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl Reputation {
    /// 尚无记录的指纹对外呈现的样子 (不落盘)
    pub fn neutral(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            total_submissions: 0,
            verified_submissions: 0,
            rejected_submissions: 0,
            exported_submissions: 0,
            trust_score: INITIAL_TRUST_SCORE,
            first_submission_at: None,
            last_submission_at: None,
            last_updated_at: None,
        }
    }

    pub fn first_submission(fingerprint: impl Into<String>, at: DateTime<Utc>) -> Self {
        let mut reputation = Self::neutral(fingerprint);
        reputation.first_submission_at = Some(at);
        reputation.record_submission(at);
        reputation
    }

    pub fn record_submission(&mut self, at: DateTime<Utc>) {
        self.total_submissions += 1;
        self.last_submission_at = Some(at);
        self.last_updated_at = Some(at);
    }

    pub fn record_verification(&mut self, passed: bool, at: DateTime<Utc>) {
        if passed {
            self.verified_submissions += 1;
            self.trust_score = self.trust_score.saturating_add(VERIFIED_CREDIT).min(MAX_TRUST_SCORE);
        } else {
            self.rejected_submissions += 1;
            self.trust_score = self.trust_score.saturating_sub(REJECTED_PENALTY);
        }
        self.last_updated_at = Some(at);
    }

    pub fn record_export(&mut self, at: DateTime<Utc>) {
        self.exported_submissions += 1;
        self.last_updated_at = Some(at);
    }

    pub fn storage_key(fingerprint: &str) -> String {
        format!("{KEY_PREFIX}{fingerprint}")
    }
}
