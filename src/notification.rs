use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const KEY_PREFIX: &str = "notif_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Verified,
    Rejection,
}

/// 发给匿名提交者的通知 (提交方私有分区)
///
/// 只按指纹投递，没有任何其他收件人信息。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: String,
    pub evidence_id: String,
    pub recipient_fingerprint: String,
    pub kind: NotificationKind,
    pub message: String,
    pub from_org: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

impl Notification {
    /// `notif_<证据ID>_<毫秒时间戳>`
    pub fn derive_id(evidence_id: &str, at: DateTime<Utc>) -> String {
        format!("{KEY_PREFIX}{evidence_id}_{}", at.timestamp_millis())
    }

    pub fn verified(
        evidence_id: &str,
        fingerprint: &str,
        from_org: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            evidence_id,
            fingerprint,
            NotificationKind::Verified,
            "Your evidence has been successfully verified. It will now proceed to legal review."
                .to_string(),
            from_org,
            at,
        )
    }

    pub fn rejected(
        evidence_id: &str,
        fingerprint: &str,
        reason: &str,
        from_org: &str,
        at: DateTime<Utc>,
    ) -> Self {
        let message = format!(
            "Your evidence (ID: {evidence_id}) was REJECTED during verification. Reason: {reason}. \
             You may re-upload the evidence with a new ID."
        );
        Self::new(
            evidence_id,
            fingerprint,
            NotificationKind::Rejection,
            message,
            from_org,
            at,
        )
    }

    fn new(
        evidence_id: &str,
        fingerprint: &str,
        kind: NotificationKind,
        message: String,
        from_org: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            notification_id: Self::derive_id(evidence_id, at),
            evidence_id: evidence_id.to_string(),
            recipient_fingerprint: fingerprint.to_string(),
            kind,
            message,
            from_org: from_org.to_string(),
            timestamp: at,
            read: false,
        }
    }

    /// 已读标记只能从 false 变为 true；返回是否发生了变化
    pub fn mark_read(&mut self) -> bool {
        let changed = !self.read;
        self.read = true;
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationList {
    pub notifications: Vec<Notification>,
    pub count: usize,
}

impl From<Vec<Notification>> for NotificationList {
    fn from(notifications: Vec<Notification>) -> Self {
        let count = notifications.len();
        Self {
            notifications,
            count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_message_tells_submitter_to_use_new_id() {
        let n = Notification::rejected("E2", "fp1", "mismatch", "VerifierOrg", Utc::now());
        assert_eq!(n.kind, NotificationKind::Rejection);
        assert!(n.message.contains("E2"));
        assert!(n.message.contains("mismatch"));
        assert!(n.message.contains("new ID"));
        assert!(n.notification_id.starts_with("notif_E2_"));
        assert!(!n.read);
    }

    #[test]
    fn read_flag_is_one_way() {
        let mut n = Notification::verified("E1", "fp1", "VerifierOrg", Utc::now());
        assert!(n.mark_read());
        assert!(!n.mark_read());
        assert!(n.read);
    }
}
