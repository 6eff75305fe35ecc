use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{CustodyError, CustodyResult};
use crate::locks::KeyLocks;
use crate::notification::Notification;
use crate::reputation::Reputation;
use crate::store::{Partition, RecordStore, WriteSet};

/// 主转换提交后发出的事件
///
/// 只有带指纹的证据才会产生事件：旧版匿名提交没有信箱，也没有信誉。
/// 提交计数不在此列，它和证据记录一起原子落盘。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustodyEvent {
    VerificationOutcome {
        evidence_id: String,
        fingerprint: String,
        passed: bool,
        reason: Option<String>,
        from_org: String,
        at: DateTime<Utc>,
    },
    Exported {
        evidence_id: String,
        fingerprint: String,
        at: DateTime<Utc>,
    },
}

/// 信誉/通知更新失败：只记警告，不影响已提交的主转换
#[derive(Debug, Error)]
#[error("secondary {effect} update for evidence {evidence_id} failed: {source}")]
pub struct SecondaryFailure {
    pub effect: &'static str,
    pub evidence_id: String,
    #[source]
    pub source: CustodyError,
}

/// 副作用分发器
///
/// 在主转换提交且记录锁释放之后才运行，结构上无法回滚主转换。
/// 写入只落在提交方私有分区。信誉键的锁与 service 共用，提交时的计数不会被覆盖。
pub struct SideEffects {
    store: Arc<dyn RecordStore>,
    locks: Arc<KeyLocks>,
}

impl SideEffects {
    pub fn new(store: Arc<dyn RecordStore>, locks: Arc<KeyLocks>) -> Self {
        Self { store, locks }
    }

    pub fn dispatch(&self, events: Vec<CustodyEvent>) -> Vec<SecondaryFailure> {
        let mut failures = Vec::new();
        for event in events {
            match event {
                CustodyEvent::VerificationOutcome {
                    evidence_id,
                    fingerprint,
                    passed,
                    reason,
                    from_org,
                    at,
                } => {
                    let result = self.update_reputation(&fingerprint, |rep| {
                        rep.record_verification(passed, at)
                    });
                    isolate("reputation", &evidence_id, result, &mut failures);

                    let notification = if passed {
                        Notification::verified(&evidence_id, &fingerprint, &from_org, at)
                    } else {
                        let reason = reason.as_deref().unwrap_or_default();
                        Notification::rejected(&evidence_id, &fingerprint, reason, &from_org, at)
                    };
                    let result = self.deliver(&notification);
                    isolate("notification", &evidence_id, result, &mut failures);
                }
                CustodyEvent::Exported {
                    evidence_id,
                    fingerprint,
                    at,
                } => {
                    let result = self.update_reputation(&fingerprint, |rep| rep.record_export(at));
                    isolate("reputation", &evidence_id, result, &mut failures);
                }
            }
        }
        failures
    }

    /// 记录不存在时什么也不做：信誉由首次提交创建，这里不追溯
    fn update_reputation(
        &self,
        fingerprint: &str,
        apply: impl FnOnce(&mut Reputation),
    ) -> CustodyResult<()> {
        let key = Reputation::storage_key(fingerprint);
        let _guard = self.locks.lock(&key);

        let Some(bytes) = self.store.get(Partition::SubmitterPrivate, &key)? else {
            debug!("指纹没有信誉记录，跳过更新");
            return Ok(());
        };
        let mut reputation: Reputation = serde_json::from_slice(&bytes)?;
        apply(&mut reputation);
        self.put(&key, &reputation)
    }

    fn deliver(&self, notification: &Notification) -> CustodyResult<()> {
        self.put(&notification.notification_id, notification)
    }

    fn put<T: serde::Serialize>(&self, key: &str, value: &T) -> CustodyResult<()> {
        let mut writes = WriteSet::new();
        writes.put_json(Partition::SubmitterPrivate, key, value)?;
        self.store.commit(writes)?;
        Ok(())
    }
}

fn isolate(
    effect: &'static str,
    evidence_id: &str,
    result: CustodyResult<()>,
    failures: &mut Vec<SecondaryFailure>,
) {
    if let Err(source) = result {
        warn!(effect, evidence_id, error = %source, "次要更新失败，主转换不受影响");
        failures.push(SecondaryFailure {
            effect,
            evidence_id: evidence_id.to_string(),
            source,
        });
    }
}
