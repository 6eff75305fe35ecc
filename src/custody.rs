//! 保管链状态机
//!
//! 纯函数：输入当前记录，检查守卫，输出新记录 + 一条新的保管链条目 + 待分发的事件。
//! 读取与落盘由 service 在记录锁内完成。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CustodyError, CustodyResult};
use crate::events::CustodyEvent;
use crate::evidence::{
    Anchor, AnonymousIdentity, BulkMembership, CustodyAction, CustodyEntry, CustodyLog,
    EvidenceRecord, IntegrityStatus, NewEvidence, Status,
};
use crate::export::ExportPackage;

/// 验证失败而调用方未给出理由时使用
pub const DEFAULT_REJECTION_COMMENT: &str = "Hash verification failed: computed hash does not match \
     stored hash. Evidence may have been tampered with.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub computed_hash: String,
    pub passed: bool,
    #[serde(default)]
    pub rejection_comment: Option<String>,
}

/// 批量提交中某一项的位置
#[derive(Debug, Clone)]
pub struct BulkPlacement {
    pub submission_id: String,
    pub index: u32,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub record: EvidenceRecord,
    pub events: Vec<CustodyEvent>,
}

#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub record: EvidenceRecord,
    pub package: ExportPackage,
    /// 内容未变的重复导出不追加条目，也无需落盘
    pub appended: bool,
    pub events: Vec<CustodyEvent>,
}

/// 时间只进不退：不早于记录最后一条保管链条目
fn next_timestamp(record: &EvidenceRecord, now: DateTime<Utc>) -> DateTime<Utc> {
    match record.custody_log.last() {
        Some(last) if last.timestamp > now => last.timestamp,
        _ => now,
    }
}

fn require_status(
    record: &EvidenceRecord,
    action: &'static str,
    allowed: &[Status],
) -> CustodyResult<()> {
    if allowed.contains(&record.status) {
        return Ok(());
    }
    Err(CustodyError::InvalidState {
        id: record.evidence_id.clone(),
        action,
        required: allowed.to_vec(),
        actual: record.status,
    })
}

fn entry(action: CustodyAction, actor_org: &str, at: DateTime<Utc>, description: String) -> CustodyEntry {
    CustodyEntry {
        action,
        actor_org: actor_org.to_string(),
        timestamp: at,
        description,
    }
}

/// 创建：状态 SUBMITTED，完整性 PENDING，保管链第一条为 SUBMIT / BULK_SUBMIT
///
/// 不发事件：提交计数与记录在同一个写集合里落盘，由 service 负责。
pub fn submit(
    input: NewEvidence,
    identity: Option<AnonymousIdentity>,
    bulk: Option<BulkPlacement>,
    actor_org: &str,
    at: DateTime<Utc>,
) -> EvidenceRecord {
    let first_entry = match &bulk {
        Some(placement) => entry(
            CustodyAction::BulkSubmit,
            actor_org,
            at,
            format!(
                "Bulk submission {} - item {} of {}",
                placement.submission_id,
                placement.index + 1,
                placement.total
            ),
        ),
        None if identity.is_some() => entry(
            CustodyAction::Submit,
            actor_org,
            at,
            "Evidence submitted anonymously via cryptographic keypair".to_string(),
        ),
        None => entry(
            CustodyAction::Submit,
            actor_org,
            at,
            "Evidence submitted anonymously without reputation identity".to_string(),
        ),
    };

    EvidenceRecord {
        evidence_id: input.evidence_id,
        content_pointer: input.content_pointer,
        content_hash: input.content_hash,
        content_type: input.content_type,
        content_size: input.content_size,
        category: input.category,
        description: input.description,
        submitted_at: at,
        status: Status::Submitted,
        integrity_status: IntegrityStatus::Pending,
        rejection_comment: None,
        anchor: None,
        verified_at: None,
        reviewed_at: None,
        exported_at: None,
        export_hash: None,
        custody_log: CustodyLog::starting_with(first_entry),
        bulk: bulk.map(|p| BulkMembership {
            submission_id: p.submission_id,
            index: p.index,
        }),
        identity,
    }
}

/// 完整性验证：只接受 SUBMITTED。失败即 REJECTED (终态)，不会进入法务审查。
pub fn verify(
    mut record: EvidenceRecord,
    request: &VerifyRequest,
    actor_org: &str,
    now: DateTime<Utc>,
) -> CustodyResult<Transition> {
    require_status(&record, "verify", &[Status::Submitted])?;
    let at = next_timestamp(&record, now);

    let mut description = format!(
        "Integrity check: computed={}, stored={}, result={}",
        request.computed_hash, record.content_hash, request.passed
    );

    let reason = if request.passed {
        if request.computed_hash != record.content_hash {
            warn!(
                evidence_id = %record.evidence_id,
                "验证方判定通过，但计算哈希与存储哈希不一致"
            );
        }
        record.integrity_status = IntegrityStatus::Verified;
        record.status = Status::Verified;
        record.verified_at = Some(at);
        None
    } else {
        let comment = request
            .rejection_comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_REJECTION_COMMENT)
            .to_string();
        description.push_str(&format!(" | Rejection: {comment}"));
        record.integrity_status = IntegrityStatus::Failed;
        record.status = Status::Rejected;
        record.rejection_comment = Some(comment.clone());
        Some(comment)
    };

    record
        .custody_log
        .append(entry(CustodyAction::Verify, actor_org, at, description));

    let events = record
        .fingerprint()
        .map(|fp| CustodyEvent::VerificationOutcome {
            evidence_id: record.evidence_id.clone(),
            fingerprint: fp.to_string(),
            passed: request.passed,
            reason,
            from_org: actor_org.to_string(),
            at,
        })
        .into_iter()
        .collect();

    Ok(Transition { record, events })
}

/// 法务审查：`complete = false` 进入 UNDER_REVIEW，`true` 进入 REVIEWED 并固定审查时间
pub fn review(
    mut record: EvidenceRecord,
    complete: bool,
    actor_org: &str,
    now: DateTime<Utc>,
) -> CustodyResult<EvidenceRecord> {
    require_status(&record, "review", &[Status::Verified, Status::UnderReview])?;
    let at = next_timestamp(&record, now);

    let description = if complete {
        record.status = Status::Reviewed;
        record.reviewed_at = Some(at);
        "Legal review completed"
    } else {
        record.status = Status::UnderReview;
        "Legal review started"
    };
    record.custody_log.append(entry(
        CustodyAction::Review,
        actor_org,
        at,
        description.to_string(),
    ));
    Ok(record)
}

/// 导出：REVIEWED 或已 EXPORTED。内容未变时重复导出返回同一个包且不追加条目。
pub fn export(
    mut record: EvidenceRecord,
    actor_org: &str,
    now: DateTime<Utc>,
) -> CustodyResult<ExportOutcome> {
    require_status(&record, "export", &[Status::Reviewed, Status::Exported])?;
    let at = next_timestamp(&record, now);
    let first_export = record.exported_at.is_none();
    let exported_at = record.exported_at.unwrap_or(at);

    let package = ExportPackage::seal(&record, exported_at)?;
    if record.status == Status::Exported
        && record.export_hash.as_deref() == Some(package.export_hash.as_str())
    {
        return Ok(ExportOutcome {
            record,
            package,
            appended: false,
            events: Vec::new(),
        });
    }

    record.status = Status::Exported;
    record.exported_at = Some(exported_at);
    record.export_hash = Some(package.export_hash.clone());
    record.custody_log.append(entry(
        CustodyAction::Export,
        actor_org,
        at,
        format!(
            "Evidence exported for court proceedings. Export hash: {}",
            package.export_hash
        ),
    ));

    let events = match record.fingerprint() {
        Some(fp) if first_export => vec![CustodyEvent::Exported {
            evidence_id: record.evidence_id.clone(),
            fingerprint: fp.to_string(),
            at,
        }],
        _ => Vec::new(),
    };

    Ok(ExportOutcome {
        record,
        package,
        appended: true,
        events,
    })
}

/// 记录外部公链锚点；任何状态均可，不改变状态
pub fn anchor(
    mut record: EvidenceRecord,
    tx_ref: &str,
    actor_org: &str,
    now: DateTime<Utc>,
) -> EvidenceRecord {
    let at = next_timestamp(&record, now);
    record.anchor = Some(Anchor {
        tx_ref: tx_ref.to_string(),
        anchored_at: at,
    });
    record.custody_log.append(entry(
        CustodyAction::Anchor,
        actor_org,
        at,
        format!("Anchored to public chain: {tx_ref}"),
    ));
    record
}

/// 私有笔记/评论写入后在公共保管链上留痕，只说明“添加了”，不含内容
pub fn private_entry_added(
    mut record: EvidenceRecord,
    action: CustodyAction,
    actor_org: &str,
    now: DateTime<Utc>,
) -> EvidenceRecord {
    let at = next_timestamp(&record, now);
    let description = match action {
        CustodyAction::AddComment => "Legal comment added (private)",
        _ => "Verification note added (private)",
    };
    record
        .custody_log
        .append(entry(action, actor_org, at, description.to_string()));
    record
}
