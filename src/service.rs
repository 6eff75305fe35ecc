use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::access::{AccessControl, CallContext, Capability, Grant};
use crate::custody::{self, BulkPlacement, VerifyRequest};
use crate::error::{CustodyError, CustodyResult};
use crate::events::{CustodyEvent, SideEffects};
use crate::evidence::{
    validate_identifier, AnonymousIdentity, BulkSubmissionResult, Category, CustodyAction,
    EvidenceRecord, NewEvidence, Status,
};
use crate::export::ExportPackage;
use crate::ledger::LedgerProof;
use crate::locks::KeyLocks;
use crate::notes::{LegalComment, NewLegalComment, NewVerificationNote, VerificationNote};
use crate::notification::{self, Notification, NotificationList};
use crate::query::{EvidenceHistory, Field, Page, PageRequest, Query, QueryEngine};
use crate::reputation::Reputation;
use crate::signer;
use crate::store::{Partition, RecordStore, WriteSet};

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceOptions {
    /// 为真时单条提交必须附带匿名身份证明
    pub require_identity_proof: bool,
}

/// 保管链服务
///
/// 每个操作先声明所需能力并完成授权，再在证据 ID 的锁内完成
/// “读取 → 守卫 → 写回”。提交计数随记录一起写入，验证与导出的副作用在锁释放之后分发。
pub struct CustodyService {
    access: AccessControl,
    store: Arc<dyn RecordStore>,
    query: Arc<dyn QueryEngine>,
    effects: SideEffects,
    locks: Arc<KeyLocks>,
    options: ServiceOptions,
}

impl CustodyService {
    pub fn new(
        access: AccessControl,
        store: Arc<dyn RecordStore>,
        query: Arc<dyn QueryEngine>,
        options: ServiceOptions,
    ) -> Self {
        let locks = Arc::new(KeyLocks::new());
        Self {
            access,
            effects: SideEffects::new(store.clone(), locks.clone()),
            store,
            query,
            locks,
            options,
        }
    }

    // ==========================================
    // 内部工具
    // ==========================================

    fn load<T: DeserializeOwned>(&self, partition: Partition, key: &str) -> CustodyResult<Option<T>> {
        match self.store.get(partition, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// 在锁内读取最新提交的记录，绝不使用缓存
    fn require_evidence(&self, evidence_id: &str) -> CustodyResult<EvidenceRecord> {
        self.load(Partition::Shared, evidence_id)?
            .ok_or_else(|| CustodyError::not_found("evidence", evidence_id))
    }

    fn commit_record(&self, record: &EvidenceRecord, mut writes: WriteSet) -> CustodyResult<()> {
        writes.put_json(Partition::Shared, &record.evidence_id, record)?;
        self.store.commit(writes)?;
        Ok(())
    }

    /// 读出信誉并累加提交次数，放进调用方的写集合
    ///
    /// 调用方必须已持有这些指纹的信誉键锁。
    fn credit_submissions<'a>(
        &self,
        writes: &mut WriteSet,
        fingerprints: impl IntoIterator<Item = &'a str>,
        at: DateTime<Utc>,
    ) -> CustodyResult<()> {
        let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
        for fp in fingerprints {
            *counts.entry(fp).or_default() += 1;
        }

        for (fp, count) in counts {
            let key = Reputation::storage_key(fp);
            let mut reputation = match self.load::<Reputation>(Partition::SubmitterPrivate, &key)? {
                Some(mut existing) => {
                    existing.record_submission(at);
                    existing
                }
                None => Reputation::first_submission(fp, at),
            };
            for _ in 1..count {
                reputation.record_submission(at);
            }
            writes.put_json(Partition::SubmitterPrivate, key, &reputation)?;
        }
        Ok(())
    }

    fn dispatch(&self, events: Vec<CustodyEvent>) {
        if events.is_empty() {
            return;
        }
        let failures = self.effects.dispatch(events);
        if !failures.is_empty() {
            debug!(count = failures.len(), "副作用部分失败，已记录警告");
        }
    }

    /// 校验提交字段与身份证明；不触碰存储
    fn check_submission(
        &self,
        input: &NewEvidence,
        require_proof: bool,
    ) -> CustodyResult<Option<AnonymousIdentity>> {
        validate_identifier("evidence id", &input.evidence_id)?;
        if input.content_pointer.trim().is_empty() {
            return Err(CustodyError::validation("content pointer is required"));
        }
        if input.content_hash.trim().is_empty() {
            return Err(CustodyError::validation("content hash is required"));
        }
        match &input.identity {
            Some(proof) => Ok(Some(signer::check_proof(proof, &input.content_hash)?)),
            None if require_proof => Err(CustodyError::validation(
                "anonymous identity proof is required",
            )),
            None => Ok(None),
        }
    }

    fn page(&self, query: &Query, page: &PageRequest) -> CustodyResult<Page<EvidenceRecord>> {
        Ok(self.query.query(query, page)?)
    }

    // ==========================================
    // 1. 提交方 (Submission)
    // ==========================================

    pub fn submit_evidence(&self, ctx: &CallContext, input: NewEvidence) -> CustodyResult<EvidenceRecord> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        let identity = self.check_submission(&input, self.options.require_identity_proof)?;

        let reputation_key = identity
            .as_ref()
            .map(|id| Reputation::storage_key(&id.fingerprint));

        let record = {
            let _guards = self.locks.lock_many(
                std::iter::once(input.evidence_id.as_str()).chain(reputation_key.as_deref()),
            );
            if self.store.exists(Partition::Shared, &input.evidence_id)? {
                return Err(CustodyError::already_exists("evidence", &input.evidence_id));
            }
            let now = Utc::now();
            let record = custody::submit(input, identity, None, grant.org_id(), now);
            let mut writes = WriteSet::new();
            self.credit_submissions(&mut writes, record.fingerprint(), now)?;
            self.commit_record(&record, writes)?;
            record
        };

        info!(
            evidence_id = %record.evidence_id,
            org = grant.org_id(),
            status = %record.status,
            "证据已提交"
        );
        Ok(record)
    }

    /// 整批校验通过后作为一个写集合提交，任何一项失败都不会写入
    pub fn submit_bulk(
        &self,
        ctx: &CallContext,
        bulk_submission_id: &str,
        items: Vec<NewEvidence>,
    ) -> CustodyResult<BulkSubmissionResult> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        validate_identifier("bulk submission id", bulk_submission_id)?;
        if items.is_empty() {
            return Err(CustodyError::validation("bulk submission must contain at least one item"));
        }

        let mut seen = HashSet::new();
        let mut identities = Vec::with_capacity(items.len());
        for item in &items {
            identities.push(self.check_submission(item, false)?);
            if !seen.insert(item.evidence_id.as_str()) {
                return Err(CustodyError::validation(format!(
                    "evidence id {} appears more than once in the batch",
                    item.evidence_id
                )));
            }
        }
        let evidence_ids: Vec<String> = items.iter().map(|i| i.evidence_id.clone()).collect();
        let reputation_keys: Vec<String> = identities
            .iter()
            .flatten()
            .map(|id| Reputation::storage_key(&id.fingerprint))
            .collect();
        let total = items.len();
        let now = Utc::now();

        {
            let _guards = self
                .locks
                .lock_many(evidence_ids.iter().chain(&reputation_keys).map(String::as_str));
            for id in &evidence_ids {
                if self.store.exists(Partition::Shared, id)? {
                    return Err(CustodyError::already_exists("evidence", id));
                }
            }

            let mut writes = WriteSet::new();
            let mut records = Vec::with_capacity(total);
            for (index, (item, identity)) in items.into_iter().zip(identities).enumerate() {
                let index = u32::try_from(index)
                    .map_err(|_| CustodyError::validation("bulk submission is too large"))?;
                let placement = BulkPlacement {
                    submission_id: bulk_submission_id.to_string(),
                    index,
                    total,
                };
                let record = custody::submit(item, identity, Some(placement), grant.org_id(), now);
                writes.put_json(Partition::Shared, &record.evidence_id, &record)?;
                records.push(record);
            }
            let fingerprints = records.iter().filter_map(EvidenceRecord::fingerprint);
            self.credit_submissions(&mut writes, fingerprints, now)?;
            self.store.commit(writes)?;
        }

        info!(
            bulk_submission_id,
            org = grant.org_id(),
            count = total,
            "批量证据已提交"
        );

        Ok(BulkSubmissionResult {
            bulk_submission_id: bulk_submission_id.to_string(),
            submitted_count: total,
            evidence_ids,
            submitted_at: now,
        })
    }

    pub fn update_anchor(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
        tx_ref: &str,
    ) -> CustodyResult<EvidenceRecord> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        if tx_ref.trim().is_empty() {
            return Err(CustodyError::validation("anchor transaction reference is required"));
        }

        let _guard = self.locks.lock(evidence_id);
        let record = self.require_evidence(evidence_id)?;
        let record = custody::anchor(record, tx_ref, grant.org_id(), Utc::now());
        self.commit_record(&record, WriteSet::new())?;

        info!(evidence_id, org = grant.org_id(), tx_ref, "锚点已记录");
        Ok(record)
    }

    /// 某个指纹的通知，最新的在前
    pub fn list_notifications(
        &self,
        ctx: &CallContext,
        fingerprint: &str,
    ) -> CustodyResult<NotificationList> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        let mut notifications = Vec::new();
        for (_, bytes) in self
            .store
            .scan_prefix(grant.private_partition(), notification::KEY_PREFIX)?
        {
            let notification: Notification = serde_json::from_slice(&bytes)?;
            if notification.recipient_fingerprint == fingerprint {
                notifications.push(notification);
            }
        }
        notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(notifications.into())
    }

    pub fn mark_notification_read(
        &self,
        ctx: &CallContext,
        notification_id: &str,
    ) -> CustodyResult<Notification> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        let partition = grant.private_partition();
        // 同一分区里还有信誉、笔记等记录，只认通知的键
        if !notification_id.starts_with(notification::KEY_PREFIX) {
            return Err(CustodyError::not_found("notification", notification_id));
        }

        let _guard = self.locks.lock(notification_id);
        let mut notification: Notification = self
            .load(partition, notification_id)?
            .ok_or_else(|| CustodyError::not_found("notification", notification_id))?;
        if notification.mark_read() {
            let mut writes = WriteSet::new();
            writes.put_json(partition, notification_id, &notification)?;
            self.store.commit(writes)?;
        }
        Ok(notification)
    }

    /// 未知指纹返回中性记录，但不落盘
    pub fn get_reputation(&self, ctx: &CallContext, fingerprint: &str) -> CustodyResult<Reputation> {
        let grant = self.access.authorize(ctx, Capability::Submission)?;
        Ok(self
            .load(grant.private_partition(), &Reputation::storage_key(fingerprint))?
            .unwrap_or_else(|| Reputation::neutral(fingerprint)))
    }

    // ==========================================
    // 2. 验证方 (Verification)
    // ==========================================

    pub fn verify_integrity(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
        request: &VerifyRequest,
    ) -> CustodyResult<EvidenceRecord> {
        let grant = self.access.authorize(ctx, Capability::Verification)?;

        let transition = {
            let _guard = self.locks.lock(evidence_id);
            let record = self.require_evidence(evidence_id)?;
            let transition = custody::verify(record, request, grant.org_id(), Utc::now())
                .inspect_err(|e| debug!(evidence_id, error = %e, "验证守卫未通过"))?;
            self.commit_record(&transition.record, WriteSet::new())?;
            transition
        };

        info!(
            evidence_id,
            org = grant.org_id(),
            status = %transition.record.status,
            "完整性验证完成"
        );
        self.dispatch(transition.events);
        Ok(transition.record)
    }

    pub fn add_verification_note(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
        input: NewVerificationNote,
    ) -> CustodyResult<VerificationNote> {
        let grant = self.access.authorize(ctx, Capability::Verification)?;
        validate_identifier("evidence id", evidence_id)?;
        validate_identifier("note id", &input.note_id)?;
        if input.content.trim().is_empty() {
            return Err(CustodyError::validation("note content is required"));
        }
        let key = VerificationNote::storage_key(evidence_id, &input.note_id);
        let note_id = input.note_id.clone();

        let note = self.append_private(&grant, evidence_id, &key, ("verification note", &note_id), |now| {
            VerificationNote {
                evidence_id: evidence_id.to_string(),
                note_id: input.note_id,
                content: input.content,
                hash_comparison: input.hash_comparison,
                created_at: now,
                verifier_org: grant.org_id().to_string(),
            }
        }, CustodyAction::AddNote)?;

        info!(evidence_id, org = grant.org_id(), note_id = %note.note_id, "验证笔记已添加");
        Ok(note)
    }

    pub fn get_verification_notes(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
    ) -> CustodyResult<Vec<VerificationNote>> {
        let grant = self.access.authorize(ctx, Capability::Verification)?;
        let notes: Vec<VerificationNote> =
            self.scan_private(&grant, &VerificationNote::evidence_prefix(evidence_id))?;
        Ok(notes
            .into_iter()
            .filter(|n| n.evidence_id == evidence_id)
            .collect())
    }

    // ==========================================
    // 3. 法务方 (Legal)
    // ==========================================

    /// `complete = false` 开始审查，`true` 完成审查
    pub fn review_evidence(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
        complete: bool,
    ) -> CustodyResult<EvidenceRecord> {
        let grant = self.access.authorize(ctx, Capability::Legal)?;

        let _guard = self.locks.lock(evidence_id);
        let record = self.require_evidence(evidence_id)?;
        let record = custody::review(record, complete, grant.org_id(), Utc::now())
            .inspect_err(|e| debug!(evidence_id, error = %e, "审查守卫未通过"))?;
        self.commit_record(&record, WriteSet::new())?;

        info!(evidence_id, org = grant.org_id(), status = %record.status, "法务审查状态已更新");
        Ok(record)
    }

    pub fn add_legal_comment(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
        input: NewLegalComment,
    ) -> CustodyResult<LegalComment> {
        let grant = self.access.authorize(ctx, Capability::Legal)?;
        validate_identifier("evidence id", evidence_id)?;
        validate_identifier("comment id", &input.comment_id)?;
        if input.content.trim().is_empty() {
            return Err(CustodyError::validation("comment content is required"));
        }
        let key = LegalComment::storage_key(evidence_id, &input.comment_id);
        let comment_id = input.comment_id.clone();

        let comment = self.append_private(&grant, evidence_id, &key, ("legal comment", &comment_id), |now| {
            LegalComment {
                evidence_id: evidence_id.to_string(),
                comment_id: input.comment_id,
                content: input.content,
                court_readiness: input.court_readiness,
                recommendation: input.recommendation,
                created_at: now,
                legal_reviewer_org: grant.org_id().to_string(),
            }
        }, CustodyAction::AddComment)?;

        info!(evidence_id, org = grant.org_id(), comment_id = %comment.comment_id, "法务评论已添加");
        Ok(comment)
    }

    pub fn get_legal_comments(
        &self,
        ctx: &CallContext,
        evidence_id: &str,
    ) -> CustodyResult<Vec<LegalComment>> {
        let grant = self.access.authorize(ctx, Capability::Legal)?;
        let comments: Vec<LegalComment> =
            self.scan_private(&grant, &LegalComment::evidence_prefix(evidence_id))?;
        Ok(comments
            .into_iter()
            .filter(|c| c.evidence_id == evidence_id)
            .collect())
    }

    pub fn export_evidence(&self, ctx: &CallContext, evidence_id: &str) -> CustodyResult<ExportPackage> {
        let grant = self.access.authorize(ctx, Capability::Legal)?;

        let outcome = {
            let _guard = self.locks.lock(evidence_id);
            let record = self.require_evidence(evidence_id)?;
            let outcome = custody::export(record, grant.org_id(), Utc::now())
                .inspect_err(|e| debug!(evidence_id, error = %e, "导出守卫未通过"))?;
            if outcome.appended {
                self.commit_record(&outcome.record, WriteSet::new())?;
            }
            outcome
        };

        info!(
            evidence_id,
            org = grant.org_id(),
            export_hash = %outcome.package.export_hash,
            appended = outcome.appended,
            "证据已导出"
        );
        self.dispatch(outcome.events);
        Ok(outcome.package)
    }

    /// 闭区间，按提交时间从新到旧
    pub fn query_by_date_range(
        &self,
        ctx: &CallContext,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        page: &PageRequest,
    ) -> CustodyResult<Page<EvidenceRecord>> {
        self.access.authorize(ctx, Capability::Legal)?;
        if from > to {
            return Err(CustodyError::validation("date range start is after its end"));
        }
        let query = Query::all()
            .between(Field::SubmittedAt, from, to)
            .newest_first();
        self.page(&query, page)
    }

    // ==========================================
    // 4. 任意组织查询 (Any)
    // ==========================================

    pub fn get_evidence(&self, ctx: &CallContext, evidence_id: &str) -> CustodyResult<EvidenceRecord> {
        self.access.authorize(ctx, Capability::Any)?;
        self.require_evidence(evidence_id)
    }

    pub fn list_all(&self, ctx: &CallContext, page: &PageRequest) -> CustodyResult<Page<EvidenceRecord>> {
        self.access.authorize(ctx, Capability::Any)?;
        self.page(&Query::all(), page)
    }

    pub fn list_by_status(
        &self,
        ctx: &CallContext,
        status: Status,
        page: &PageRequest,
    ) -> CustodyResult<Page<EvidenceRecord>> {
        self.access.authorize(ctx, Capability::Any)?;
        self.page(&Query::all().eq(Field::Status, status.as_str()), page)
    }

    pub fn list_by_category(
        &self,
        ctx: &CallContext,
        category: Category,
        page: &PageRequest,
    ) -> CustodyResult<Page<EvidenceRecord>> {
        self.access.authorize(ctx, Capability::Any)?;
        self.page(&Query::all().eq(Field::Category, category.as_str()), page)
    }

    pub fn list_by_bulk_group(
        &self,
        ctx: &CallContext,
        bulk_submission_id: &str,
        page: &PageRequest,
    ) -> CustodyResult<Page<EvidenceRecord>> {
        self.access.authorize(ctx, Capability::Any)?;
        self.page(
            &Query::all().eq(Field::BulkSubmissionId, bulk_submission_id),
            page,
        )
    }

    /// 可选按状态与分类过滤的计数
    pub fn count(
        &self,
        ctx: &CallContext,
        status: Option<Status>,
        category: Option<Category>,
    ) -> CustodyResult<u64> {
        self.access.authorize(ctx, Capability::Any)?;
        let mut query = Query::all();
        if let Some(status) = status {
            query = query.eq(Field::Status, status.as_str());
        }
        if let Some(category) = category {
            query = query.eq(Field::Category, category.as_str());
        }
        Ok(self.query.count(&query)?)
    }

    pub fn get_history(&self, ctx: &CallContext, evidence_id: &str) -> CustodyResult<EvidenceHistory> {
        self.access.authorize(ctx, Capability::Any)?;
        let history = self.query.history(evidence_id)?;
        if history.is_empty() {
            return Err(CustodyError::not_found("evidence", evidence_id));
        }
        Ok(EvidenceHistory {
            evidence_id: evidence_id.to_string(),
            history,
        })
    }

    pub fn ledger_root(&self, ctx: &CallContext) -> CustodyResult<Option<String>> {
        self.access.authorize(ctx, Capability::Any)?;
        Ok(self.store.ledger_root()?)
    }

    pub fn ledger_proof(&self, ctx: &CallContext, position: u64) -> CustodyResult<LedgerProof> {
        self.access.authorize(ctx, Capability::Any)?;
        self.store
            .ledger_proof(position)?
            .ok_or_else(|| CustodyError::not_found("ledger leaf", position.to_string()))
    }

    // ==========================================
    // 私有分区：笔记与评论
    // ==========================================

    /// 私有条目与公共保管链留痕在同一个写集合里提交
    fn append_private<T: serde::Serialize>(
        &self,
        grant: &Grant,
        evidence_id: &str,
        key: &str,
        (kind, entry_id): (&'static str, &str),
        build: impl FnOnce(DateTime<Utc>) -> T,
        action: CustodyAction,
    ) -> CustodyResult<T> {
        let partition = grant.private_partition();

        let _guard = self.locks.lock(evidence_id);
        let record = self.require_evidence(evidence_id)?;
        if self.store.exists(partition, key)? {
            return Err(CustodyError::already_exists(
                kind,
                format!("{entry_id} on evidence {evidence_id}"),
            ));
        }

        let now = Utc::now();
        let entry = build(now);
        let record = custody::private_entry_added(record, action, grant.org_id(), now);

        let mut writes = WriteSet::new();
        writes.put_json(partition, key, &entry)?;
        self.commit_record(&record, writes)?;
        Ok(entry)
    }

    fn scan_private<T: DeserializeOwned>(&self, grant: &Grant, prefix: &str) -> CustodyResult<Vec<T>> {
        self.store
            .scan_prefix(grant.private_partition(), prefix)?
            .into_iter()
            .map(|(_, bytes)| -> CustodyResult<T> { Ok(serde_json::from_slice(&bytes)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{OrgDirectory, TokenDirectory};
    use crate::evidence::{FileType, IntegrityStatus};
    use crate::notes::CourtReadiness;
    use crate::query::StoreQuery;
    use crate::signer::SubmitterKey;
    use crate::sled_store::SledStore;
    use crate::store::{CommitReceipt, Revision, StoreError};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    const SUB: &str = "t-sub";
    const VER: &str = "t-ver";
    const LEGAL: &str = "t-legal";

    fn ctx(token: &str) -> CallContext {
        CallContext::with_credential(token)
    }

    fn access() -> AccessControl {
        let tokens = HashMap::from([
            (SUB.to_string(), "SubmitterOrg".to_string()),
            (VER.to_string(), "VerifierOrg".to_string()),
            (LEGAL.to_string(), "LegalOrg".to_string()),
        ]);
        AccessControl::new(Arc::new(TokenDirectory::new(tokens)), OrgDirectory::default())
    }

    fn service_over(store: Arc<dyn RecordStore>) -> CustodyService {
        let query = Arc::new(StoreQuery::new(store.clone(), 25, 200));
        CustodyService::new(access(), store, query, ServiceOptions::default())
    }

    fn service() -> CustodyService {
        service_over(Arc::new(SledStore::temporary().unwrap()))
    }

    fn evidence(id: &str, key: Option<&SubmitterKey>) -> NewEvidence {
        let content_hash = format!("sha256-{id}");
        NewEvidence {
            evidence_id: id.to_string(),
            content_pointer: format!("bafy-{id}"),
            identity: key.map(|k| k.prove(&content_hash)),
            content_hash,
            content_type: FileType::Video,
            content_size: 4096,
            category: Some(Category::Corruption),
            description: Some("warehouse footage".into()),
        }
    }

    fn pass(id: &str) -> VerifyRequest {
        VerifyRequest {
            computed_hash: format!("sha256-{id}"),
            passed: true,
            rejection_comment: None,
        }
    }

    #[test]
    fn submit_requires_submission_capability() {
        let svc = service();
        let err = svc.submit_evidence(&ctx(VER), evidence("E1", None)).unwrap_err();
        assert!(matches!(err, CustodyError::AccessDenied { .. }));
        assert!(matches!(
            svc.get_evidence(&ctx(SUB), "E1").unwrap_err(),
            CustodyError::NotFound { .. }
        ));
    }

    #[test]
    fn duplicate_submission_is_rejected() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        let err = svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap_err();
        assert!(matches!(err, CustodyError::AlreadyExists { .. }));
    }

    #[test]
    fn identity_proof_can_be_required() {
        let store: Arc<dyn RecordStore> = Arc::new(SledStore::temporary().unwrap());
        let query = Arc::new(StoreQuery::new(store.clone(), 25, 200));
        let svc = CustodyService::new(
            access(),
            store,
            query,
            ServiceOptions {
                require_identity_proof: true,
            },
        );
        assert!(matches!(
            svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap_err(),
            CustodyError::Validation(_)
        ));
        let key = SubmitterKey::generate();
        svc.submit_evidence(&ctx(SUB), evidence("E1", Some(&key))).unwrap();
    }

    #[test]
    fn verification_credits_reputation_and_notifies() {
        let svc = service();
        let key = SubmitterKey::generate();
        svc.submit_evidence(&ctx(SUB), evidence("E1", Some(&key))).unwrap();

        let record = svc.verify_integrity(&ctx(VER), "E1", &pass("E1")).unwrap();
        assert_eq!(record.status, Status::Verified);
        assert_eq!(record.integrity_status, IntegrityStatus::Verified);

        let rep = svc.get_reputation(&ctx(SUB), &key.fingerprint()).unwrap();
        assert_eq!(rep.trust_score, 60);
        assert_eq!(rep.verified_submissions, 1);

        let inbox = svc.list_notifications(&ctx(SUB), &key.fingerprint()).unwrap();
        assert_eq!(inbox.count, 1);
        let read = svc
            .mark_notification_read(&ctx(SUB), &inbox.notifications[0].notification_id)
            .unwrap();
        assert!(read.read);
    }

    #[test]
    fn submission_count_lands_with_the_record() {
        let store = Arc::new(SledStore::temporary().unwrap());
        let svc = service_over(store.clone());
        let key = SubmitterKey::generate();
        let fp = key.fingerprint();

        svc.submit_evidence(&ctx(SUB), evidence("E1", Some(&key))).unwrap();
        // 不经过任何副作用分发，记录已在存储里
        let stored = store
            .get(Partition::SubmitterPrivate, &Reputation::storage_key(&fp))
            .unwrap()
            .expect("reputation committed with the evidence");
        let rep: Reputation = serde_json::from_slice(&stored).unwrap();
        assert_eq!(rep.total_submissions, 1);
        assert_eq!(rep.first_submission_at, Some(rep.last_submission_at.unwrap()));

        svc.submit_bulk(
            &ctx(SUB),
            "B1",
            vec![
                evidence("E2", Some(&key)),
                evidence("E3", None),
                evidence("E4", Some(&key)),
            ],
        )
        .unwrap();
        let rep = svc.get_reputation(&ctx(SUB), &fp).unwrap();
        assert_eq!(rep.total_submissions, 3);
        assert_eq!(rep.trust_score, 50);
    }

    #[test]
    fn mark_read_only_accepts_notification_ids() {
        let svc = service();
        let key = SubmitterKey::generate();
        let fp = key.fingerprint();
        svc.submit_evidence(&ctx(SUB), evidence("E1", Some(&key))).unwrap();
        let before = svc.get_reputation(&ctx(SUB), &fp).unwrap();

        let err = svc
            .mark_notification_read(&ctx(SUB), &Reputation::storage_key(&fp))
            .unwrap_err();
        assert!(matches!(err, CustodyError::NotFound { .. }));
        assert_eq!(svc.get_reputation(&ctx(SUB), &fp).unwrap(), before);

        assert!(matches!(
            svc.mark_notification_read(&ctx(SUB), "notif_E1_0").unwrap_err(),
            CustodyError::NotFound { .. }
        ));
    }

    #[test]
    fn notes_and_comments_stay_in_their_partitions() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        svc.verify_integrity(&ctx(VER), "E1", &pass("E1")).unwrap();

        svc.add_verification_note(
            &ctx(VER),
            "E1",
            NewVerificationNote {
                note_id: "n1".into(),
                content: "sha256 matched".into(),
                hash_comparison: "equal".into(),
            },
        )
        .unwrap();
        svc.add_legal_comment(
            &ctx(LEGAL),
            "E1",
            NewLegalComment {
                comment_id: "c1".into(),
                content: "chain intact".into(),
                court_readiness: CourtReadiness::Ready,
                recommendation: "admit".into(),
            },
        )
        .unwrap();

        assert_eq!(svc.get_verification_notes(&ctx(VER), "E1").unwrap().len(), 1);
        assert_eq!(svc.get_legal_comments(&ctx(LEGAL), "E1").unwrap().len(), 1);
        assert!(matches!(
            svc.get_verification_notes(&ctx(LEGAL), "E1").unwrap_err(),
            CustodyError::AccessDenied { .. }
        ));

        let record = svc.get_evidence(&ctx(LEGAL), "E1").unwrap();
        let descriptions: Vec<_> = record.custody_log.iter().map(|e| e.description.as_str()).collect();
        assert!(descriptions.contains(&"Verification note added (private)"));
        assert!(!descriptions.iter().any(|d| d.contains("sha256 matched")));
    }

    #[test]
    fn duplicate_note_id_is_rejected() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        let note = NewVerificationNote {
            note_id: "n1".into(),
            content: "first".into(),
            hash_comparison: String::new(),
        };
        svc.add_verification_note(&ctx(VER), "E1", note.clone()).unwrap();
        assert!(matches!(
            svc.add_verification_note(&ctx(VER), "E1", note).unwrap_err(),
            CustodyError::AlreadyExists { .. }
        ));
        assert!(matches!(
            svc.add_verification_note(
                &ctx(VER),
                "missing",
                NewVerificationNote {
                    note_id: "n1".into(),
                    content: "x".into(),
                    hash_comparison: String::new(),
                }
            )
            .unwrap_err(),
            CustodyError::NotFound { .. }
        ));
    }

    #[test]
    fn lookalike_evidence_ids_keep_separate_notes() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        svc.submit_evidence(&ctx(SUB), evidence("E1_x", None)).unwrap();
        let note = |id: &str| NewVerificationNote {
            note_id: id.into(),
            content: format!("note {id}"),
            hash_comparison: String::new(),
        };

        // 用 `_` 拼接时两者都是 note_E1_x_n1
        svc.add_verification_note(&ctx(VER), "E1", note("x_n1")).unwrap();
        svc.add_verification_note(&ctx(VER), "E1_x", note("n1")).unwrap();

        let first = svc.get_verification_notes(&ctx(VER), "E1").unwrap();
        let second = svc.get_verification_notes(&ctx(VER), "E1_x").unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].note_id, "x_n1");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].note_id, "n1");

        assert!(matches!(
            svc.add_verification_note(&ctx(VER), "E1\u{0}x", note("n2")).unwrap_err(),
            CustodyError::Validation(_)
        ));
    }

    #[test]
    fn bulk_batch_is_all_or_nothing() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E2", None)).unwrap();
        let err = svc
            .submit_bulk(
                &ctx(SUB),
                "B1",
                vec![evidence("E1", None), evidence("E2", None), evidence("E3", None)],
            )
            .unwrap_err();
        assert!(matches!(err, CustodyError::AlreadyExists { .. }));
        assert!(svc.get_evidence(&ctx(SUB), "E1").is_err());

        let result = svc
            .submit_bulk(&ctx(SUB), "B2", vec![evidence("E4", None), evidence("E5", None)])
            .unwrap();
        assert_eq!(result.submitted_count, 2);
        let group = svc
            .list_by_bulk_group(&ctx(VER), "B2", &PageRequest::default())
            .unwrap();
        assert_eq!(group.fetched_records_count, 2);
    }

    /// 打开开关后，只写提交方私有分区的提交全部失败
    struct PrivateWritesFail {
        inner: SledStore,
        offline: AtomicBool,
    }

    impl RecordStore for PrivateWritesFail {
        fn get(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(partition, key)
        }

        fn scan_prefix(
            &self,
            partition: Partition,
            prefix: &str,
        ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
            self.inner.scan_prefix(partition, prefix)
        }

        fn commit(&self, writes: WriteSet) -> Result<CommitReceipt, StoreError> {
            if self.offline.load(Ordering::SeqCst)
                && writes.touches(Partition::SubmitterPrivate)
                && !writes.touches(Partition::Shared)
            {
                return Err(StoreError::Backend("submitter partition offline".into()));
            }
            self.inner.commit(writes)
        }

        fn history(&self, key: &str) -> Result<Vec<Revision>, StoreError> {
            self.inner.history(key)
        }

        fn ledger_root(&self) -> Result<Option<String>, StoreError> {
            self.inner.ledger_root()
        }

        fn ledger_proof(&self, position: u64) -> Result<Option<LedgerProof>, StoreError> {
            self.inner.ledger_proof(position)
        }
    }

    #[test]
    fn secondary_failure_never_rolls_back_verification() {
        let store = Arc::new(PrivateWritesFail {
            inner: SledStore::temporary().unwrap(),
            offline: AtomicBool::new(false),
        });
        let svc = service_over(store.clone());
        let key = SubmitterKey::generate();
        svc.submit_evidence(&ctx(SUB), evidence("E1", Some(&key))).unwrap();
        store.offline.store(true, Ordering::SeqCst);

        let record = svc
            .verify_integrity(
                &ctx(VER),
                "E1",
                &VerifyRequest {
                    computed_hash: "deadbeef".into(),
                    passed: false,
                    rejection_comment: None,
                },
            )
            .unwrap();
        assert_eq!(record.status, Status::Rejected);
        assert_eq!(
            svc.get_evidence(&ctx(VER), "E1").unwrap().status,
            Status::Rejected
        );
        assert_eq!(
            svc.list_notifications(&ctx(SUB), &key.fingerprint()).unwrap().count,
            0
        );
        // 信誉停在提交时的样子
        let rep = svc.get_reputation(&ctx(SUB), &key.fingerprint()).unwrap();
        assert_eq!((rep.total_submissions, rep.trust_score), (1, 50));
    }

    #[test]
    fn history_and_ledger_proofs_cover_every_transition() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        svc.verify_integrity(&ctx(VER), "E1", &pass("E1")).unwrap();

        let history = svc.get_history(&ctx(LEGAL), "E1").unwrap();
        assert_eq!(history.history.len(), 2);
        assert_eq!(
            history.history[1].record.as_ref().unwrap().status,
            Status::Verified
        );

        let proof = svc.ledger_proof(&ctx(LEGAL), history.history[1].position).unwrap();
        assert!(proof.verify().unwrap());
        assert_eq!(Some(proof.root.clone()), svc.ledger_root(&ctx(SUB)).unwrap());

        assert!(matches!(
            svc.get_history(&ctx(SUB), "nope").unwrap_err(),
            CustodyError::NotFound { .. }
        ));
    }

    #[test]
    fn date_range_is_legal_only() {
        let svc = service();
        svc.submit_evidence(&ctx(SUB), evidence("E1", None)).unwrap();
        let now = Utc::now();
        let from = now - chrono::Duration::hours(1);
        assert!(matches!(
            svc.query_by_date_range(&ctx(VER), from, now, &PageRequest::default())
                .unwrap_err(),
            CustodyError::AccessDenied { .. }
        ));
        let page = svc
            .query_by_date_range(&ctx(LEGAL), from, now, &PageRequest::default())
            .unwrap();
        assert_eq!(page.fetched_records_count, 1);
        assert!(svc
            .query_by_date_range(&ctx(LEGAL), now, from, &PageRequest::default())
            .is_err());
    }
}
