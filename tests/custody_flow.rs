//! 端到端保管链场景：提交 → 验证 → 审查 → 导出，以及各组织之间的隔离

use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use custody_core::access::{AccessControl, CallContext, OrgDirectory, TokenDirectory};
use custody_core::custody::VerifyRequest;
use custody_core::evidence::{CustodyAction, FileType, IdentityProof, NewEvidence, Status};
use custody_core::notes::{CourtReadiness, NewLegalComment, NewVerificationNote};
use custody_core::notification::NotificationKind;
use custody_core::query::StoreQuery;
use custody_core::signer::SubmitterKey;
use custody_core::sled_store::SledStore;
use custody_core::store::RecordStore;
use custody_core::{CustodyError, CustodyService, ServiceOptions};
use tempfile::TempDir;

fn submitter() -> CallContext {
    CallContext::with_credential("sub-token")
}

fn verifier() -> CallContext {
    CallContext::with_credential("ver-token")
}

fn legal() -> CallContext {
    CallContext::with_credential("legal-token")
}

fn service_with(store: Arc<dyn RecordStore>) -> CustodyService {
    let tokens = HashMap::from([
        ("sub-token".to_string(), "SubmitterOrg".to_string()),
        ("ver-token".to_string(), "VerifierOrg".to_string()),
        ("legal-token".to_string(), "LegalOrg".to_string()),
    ]);
    let access = AccessControl::new(Arc::new(TokenDirectory::new(tokens)), OrgDirectory::default());
    let query = Arc::new(StoreQuery::new(store.clone(), 25, 200));
    CustodyService::new(access, store, query, ServiceOptions::default())
}

fn service() -> CustodyService {
    service_with(Arc::new(SledStore::temporary().expect("temporary store")))
}

fn new_evidence(id: &str, hash: &str, identity: Option<IdentityProof>) -> NewEvidence {
    NewEvidence {
        evidence_id: id.to_string(),
        content_pointer: format!("ipfs://{id}"),
        content_hash: hash.to_string(),
        content_type: FileType::Document,
        content_size: 512,
        category: None,
        description: None,
        identity,
    }
}

fn verdict(computed: &str, passed: bool, comment: Option<&str>) -> VerifyRequest {
    VerifyRequest {
        computed_hash: computed.to_string(),
        passed,
        rejection_comment: comment.map(str::to_string),
    }
}

#[test]
fn evidence_travels_from_submission_to_export() {
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");
    svc.verify_integrity(&verifier(), "E1", &verdict("h1", true, None))
        .expect("verify");
    svc.review_evidence(&legal(), "E1", true).expect("review");
    let package = svc.export_evidence(&legal(), "E1").expect("export");

    let record = svc.get_evidence(&verifier(), "E1").expect("get");
    assert_eq!(record.status, Status::Exported);
    let actions: Vec<_> = record.custody_log.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        [
            CustodyAction::Submit,
            CustodyAction::Verify,
            CustodyAction::Review,
            CustodyAction::Export
        ]
    );
    assert!(!package.export_hash.is_empty());
    assert_eq!(record.export_hash.as_deref(), Some(package.export_hash.as_str()));
    assert!(package.verify_seal().expect("seal"));
}

#[test]
fn rejected_submission_notifies_and_debits_fingerprint() {
    let svc = service();
    let proof = IdentityProof {
        fingerprint: "fp1".into(),
        signature: "detached-signature".into(),
        public_key: None,
    };
    svc.submit_evidence(&submitter(), new_evidence("E2", "h2", Some(proof)))
        .expect("submit");
    let record = svc
        .verify_integrity(&verifier(), "E2", &verdict("other", false, Some("mismatch")))
        .expect("verify");
    assert_eq!(record.status, Status::Rejected);
    assert_eq!(record.rejection_comment.as_deref(), Some("mismatch"));

    let inbox = svc.list_notifications(&submitter(), "fp1").expect("inbox");
    assert_eq!(inbox.count, 1);
    assert_eq!(inbox.notifications[0].kind, NotificationKind::Rejection);
    assert_eq!(inbox.notifications[0].recipient_fingerprint, "fp1");

    let rep = svc.get_reputation(&submitter(), "fp1").expect("reputation");
    assert_eq!(rep.total_submissions, 1);
    assert_eq!(rep.rejected_submissions, 1);
    assert_eq!(rep.trust_score, 35);

    for result in [
        svc.review_evidence(&legal(), "E2", false),
        svc.review_evidence(&legal(), "E2", true),
    ] {
        assert!(matches!(result, Err(CustodyError::InvalidState { .. })));
    }
    assert!(matches!(
        svc.export_evidence(&legal(), "E2"),
        Err(CustodyError::InvalidState { .. })
    ));
}

#[test]
fn second_create_fails_for_every_role() {
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");
    assert!(matches!(
        svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None)),
        Err(CustodyError::AlreadyExists { .. })
    ));
    for ctx in [verifier(), legal()] {
        assert!(svc.submit_evidence(&ctx, new_evidence("E1", "h1", None)).is_err());
    }
}

#[test]
fn verification_only_from_submitted() {
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");
    svc.verify_integrity(&verifier(), "E1", &verdict("h1", true, None))
        .expect("verify");
    let err = svc
        .verify_integrity(&verifier(), "E1", &verdict("h1", true, None))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "evidence E1 must be SUBMITTED to verify, current: VERIFIED"
    );
    assert!(matches!(
        svc.export_evidence(&legal(), "E1"),
        Err(CustodyError::InvalidState { .. })
    ));
}

#[test]
fn racing_verifiers_admit_exactly_one() {
    const VERIFIERS: usize = 8;
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");

    let barrier = Barrier::new(VERIFIERS);
    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = (0..VERIFIERS)
            .map(|i| {
                let (svc, barrier) = (&svc, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    // 一半判通过一半判失败，谁先拿到锁谁决定终态
                    svc.verify_integrity(&verifier(), "E1", &verdict("h1", i % 2 == 0, None))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("verifier thread"))
            .collect()
    });

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    for result in &results {
        if let Err(err) = result {
            assert!(matches!(err, CustodyError::InvalidState { .. }), "{err}");
        }
    }

    let record = svc.get_evidence(&legal(), "E1").expect("get");
    assert_eq!(record.custody_log.len(), 2);
    assert_eq!(record.status, winners[0].status);
    assert_eq!(svc.get_history(&legal(), "E1").expect("history").history.len(), 2);
}

#[test]
fn verification_racing_submission_always_lands_on_reputation() {
    const ITEMS: usize = 6;
    let svc = service();
    let proof = || IdentityProof {
        fingerprint: "fp-race".into(),
        signature: "detached-signature".into(),
        public_key: None,
    };

    thread::scope(|scope| {
        for i in 0..ITEMS {
            let svc = &svc;
            let id = format!("R-{i}");
            let verify_id = id.clone();
            scope.spawn(move || {
                svc.submit_evidence(&submitter(), new_evidence(&id, "h", Some(proof())))
                    .expect("submit");
            });
            // 记录一出现就立即验证，不等提交线程返回
            scope.spawn(move || loop {
                match svc.verify_integrity(&verifier(), &verify_id, &verdict("x", false, None)) {
                    Ok(_) => break,
                    Err(CustodyError::NotFound { .. }) => thread::yield_now(),
                    Err(err) => panic!("unexpected verify error: {err}"),
                }
            });
        }
    });

    let rep = svc.get_reputation(&submitter(), "fp-race").expect("reputation");
    assert_eq!(rep.total_submissions, ITEMS as u64);
    assert_eq!(rep.rejected_submissions, ITEMS as u64);
    assert_eq!(rep.trust_score, 0);
}

#[test]
fn every_status_change_adds_exactly_one_entry() {
    let svc = service();
    let mut last_len = svc
        .submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit")
        .custody_log
        .len();
    let steps: Vec<Box<dyn Fn() -> Result<custody_core::evidence::EvidenceRecord, CustodyError>>> = vec![
        Box::new(|| svc.verify_integrity(&verifier(), "E1", &verdict("h1", true, None))),
        Box::new(|| svc.review_evidence(&legal(), "E1", false)),
        Box::new(|| svc.update_anchor(&submitter(), "E1", "0xabc")),
        Box::new(|| svc.review_evidence(&legal(), "E1", true)),
    ];
    for step in steps {
        let record = step().expect("transition");
        assert_eq!(record.custody_log.len(), last_len + 1);
        last_len = record.custody_log.len();
    }
}

#[test]
fn repeated_export_leaves_record_untouched() {
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");
    svc.verify_integrity(&verifier(), "E1", &verdict("h1", true, None))
        .expect("verify");
    svc.review_evidence(&legal(), "E1", true).expect("review");

    let first = svc.export_evidence(&legal(), "E1").expect("export");
    let before = svc.get_evidence(&legal(), "E1").expect("get");
    let second = svc.export_evidence(&legal(), "E1").expect("export again");
    let after = svc.get_evidence(&legal(), "E1").expect("get");

    assert_eq!(first, second);
    assert_eq!(before, after);
    assert_eq!(svc.get_history(&legal(), "E1").expect("history").history.len(), 4);
}

#[test]
fn notes_and_comments_never_cross_organizations() {
    let svc = service();
    svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
        .expect("submit");
    svc.add_verification_note(
        &verifier(),
        "E1",
        NewVerificationNote {
            note_id: "shared-id".into(),
            content: "verifier only".into(),
            hash_comparison: "h1 == h1".into(),
        },
    )
    .expect("note");
    svc.add_legal_comment(
        &legal(),
        "E1",
        NewLegalComment {
            comment_id: "shared-id".into(),
            content: "legal only".into(),
            court_readiness: CourtReadiness::NeedsReview,
            recommendation: String::new(),
        },
    )
    .expect("comment");

    let comments = svc.get_legal_comments(&legal(), "E1").expect("comments");
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].content, "legal only");
    let notes = svc.get_verification_notes(&verifier(), "E1").expect("notes");
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].content, "verifier only");

    assert!(svc.get_legal_comments(&verifier(), "E1").is_err());
    assert!(svc.get_verification_notes(&submitter(), "E1").is_err());
}

#[test]
fn signed_bulk_submission_credits_one_fingerprint() {
    let svc = service();
    let key = SubmitterKey::generate();
    let items = ["B-1", "B-2", "B-3"]
        .iter()
        .map(|id| {
            let hash = format!("hash-{id}");
            let proof = key.prove(&hash);
            new_evidence(id, &hash, Some(proof))
        })
        .collect();

    let result = svc.submit_bulk(&submitter(), "BULK-7", items).expect("bulk");
    assert_eq!(result.evidence_ids, ["B-1", "B-2", "B-3"]);

    let second = svc.get_evidence(&legal(), "B-2").expect("get");
    assert_eq!(second.bulk.as_ref().map(|b| b.index), Some(1));
    assert_eq!(
        second.custody_log.entries()[0].description,
        "Bulk submission BULK-7 - item 2 of 3"
    );
    assert_eq!(
        svc.get_reputation(&submitter(), &key.fingerprint())
            .expect("reputation")
            .total_submissions,
        3
    );

    assert!(matches!(
        svc.submit_bulk(&submitter(), "BULK-8", Vec::new()),
        Err(CustodyError::Validation(_))
    ));
}

#[test]
fn state_and_ledger_survive_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let root = {
        let store = Arc::new(SledStore::open(dir.path()).expect("open"));
        let svc = service_with(store.clone());
        svc.submit_evidence(&submitter(), new_evidence("E1", "h1", None))
            .expect("submit");
        svc.verify_integrity(&verifier(), "E1", &verdict("h1", true, None))
            .expect("verify");
        store.flush().expect("flush");
        svc.ledger_root(&legal()).expect("root")
    };

    let svc = service_with(Arc::new(SledStore::open(dir.path()).expect("reopen")));
    assert_eq!(svc.ledger_root(&legal()).expect("root"), root);
    assert_eq!(
        svc.get_evidence(&legal(), "E1").expect("get").status,
        Status::Verified
    );
}
