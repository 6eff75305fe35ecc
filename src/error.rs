use thiserror::Error;

use crate::access::Capability;
use crate::evidence::Status;
use crate::store::StoreError;

/// 业务错误分类
///
/// 除 `Store` / `Codec` 外，每个变体都对应一种调用方可诊断的失败：
/// 信息里带上标识符与期望/实际状态，但绝不携带其他组织的私有内容。
#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("access denied: caller org '{caller}' lacks the {required} capability")]
    AccessDenied { caller: String, required: Capability },

    /// 身份解析失败，一律按拒绝处理 (fail-closed)
    #[error("access denied: identity resolution failed: {0}")]
    Identity(String),

    #[error("{kind} {id} does not exist")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error(
        "evidence {id} must be {} to {action}, current: {actual}",
        join_statuses(.required)
    )]
    InvalidState {
        id: String,
        action: &'static str,
        required: Vec<Status>,
        actual: Status,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CustodyError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists { kind, id: id.into() }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

fn join_statuses(statuses: &[Status]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

pub type CustodyResult<T> = Result<T, CustodyError>;
