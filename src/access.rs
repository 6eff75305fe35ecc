use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CustodyError;
use crate::store::Partition;

/// 参与保管链的三个组织角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Org {
    Submitter,
    Verifier,
    Legal,
}

/// 每个操作声明自己需要的能力集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Submission,
    Verification,
    Legal,
    /// 三个组织任意其一
    Any,
}

impl Capability {
    pub fn admits(&self, org: Org) -> bool {
        match self {
            Capability::Submission => org == Org::Submitter,
            Capability::Verification => org == Org::Verifier,
            Capability::Legal => org == Org::Legal,
            Capability::Any => true,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Submission => "submission",
            Capability::Verification => "verification",
            Capability::Legal => "legal",
            Capability::Any => "any-org",
        })
    }
}

// ==========================================
// 身份协作方 (Identity collaborator)
// ==========================================

/// 调用上下文
///
/// 只携带不透明凭证。这里刻意没有“组织”字段：组织只能由解析器给出。
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    credential: Option<String>,
}

impl CallContext {
    pub fn with_credential(credential: impl Into<String>) -> Self {
        Self {
            credential: Some(credential.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }
}

/// 把调用上下文解析成组织 ID；失败即拒绝
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, ctx: &CallContext) -> Result<String, CustodyError>;
}

/// 基于 Bearer Token 的解析器 (token -> 组织 ID)
#[derive(Debug, Clone, Default)]
pub struct TokenDirectory {
    tokens: HashMap<String, String>,
}

impl TokenDirectory {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for TokenDirectory {
    fn resolve(&self, ctx: &CallContext) -> Result<String, CustodyError> {
        let token = ctx
            .credential()
            .ok_or_else(|| CustodyError::Identity("no credential presented".into()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CustodyError::Identity("unrecognised credential".into()))
    }
}

/// 组织 ID 与角色的对应表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgDirectory {
    pub submitter: String,
    pub verifier: String,
    pub legal: String,
}

impl OrgDirectory {
    pub fn role_of(&self, org_id: &str) -> Option<Org> {
        if org_id == self.submitter {
            Some(Org::Submitter)
        } else if org_id == self.verifier {
            Some(Org::Verifier)
        } else if org_id == self.legal {
            Some(Org::Legal)
        } else {
            None
        }
    }

    pub fn org_id(&self, org: Org) -> &str {
        match org {
            Org::Submitter => &self.submitter,
            Org::Verifier => &self.verifier,
            Org::Legal => &self.legal,
        }
    }
}

impl Default for OrgDirectory {
    fn default() -> Self {
        Self {
            submitter: "SubmitterOrg".into(),
            verifier: "VerifierOrg".into(),
            legal: "LegalOrg".into(),
        }
    }
}

// ==========================================
// 授权凭据 (Grant)
// ==========================================

/// 通过能力检查后得到的凭据
///
/// 私有分区只能从这里取得：授权与分区选择在同一处完成，
/// 持有验证方凭据的操作拿不到法务方的分区。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    org: Org,
    org_id: String,
}

impl Grant {
    pub fn org(&self) -> Org {
        self.org
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn private_partition(&self) -> Partition {
        match self.org {
            Org::Submitter => Partition::SubmitterPrivate,
            Org::Verifier => Partition::VerifierPrivate,
            Org::Legal => Partition::LegalPrivate,
        }
    }
}

#[derive(Clone)]
pub struct AccessControl {
    resolver: Arc<dyn IdentityResolver>,
    directory: OrgDirectory,
}

impl AccessControl {
    pub fn new(resolver: Arc<dyn IdentityResolver>, directory: OrgDirectory) -> Self {
        Self {
            resolver,
            directory,
        }
    }

    /// 在读写任何状态之前调用
    pub fn authorize(&self, ctx: &CallContext, required: Capability) -> Result<Grant, CustodyError> {
        let org_id = self.resolver.resolve(ctx)?;
        match self.directory.role_of(&org_id) {
            Some(org) if required.admits(org) => Ok(Grant { org, org_id }),
            _ => Err(CustodyError::AccessDenied {
                caller: org_id,
                required,
            }),
        }
    }

    pub fn directory(&self) -> &OrgDirectory {
        &self.directory
    }
}
