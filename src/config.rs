use std::collections::HashMap;
use std::env;

use anyhow::{bail, Context};

use crate::access::OrgDirectory;
use crate::logging::LogFormat;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub log_level: String,
    pub log_format: LogFormat,
    /// 各角色对应的组织 ID
    pub orgs: OrgDirectory,
    /// Bearer token -> 组织 ID
    pub api_tokens: HashMap<String, String>,
    pub default_page_size: u32,
    pub max_page_size: u32,
    pub require_identity_proof: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 便于测试：从任意键值来源读取
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let defaults = OrgDirectory::default();

        let port = var("PORT", "3000")
            .parse()
            .context("PORT must be a number")?;
        let default_page_size: u32 = var("DEFAULT_PAGE_SIZE", "25")
            .parse()
            .context("DEFAULT_PAGE_SIZE must be a positive number")?;
        let max_page_size: u32 = var("MAX_PAGE_SIZE", "200")
            .parse()
            .context("MAX_PAGE_SIZE must be a positive number")?;
        if default_page_size == 0 || max_page_size == 0 {
            bail!("page sizes must be greater than zero");
        }

        Ok(Self {
            host: var("HOST", "0.0.0.0"),
            port,
            db_path: var("DB_PATH", "data/db/custody_db"),
            log_level: var("LOG_LEVEL", "info"),
            log_format: var("LOG_FORMAT", "human").parse()?,
            orgs: OrgDirectory {
                submitter: var("SUBMITTER_ORG_ID", &defaults.submitter),
                verifier: var("VERIFIER_ORG_ID", &defaults.verifier),
                legal: var("LEGAL_ORG_ID", &defaults.legal),
            },
            api_tokens: parse_tokens(&var("API_TOKENS", ""))?,
            default_page_size,
            max_page_size,
            require_identity_proof: parse_flag(&var("REQUIRE_IDENTITY_PROOF", "false"))?,
        })
    }
}

/// `token=orgId,token2=orgId2`
fn parse_tokens(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((token, org)) = pair.split_once('=') else {
            bail!("API_TOKENS entry '{pair}' must look like token=orgId");
        };
        let (token, org) = (token.trim(), org.trim());
        if token.is_empty() || org.is_empty() {
            bail!("API_TOKENS entry '{pair}' has an empty token or org id");
        }
        tokens.insert(token.to_string(), org.to_string());
    }
    Ok(tokens)
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => bail!("REQUIRE_IDENTITY_PROOF must be a boolean, got '{other}'"),
    }
}
