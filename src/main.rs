use std::sync::Arc;

use custody_core::{
    access::{AccessControl, TokenDirectory},
    api,
    config::Config,
    logging,
    query::StoreQuery,
    sled_store::SledStore,
    store::RecordStore,
    CustodyService, ServiceOptions,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ----------------------------------------------------------------
    // 0. 加载配置 & 日志
    // ----------------------------------------------------------------
    let config = Config::from_env()?;
    logging::init_logging(config.log_format, &config.log_level)?;
    info!(
        host = %config.host,
        port = config.port,
        db = %config.db_path,
        "⚙️  配置加载完成"
    );

    // ----------------------------------------------------------------
    // 1. 存储 & 账本
    // ----------------------------------------------------------------
    let store: Arc<dyn RecordStore> = Arc::new(SledStore::open(&config.db_path)?);
    info!(
        ledger_root = store.ledger_root()?.as_deref().unwrap_or("<empty>"),
        "📚 保管链存储初始化完成"
    );

    // ----------------------------------------------------------------
    // 2. 身份 & 服务
    // ----------------------------------------------------------------
    if config.api_tokens.is_empty() {
        warn!("API_TOKENS 为空：所有请求都会被拒绝");
    }
    let resolver = Arc::new(TokenDirectory::new(config.api_tokens.clone()));
    let access = AccessControl::new(resolver, config.orgs.clone());
    let query = Arc::new(StoreQuery::new(
        store.clone(),
        config.default_page_size,
        config.max_page_size,
    ));
    let service = CustodyService::new(
        access,
        store,
        query,
        ServiceOptions {
            require_identity_proof: config.require_identity_proof,
        },
    );

    let shared_state = Arc::new(api::AppState {
        service: Arc::new(service),
    });

    // ----------------------------------------------------------------
    // 3. 启动 HTTP 服务
    // ----------------------------------------------------------------
    let app = api::app(shared_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("🚀 API 服务已运行在: http://{}", addr);
    info!("   - POST /evidence            : 匿名提交证据");
    info!("   - POST /evidence/:id/verify : 完整性验证");
    info!("   - POST /evidence/:id/export : 导出上庭证据包");
    info!("   - GET  /ledger/proof/:pos   : 获取账本包含性证明");

    axum::serve(listener, app).await?;

    Ok(())
}
