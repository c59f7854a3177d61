//! 市场安全网关主入口

use market_guard::{
    config::AppConfig,
    db,
    handlers::health,
    middleware::AppState,
    repository::{PgAuditStore, PgUserRepository},
    routes, telemetry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let check_only = match std::env::args().nth(1).as_deref() {
        None => false,
        Some("--check-config") => true,
        Some("--version") => {
            println!("market-guard {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Some("--help") => {
            print_help();
            return Ok(());
        }
        Some(other) => {
            eprintln!("未知参数: {}", other);
            print_help();
            std::process::exit(2);
        }
    };

    // GUARD_ENV=staging 时只读 .env.staging；否则 .env.local 优先于 .env
    match std::env::var("GUARD_ENV") {
        Ok(env) => {
            dotenv::from_filename(format!(".env.{}", env)).ok();
        }
        Err(_) => {
            dotenv::from_filename(".env.local").ok();
            dotenv::dotenv().ok();
        }
    }

    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    if check_only {
        println!(
            "configuration ok: environment={} addr={} upload_root={}",
            config.server.environment,
            config.server.addr,
            config.upload.temp_dir.display()
        );
        return Ok(());
    }

    health::set_start_time();
    telemetry::init_telemetry(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.server.environment,
        "Market guard starting..."
    );

    // 迁移会校验审计表的只追加触发器
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;

    let users = Arc::new(PgUserRepository::new(db_pool.clone()));
    let audit_store = Arc::new(PgAuditStore::new(db_pool.clone()));
    let app_state = Arc::new(AppState::build(
        config.clone(),
        Some(db_pool),
        users,
        audit_store,
    )?);

    spawn_maintenance(app_state.clone());
    let app = routes::create_router(app_state.clone());

    let listener = TcpListener::bind(&config.server.addr).await?;
    tracing::info!(addr = %config.server.addr, "Market guard listening");

    // 需要连接地址解析客户端 IP
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(config.server.graceful_shutdown_timeout_secs))
    .await?;

    // 关闭前把回退队列中的审计事件再写一次
    let replayed = app_state.audit_service.replay_fallback().await;
    let pending = app_state.audit_service.pending_fallback().await;
    if pending > 0 {
        tracing::error!(pending, "Audit events still pending at shutdown");
    }

    tracing::info!(replayed, "Server shutdown complete");
    Ok(())
}

/// 内存状态 TTL 清理、审计过期清除、回退队列重放
fn spawn_maintenance(state: Arc<AppState>) {
    let sweep_state = state.clone();
    let sweep_every = Duration::from_secs(state.config.security.sweep_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = sweep_state.sweep();
            if removed > 0 {
                tracing::debug!(removed, "Swept idle security state");
            }
        }
    });

    let maintenance_every = Duration::from_secs(state.config.audit.maintenance_interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(maintenance_every);
        loop {
            ticker.tick().await;

            let replayed = state.audit_service.replay_fallback().await;
            if replayed > 0 {
                tracing::info!(replayed, "Replayed audit fallback queue");
            }

            match state.audit_service.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => tracing::info!(purged, "Purged expired audit events"),
                Err(e) => tracing::error!(error = %e, "Audit purge failed"),
            }
        }
    });
}

/// 收到 Ctrl+C 或 SIGTERM 后返回；超过宽限期仍未退出则强制结束进程
async fn shutdown_signal(timeout_secs: u64) {
    #[cfg(unix)]
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| tracing::error!(error = %e, "SIGTERM handler unavailable"))
        .ok();

    #[cfg(unix)]
    let terminated = async {
        match sigterm.as_mut() {
            Some(sig) => {
                sig.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminated = std::future::pending::<()>();

    let source = tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => "ctrl_c",
            Err(e) => {
                tracing::error!(error = %e, "Ctrl+C handler unavailable");
                std::future::pending::<&str>().await
            }
        },
        _ = terminated => "sigterm",
    };
    tracing::info!(signal = source, grace_secs = timeout_secs, "Shutting down");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        tracing::warn!("Shutdown grace period elapsed, exiting");
        std::process::exit(1);
    });
}

/// 打印帮助信息
fn print_help() {
    println!("market-guard {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: market-guard [选项]");
    println!();
    println!("选项:");
    println!("  --check-config  校验配置后退出");
    println!("  --version       打印版本信息并退出");
    println!("  --help          打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 GUARD_ 前缀的环境变量完成，例如");
    println!("  GUARD_DATABASE__URL, GUARD_SECURITY__JWT_SECRET, GUARD_SECURITY__ENCRYPTION_SECRET");
}
