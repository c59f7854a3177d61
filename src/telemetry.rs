//! 结构化日志初始化
//! `audit_fallback` 目标是审计存储写入失败时的备用通道，任何过滤级别下都保留

use crate::config::AppConfig;
use tracing_subscriber::{
    filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
    EnvFilter, Layer,
};

const AUDIT_FALLBACK_DIRECTIVE: &str = "audit_fallback=error";

fn build_filter(default_level: &str) -> EnvFilter {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match AUDIT_FALLBACK_DIRECTIVE.parse::<Directive>() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

pub fn init_telemetry(config: &AppConfig) {
    let fmt_layer = if config.logging.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().pretty().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(build_filter(&config.logging.level))
        .with(fmt_layer)
        .init();

    tracing::info!(
        level = %config.logging.level,
        format = %config.logging.format,
        environment = %config.server.environment,
        "Telemetry initialized"
    );
}
