//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
    /// 运行环境: development, staging, production
    pub environment: String,
}

impl ServerConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    /// 获取连接超时时间（秒）
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    /// JWT 签名密钥
    pub jwt_secret: Secret<String>,
    /// 字段加密主密钥（经 Argon2 派生为 256 位密钥）
    pub encryption_secret: Secret<String>,
    /// 匿名化哈希盐
    pub anonymization_salt: Secret<String>,
    /// 访问令牌过期时间（秒）
    pub access_token_exp_secs: u64,
    /// 每个 ip+user 每分钟最大请求数
    pub max_requests_per_minute: u32,
    /// 安全失败次数达到该值后标记 IP
    pub suspicious_ip_threshold: u32,
    /// 距离过期少于该秒数时要求刷新令牌
    pub token_refresh_window_secs: i64,
    /// 设备指纹不一致时是否直接拒绝
    pub strict_fingerprint: bool,
    /// 仅在部署于反向代理之后时打开；否则 X-Forwarded-For 可被客户端伪造
    pub trust_proxy: bool,
    /// 内存状态（限流窗口、指纹、失败计数）空闲淘汰时间（秒）
    pub state_ttl_secs: u64,
    /// 后台清理周期（秒）
    pub sweep_interval_secs: u64,
    /// 大额订单阈值（price * quantity）
    pub bulk_order_cutoff: f64,
    /// 大额订单所需信任分
    pub trusted_buyer_threshold: u8,
    /// 管理员允许写操作的路径前缀
    pub admin_write_allowlist: Vec<String>,
    /// 用户查询超时（毫秒）
    pub user_lookup_timeout_ms: u64,
    /// 账号删除申请的确认期限（天）
    pub deletion_grace_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// 审计事件保留天数（默认 7 年）
    pub retention_days: u32,
    /// 单次写入超时（毫秒）
    pub write_timeout_ms: u64,
    /// 写入失败重试次数
    pub write_retries: u32,
    /// 低风险成功事件是否异步写入
    pub defer_low_risk: bool,
    /// 过期事件清理与回退队列重放周期（秒）
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    pub min_size_bytes: u64,
    pub max_size_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    pub temp_dir: PathBuf,
    pub products_dir: PathBuf,
    pub profiles_dir: PathBuf,
    /// 每个上传者每分钟最大上传次数
    pub uploads_per_minute: u32,
    /// 单个请求最多文件数
    pub max_files_per_request: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    pub audit: AuditConfig,
    pub upload: UploadConfig,
}

impl AppConfig {
    /// 默认值 + GUARD_ 前缀环境变量
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::builder()
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("server.environment", "development")?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("security.jwt_secret", "change-this-secret-in-production-min-32-chars!")?
            .set_default(
                "security.encryption_secret",
                "change-this-encryption-secret-min-32-chars!",
            )?
            .set_default("security.anonymization_salt", "market-guard-anonymization")?
            .set_default("security.access_token_exp_secs", 3600)?
            .set_default("security.max_requests_per_minute", 60)?
            .set_default("security.suspicious_ip_threshold", 10)?
            .set_default("security.token_refresh_window_secs", 300)?
            .set_default("security.strict_fingerprint", false)?
            .set_default("security.trust_proxy", false)?
            .set_default("security.state_ttl_secs", 3600)?
            .set_default("security.deletion_grace_days", 30)?
            .set_default("security.sweep_interval_secs", 60)?
            .set_default("security.bulk_order_cutoff", 50000.0)?
            .set_default("security.trusted_buyer_threshold", 70)?
            .set_default(
                "security.admin_write_allowlist",
                vec![
                    "/api/v1/admin/security".to_string(),
                    "/api/v1/ml/audit".to_string(),
                    "/api/v1/ml/alerts/trigger".to_string(),
                ],
            )?
            .set_default("security.user_lookup_timeout_ms", 2000)?
            .set_default("audit.retention_days", 2555)?
            .set_default("audit.write_timeout_ms", 3000)?
            .set_default("audit.write_retries", 2)?
            .set_default("audit.defer_low_risk", true)?
            .set_default("audit.maintenance_interval_secs", 300)?
            .set_default("upload.min_size_bytes", 1024)?
            .set_default("upload.max_size_bytes", 5 * 1024 * 1024)?
            .set_default(
                "upload.allowed_extensions",
                vec!["jpg", "jpeg", "png", "webp"]
                    .into_iter()
                    .map(String::from)
                    .collect::<Vec<_>>(),
            )?
            .set_default(
                "upload.allowed_mime_types",
                vec!["image/jpeg", "image/jpg", "image/png", "image/webp"]
                    .into_iter()
                    .map(String::from)
                    .collect::<Vec<_>>(),
            )?
            .set_default("upload.temp_dir", "uploads/temp")?
            .set_default("upload.products_dir", "uploads/products")?
            .set_default("upload.profiles_dir", "uploads/profiles")?
            .set_default("upload.uploads_per_minute", 10)?
            .set_default("upload.max_files_per_request", 5)?;

        // GUARD_SECTION__KEY 覆盖默认值，列表用逗号分隔
        let config: AppConfig = defaults
            .add_source(
                Environment::with_prefix("GUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("security.admin_write_allowlist")
                    .with_list_parse_key("upload.allowed_extensions")
                    .with_list_parse_key("upload.allowed_mime_types")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate().map(|()| config)
    }

    /// 校验取值范围；任一项不合法即拒绝启动
    pub fn validate(&self) -> Result<(), ConfigError> {
        one_of("logging.level", &self.logging.level, &["trace", "debug", "info", "warn", "error"])?;
        one_of("logging.format", &self.logging.format, &["json", "pretty"])?;
        one_of(
            "server.environment",
            &self.server.environment,
            &["development", "staging", "production"],
        )?;

        let security = &self.security;
        let upload = &self.upload;
        let rules = [
            (
                self.database.min_connections <= self.database.max_connections,
                "database.min_connections exceeds database.max_connections",
            ),
            (
                security.jwt_secret.expose_secret().len() >= MIN_SECRET_LEN,
                "security.jwt_secret is shorter than 32 bytes",
            ),
            (
                security.encryption_secret.expose_secret().len() >= MIN_SECRET_LEN,
                "security.encryption_secret is shorter than 32 bytes",
            ),
            (security.max_requests_per_minute > 0, "security.max_requests_per_minute is 0"),
            (security.suspicious_ip_threshold > 0, "security.suspicious_ip_threshold is 0"),
            (security.deletion_grace_days > 0, "security.deletion_grace_days is 0"),
            (
                security.trusted_buyer_threshold <= 100,
                "security.trusted_buyer_threshold is above 100",
            ),
            (self.audit.retention_days > 0, "audit.retention_days is 0"),
            (
                upload.min_size_bytes < upload.max_size_bytes,
                "upload.min_size_bytes must be below upload.max_size_bytes",
            ),
            (upload.uploads_per_minute > 0, "upload.uploads_per_minute is 0"),
        ];

        match rules.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(ConfigError::Message(reason.to_string())),
            None => Ok(()),
        }
    }
}

const MIN_SECRET_LEN: usize = 32;

fn one_of(key: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        Ok(())
    } else {
        Err(ConfigError::Message(format!(
            "{} = {:?} is not one of {}",
            key,
            value,
            allowed.join("/")
        )))
    }
}
