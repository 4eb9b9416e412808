use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, ValueEnum};
use tracing::warn;

use superplane::{AesGcmEncryptor, EnforcerConfig, Encryptor, ExecutorConfig, NoOpEncryptor};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Superplane server configuration. Every flag falls back to an environment
/// variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "superplane", version, about = "Canvas-based delivery orchestration server")]
pub struct Config {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Maximum connections in the database pool
    #[arg(long, env = "DB_POOL_SIZE", default_value_t = 10)]
    pub db_pool_size: u32,

    /// Address the HTTP server binds to
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:8000")]
    pub http_addr: SocketAddr,

    /// Public URL used to build webhook addresses
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: String,

    /// Base64 AES-256 key for secrets and source keys
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Store secrets in the clear (development only)
    #[arg(long, env = "NO_ENCRYPTION")]
    pub no_encryption: bool,

    /// HMAC secret for session and execution tokens
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Override the built-in organization role template
    #[arg(long, env = "ORG_POLICY_TEMPLATE")]
    pub org_policy_template: Option<PathBuf>,

    /// Override the built-in canvas role template
    #[arg(long, env = "CANVAS_POLICY_TEMPLATE")]
    pub canvas_policy_template: Option<PathBuf>,

    /// Timeout for executor dispatch calls, in seconds
    #[arg(long, env = "EXECUTOR_TIMEOUT_SECS", default_value_t = 30)]
    pub executor_timeout_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Cache authorization decisions
    #[arg(long, env = "AUTHZ_CACHE", default_value_t = true, action = ArgAction::Set)]
    pub authz_cache: bool,
}

impl Config {
    pub fn encryptor(&self) -> anyhow::Result<Arc<dyn Encryptor>> {
        if self.no_encryption {
            warn!("encryption disabled, secrets are stored in the clear");
            return Ok(Arc::new(NoOpEncryptor));
        }
        let key = self
            .encryption_key
            .as_deref()
            .context("ENCRYPTION_KEY is required unless NO_ENCRYPTION is set")?;
        let encryptor = AesGcmEncryptor::from_base64(key).context("invalid ENCRYPTION_KEY")?;
        Ok(Arc::new(encryptor))
    }

    pub fn enforcer_config(&self) -> EnforcerConfig {
        EnforcerConfig {
            cache_enabled: self.authz_cache,
            org_template: self.org_policy_template.clone(),
            canvas_template: self.canvas_policy_template.clone(),
            ..Default::default()
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            timeout: Duration::from_secs(self.executor_timeout_secs),
        }
    }
}
