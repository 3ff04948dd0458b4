use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;
use hearth_agent::config::EnvLookup;

const DEFAULT_JWT_SECRET: &str = "dev-insecure-change-me";
const DEFAULT_SWEEP_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind: SocketAddr,
    pub jwt_secret: Vec<u8>,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub session_sweep_interval: Duration,
    pub allowed_origins: Vec<String>,
    pub console_log_dir: PathBuf,
}

impl ControlConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.jwt_secret == DEFAULT_JWT_SECRET.as_bytes()
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = EnvLookup::new(get);

        let bind = env
            .string("HEARTH_BIND")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid HEARTH_BIND: {bind}"))?;

        let jwt_secret = env
            .string("HEARTH_JWT_SECRET")
            .unwrap_or_else(|| DEFAULT_JWT_SECRET.to_string());

        // Dev-friendly defaults. Production should list its panel origins.
        let allowed_origins = env
            .string("HEARTH_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173,http://127.0.0.1:5173".to_string())
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Ok(Self {
            bind,
            jwt_secret: jwt_secret.into_bytes(),
            jwt_issuer: env
                .string("HEARTH_JWT_ISSUER")
                .unwrap_or_else(|| "hearth".to_string()),
            jwt_audience: env
                .string("HEARTH_JWT_AUDIENCE")
                .unwrap_or_else(|| "hearth-web".to_string()),
            session_sweep_interval: Duration::from_millis(
                env.u64("HEARTH_SESSION_SWEEP_MS")
                    .map(|v| v.clamp(1000, 60 * 60 * 1000))
                    .unwrap_or(DEFAULT_SWEEP_MS),
            ),
            allowed_origins,
            console_log_dir: PathBuf::from(
                env.string("HEARTH_CONSOLE_LOG_DIR")
                    .unwrap_or_else(|| "./data/logs".to_string()),
            ),
        })
    }
}
