//! TOML configuration file schema and parsing.
//!
//! Example config file:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! log_format = "json"
//! public_base_url = "https://grab.example.com"
//! admin_token = "change-me"
//!
//! [defaults]
//! segment_batch_size = 8
//! direct_threshold_bytes = 20971520
//! primary_tool = "/usr/local/bin/yt-dlp"
//! spool_dir = "/var/lib/media-grab/spool"
//!
//! [grant]
//! secret = "a-long-random-string"
//! ttl_secs = 3600
//!
//! [[rate_limit]]
//! category = "conversion"
//! max_requests = 3
//! window_secs = 60
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use grab_core::{AdmissionControl, EndpointCategory, GrabConfig, RateLimitPolicy};

pub const GRANT_SECRET_ENV: &str = "GRAB_GRANT_SECRET";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub defaults: DefaultsConfig,

    #[serde(default)]
    pub grant: GrantConfig,

    #[serde(default)]
    pub rate_limit: Vec<RateLimitDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prefix for grant download URLs. Relative URLs are issued when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,

    #[serde(default)]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_format: default_log_format(),
            public_base_url: None,
            admin_token: None,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_log_format() -> String {
    "pretty".into()
}

/// Overrides for [`GrabConfig`]. Anything left out keeps the library default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DefaultsConfig {
    pub request_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub user_agent: Option<String>,
    pub segment_batch_size: Option<usize>,
    pub min_output_bytes: Option<u64>,
    pub direct_threshold_bytes: Option<u64>,
    pub primary_tool: Option<PathBuf>,
    pub fallback_tool: Option<PathBuf>,
    pub process_timeout_secs: Option<u64>,
    pub navigation_timeout_ms: Option<u64>,
    pub settle_timeout_ms: Option<u64>,
    pub session_pool_size: Option<usize>,
    pub temp_root: Option<PathBuf>,
    pub spool_dir: Option<PathBuf>,
}

impl DefaultsConfig {
    pub fn to_grab_config(&self) -> GrabConfig {
        let mut c = GrabConfig::default();
        if let Some(v) = self.request_timeout_ms {
            c = c.with_request_timeout(v);
        }
        if let Some(v) = self.max_retries {
            c = c.with_max_retries(v);
        }
        if let Some(v) = self.retry_backoff_ms {
            c = c.with_retry_backoff(v);
        }
        if let Some(ref v) = self.user_agent {
            c = c.with_user_agent(v.clone());
        }
        if let Some(v) = self.segment_batch_size {
            c = c.with_segment_batch_size(v);
        }
        if let Some(v) = self.min_output_bytes {
            c = c.with_min_output_bytes(v);
        }
        if let Some(v) = self.direct_threshold_bytes {
            c = c.with_direct_threshold_bytes(v);
        }
        if let Some(ref v) = self.primary_tool {
            c = c.with_primary_tool(v.clone());
        }
        if let Some(ref v) = self.fallback_tool {
            c = c.with_fallback_tool(v.clone());
        }
        if let Some(v) = self.process_timeout_secs {
            c = c.with_process_timeout(v);
        }
        if let Some(v) = self.navigation_timeout_ms {
            c = c.with_navigation_timeout(v);
        }
        if let Some(v) = self.settle_timeout_ms {
            c = c.with_settle_timeout(v);
        }
        if let Some(v) = self.session_pool_size {
            c = c.with_session_pool_size(v);
        }
        if let Some(ref v) = self.temp_root {
            c = c.with_temp_root(v.clone());
        }
        if let Some(ref v) = self.spool_dir {
            c = c.with_spool_dir(v.clone());
        }
        c
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrantConfig {
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_grant_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for GrantConfig {
    fn default() -> Self {
        Self {
            secret: None,
            ttl_secs: default_grant_ttl_secs(),
        }
    }
}

fn default_grant_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitDef {
    pub category: String,
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;

        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// Library configuration with the grant lifetime applied.
    pub fn grab_config(&self) -> GrabConfig {
        self.defaults.to_grab_config().with_grant_ttl(self.grant.ttl_secs)
    }

    /// Grant secret from the environment, else from the file.
    pub fn grant_secret(&self) -> Option<String> {
        std::env::var(GRANT_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.grant.secret.clone())
    }

    /// Admission control with the configured per-category overrides.
    /// Categories were checked by `validate`; unknown names are skipped.
    pub fn admission(&self) -> AdmissionControl {
        self.rate_limit
            .iter()
            .filter_map(|def| {
                let category = def.category.parse::<EndpointCategory>().ok()?;
                Some((category, RateLimitPolicy::new(def.max_requests, def.window_secs)))
            })
            .fold(AdmissionControl::default(), |admission, (category, policy)| {
                admission.with_policy(category, policy)
            })
    }

    fn validate(&self) -> Result<(), String> {
        match self.server.log_format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(format!(
                    "Invalid log_format '{}': must be 'pretty' or 'json'",
                    other
                ));
            }
        }

        if let Some(ref base) = self.server.public_base_url {
            let parsed = url::Url::parse(base)
                .map_err(|e| format!("Invalid public_base_url: {} ({})", base, e))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(format!("public_base_url must use http or https: {}", base));
            }
        }

        if matches!(self.server.admin_token.as_deref(), Some("")) {
            return Err("admin_token must not be empty when set".into());
        }

        if matches!(self.grant.secret.as_deref(), Some("")) {
            return Err("Grant secret must not be empty when set".into());
        }
        if self.grant.ttl_secs == 0 {
            return Err("Grant ttl_secs must be greater than zero".into());
        }

        if self.defaults.segment_batch_size == Some(0) {
            return Err("segment_batch_size must be greater than zero".into());
        }
        if self.defaults.session_pool_size == Some(0) {
            return Err("session_pool_size must be greater than zero".into());
        }

        let mut seen = HashSet::new();
        for (i, def) in self.rate_limit.iter().enumerate() {
            let category: EndpointCategory = def
                .category
                .parse()
                .map_err(|e| format!("Invalid rate_limit at index {}: {}", i, e))?;
            if !seen.insert(category) {
                return Err(format!("Duplicate rate_limit category: {}", category));
            }
            if def.max_requests == 0 {
                return Err(format!("rate_limit '{}' must allow at least one request", category));
            }
            if def.window_secs == 0 {
                return Err(format!("rate_limit '{}' window_secs must be greater than zero", category));
            }
        }

        Ok(())
    }
}
