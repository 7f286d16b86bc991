//! Configuration handling for the listener binary.
//!
//! Settings come from a YAML file with an `engine:` section, a
//! `session_file:` path and optional `session:` overrides, then from
//! `MSGR_*` environment variables. The session file itself is JSON.

use anyhow::{Context, Result};
use msgr_health::RiskTier;
use msgr_session::{EngineConfig, SessionContext};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default location of the session file
pub const DEFAULT_SESSION_FILE: &str = "session.json";

/// Listener configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ListenConfig {
    /// Engine settings
    pub engine: EngineConfig,
    /// Path of the JSON session context
    pub session_file: PathBuf,
    /// Values layered over the loaded session context
    pub session: SessionOverrides,
    /// Probe the account over HTTP when listening stops for good
    pub account_probe: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            session_file: PathBuf::from(DEFAULT_SESSION_FILE),
            session: SessionOverrides::default(),
            account_probe: true,
        }
    }
}

/// Session context fields that configuration may override
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    /// HTTP proxy URL
    pub proxy: Option<String>,
    /// User agent
    pub user_agent: Option<String>,
    /// Region hint
    pub region: Option<String>,
    /// Risk tier
    pub risk_tier: Option<RiskTier>,
    /// Reconnect after failures
    pub auto_reconnect: Option<bool>,
}

impl SessionOverrides {
    /// Layer the overrides over a loaded context
    pub fn apply(&self, ctx: &mut SessionContext) {
        if let Some(proxy) = &self.proxy {
            ctx.proxy = Some(proxy.clone());
        }
        if let Some(user_agent) = &self.user_agent {
            ctx.user_agent = user_agent.clone();
        }
        if let Some(region) = &self.region {
            ctx.region = Some(region.clone());
        }
        if let Some(tier) = self.risk_tier {
            ctx.risk_tier = tier;
        }
        if let Some(auto_reconnect) = self.auto_reconnect {
            ctx.auto_reconnect = auto_reconnect;
        }
    }
}

/// Root structure of the YAML file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RootConfig {
    engine: Option<EngineConfig>,
    session_file: Option<PathBuf>,
    session: Option<SessionOverrides>,
    account_probe: Option<bool>,
}

impl ListenConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file means defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                config.apply_root_config(root);
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Final listener configuration: session_file={:?}, edge_host={}, region={:?}",
            config.session_file, config.engine.edge_host, config.engine.region
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        if let Some(engine) = root.engine {
            self.engine = engine;
        }
        if let Some(session_file) = root.session_file {
            self.session_file = session_file;
        }
        if let Some(session) = root.session {
            self.session = session;
        }
        if let Some(account_probe) = root.account_probe {
            self.account_probe = account_probe;
        }
    }

    fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `MSGR_*` overrides read through `lookup`
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(region) = lookup("MSGR_REGION") {
            info!("Region overridden by environment: {}", region);
            self.engine.region = Some(region);
        }

        if let Some(proxy) = lookup("MSGR_PROXY") {
            info!("Proxy overridden by environment");
            self.session.proxy = Some(proxy);
        }

        if let Some(user_agent) = lookup("MSGR_USER_AGENT") {
            self.session.user_agent = Some(user_agent);
        }

        if let Some(tier) = lookup("MSGR_RISK_TIER") {
            match tier.parse::<RiskTier>() {
                Ok(tier) => {
                    info!("Risk tier overridden by environment: {}", tier);
                    self.session.risk_tier = Some(tier);
                }
                Err(e) => warn!("Ignoring MSGR_RISK_TIER: {}", e),
            }
        }

        if let Some(value) = lookup("MSGR_AUTO_RECONNECT") {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" => self.session.auto_reconnect = Some(true),
                "0" | "false" | "no" => self.session.auto_reconnect = Some(false),
                other => warn!("Ignoring MSGR_AUTO_RECONNECT={}", other),
            }
        }

        if let Some(session_file) = lookup("MSGR_SESSION_FILE") {
            self.session_file = PathBuf::from(session_file);
        }
    }
}

/// Read a session context from its JSON file
pub fn load_session(path: &Path) -> Result<SessionContext> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read session file {:?}", path))?;
    let ctx: SessionContext = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse session file {:?}", path))?;
    Ok(ctx)
}

/// Rewrite the session file; goes through a temporary file and a rename
pub fn save_session(path: &Path, ctx: &SessionContext) -> Result<()> {
    let json = serde_json::to_string_pretty(ctx)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}
